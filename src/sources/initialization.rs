//! Startup initialization source.
//!
//! A special source that seeds the default internal tells (the "About" tell)
//! and runs one-shot data migrations between versions. Each migration is
//! recorded in the source's own tell, so it runs at most once per save file.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::{self, Category, ABOUT_TELL_ALIAS, APP_USERNAME};
use crate::error::Result;
use crate::sources::{RunRestriction, Source, SourceInfo};
use crate::teller::Teller;

pub const SOURCE_ID: &str = "data-migration";

const ABOUT_DESCRIPTION: &str = "About tellus.";

/// A one-shot data migration, applied to the whole registry.
pub struct Migration {
    pub name: &'static str,
    pub run: fn(&mut Teller) -> Result<()>,
}

/// Seeds default tells and applies pending migrations. Usually restricted to
/// run once, on startup.
pub struct InitializationSource {
    info: SourceInfo,
    teller: Arc<RwLock<Teller>>,
    migrations: Vec<Migration>,
    migrations_run: usize,
}

impl InitializationSource {
    pub fn new(teller: Arc<RwLock<Teller>>) -> Result<InitializationSource> {
        InitializationSource::with_migrations(teller, Vec::new())
    }

    /// Override the active migration list, mostly for testing.
    pub fn with_migrations(
        teller: Arc<RwLock<Teller>>,
        migrations: Vec<Migration>,
    ) -> Result<InitializationSource> {
        let info = SourceInfo::new(
            SOURCE_ID,
            "A special source for managing and migrating tellus data between versions.",
        )?
        .with_display_name("Data Migration")
        .with_run_restriction(RunRestriction::OnStartup);
        Ok(InitializationSource {
            info,
            teller,
            migrations,
            migrations_run: 0,
        })
    }

    /// Make sure the "About" tell exists and carries the app tag. Returns
    /// true when anything changed.
    fn verify_or_create_about_tell(&self, teller: &mut Teller) -> Result<bool> {
        if !teller.has_tell(ABOUT_TELL_ALIAS) {
            log::info!(
                "There is currently no 'About' tell ({ABOUT_TELL_ALIAS}). Creating one."
            );
            teller.create_tell_with(
                ABOUT_TELL_ALIAS,
                Category::Go,
                SOURCE_ID,
                Some(&config::ui_route_to_tell(ABOUT_TELL_ALIAS)),
                Some(ABOUT_DESCRIPTION),
            )?;
        }

        let about = teller.get_mut(ABOUT_TELL_ALIAS)?;
        if !about.has_tag(APP_USERNAME) {
            about.add_tag(APP_USERNAME);
            return Ok(true);
        }
        Ok(false)
    }

    fn run_migrations(&mut self, teller: &mut Teller) -> Result<()> {
        if self.migrations.is_empty() {
            log::info!("No current migrations specified. Nothing for the migration source to run.");
            return Ok(());
        }

        let ledger_alias = self.info.source_tell_alias();
        for migration in &self.migrations {
            let already_run = teller
                .get(&ledger_alias)
                .ok()
                .and_then(|tell| tell.get_data(migration.name).cloned())
                .is_some();
            if already_run {
                log::info!(
                    "Migration {} has already been run. Migrations will only be run once.",
                    migration.name
                );
                continue;
            }

            log::info!("Running {}", migration.name);
            (migration.run)(teller)?;
            let ledger = teller.get_or_create_tell(&ledger_alias, Category::Internal, APP_USERNAME)?;
            ledger.update_datum_from_source(
                migration.name,
                "Completed At",
                json!(Utc::now().to_rfc3339()),
                None,
            );
            log::info!("{} complete.", migration.name);
            self.migrations_run += 1;
        }

        teller.persist()?;
        log::info!(
            "Migrations complete - have run {} of {} migrations since startup.",
            self.migrations_run,
            self.migrations.len()
        );
        Ok(())
    }

    pub fn migrations_run(&self) -> usize {
        self.migrations_run
    }
}

#[async_trait]
impl Source for InitializationSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut SourceInfo {
        &mut self.info
    }

    async fn load(&mut self) -> anyhow::Result<String> {
        let teller = Arc::clone(&self.teller);
        let mut teller = teller.write().await;

        if self.verify_or_create_about_tell(&mut teller)? {
            teller.persist()?;
        }
        self.run_migrations(&mut teller)?;

        Ok(format!(
            "Initialization complete; {} migrations run.",
            self.migrations_run
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Sourcer;

    fn shared_teller() -> Arc<RwLock<Teller>> {
        Arc::new(RwLock::new(Teller::transient()))
    }

    #[tokio::test]
    async fn test_creates_the_about_tell() {
        let teller = shared_teller();
        let mut source = InitializationSource::new(Arc::clone(&teller)).unwrap();
        source.load().await.unwrap();

        let teller = teller.read().await;
        let about = teller.get(ABOUT_TELL_ALIAS).unwrap();
        assert!(about.in_category(Category::Go));
        assert_eq!(about.description(), Some(ABOUT_DESCRIPTION));
        assert!(about.has_tag(APP_USERNAME));
    }

    #[tokio::test]
    async fn test_about_tell_is_left_alone_when_present() {
        let teller = shared_teller();
        {
            let mut teller = teller.write().await;
            let about = teller
                .create_tell_with(
                    ABOUT_TELL_ALIAS,
                    Category::Go,
                    "someone",
                    Some("http://custom"),
                    None,
                )
                .unwrap();
            about.add_tag(APP_USERNAME);
        }

        let mut source = InitializationSource::new(Arc::clone(&teller)).unwrap();
        source.load().await.unwrap();

        let teller = teller.read().await;
        assert_eq!(
            teller.get(ABOUT_TELL_ALIAS).unwrap().go_url().as_deref(),
            Some("http://custom")
        );
    }

    fn tag_everything(teller: &mut Teller) -> Result<()> {
        let aliases: Vec<String> = teller.aliases().iter().map(|a| a.to_string()).collect();
        for alias in aliases {
            teller.get_mut(&alias)?.add_tag("migrated");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_migrations_run_once_and_are_recorded() {
        let teller = shared_teller();
        teller
            .write()
            .await
            .create_tell("existing", Category::Testing, "t")
            .unwrap();

        let migrations = vec![Migration {
            name: "tag-everything-2021-05",
            run: tag_everything,
        }];
        let mut source =
            InitializationSource::with_migrations(Arc::clone(&teller), migrations).unwrap();

        source.load().await.unwrap();
        assert_eq!(source.migrations_run(), 1);
        {
            let teller = teller.read().await;
            assert!(teller.get("existing").unwrap().has_tag("migrated"));
            let ledger = teller.get("tellus-source-data-migration").unwrap();
            assert!(ledger.get_data("tag-everything-2021-05").is_some());
        }

        // Running again finds the ledger entry and skips the migration.
        source.load().await.unwrap();
        assert_eq!(source.migrations_run(), 1);
    }

    #[tokio::test]
    async fn test_run_restriction_defers_to_the_orchestrator() {
        let teller = shared_teller();
        let source = InitializationSource::new(Arc::clone(&teller)).unwrap();
        let mut sourcer = Sourcer::new(Arc::clone(&teller), vec![Box::new(source)]).unwrap();

        sourcer.run_all().await;
        assert!(!sourcer.info_for(SOURCE_ID).unwrap().should_run());
    }
}
