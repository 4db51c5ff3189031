//! The data-source framework.
//!
//! A source is anything that contributes data blocks to tells. Sources carry
//! identity, lifecycle status, and a run-restriction policy; the
//! [`Sourcer`] runs them in a fixed, semantically meaningful order and
//! isolates each source's failures so one external outage never blocks the
//! others. Each source is also represented as a tell of its own, so run
//! status shares the registry's storage substrate.

pub mod initialization;
pub mod socializer;
pub mod tool_yaml;
pub mod user_info;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::config::{Category, APP_USERNAME};
use crate::error::{Result, TellusError};
use crate::tell::{DataBlock, Tell};
use crate::teller::Teller;

/// Alias prefix for the tells that track source status.
pub const SOURCE_TELL_PREFIX: &str = "tellus-source-";

/// How often the orchestrator re-runs all sources.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3600);

/// Lifecycle status of a source. Re-entrant: a source can be run again from
/// any terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    NotRun,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceStatus::NotRun => "Not Run",
            SourceStatus::Running => "Running",
            SourceStatus::Completed => "Completed",
            SourceStatus::Failed => "Failed",
        })
    }
}

/// Restricts when a scheduler should run a source. Advisory, not an enforced
/// mutex: a direct re-invocation is not blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunRestriction {
    #[default]
    None,
    OnStartup,
}

/// Identity and run state shared by every source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    source_id: String,
    description: String,
    display_name: String,
    run_restriction: RunRestriction,
    status: SourceStatus,
    last_run: Option<DateTime<Utc>>,
    last_run_message: String,
}

impl SourceInfo {
    /// A source's id must itself be a valid tell alias.
    pub fn new(source_id: &str, description: &str) -> Result<SourceInfo> {
        let clean = Tell::clean_alias(source_id)?;
        if clean != source_id {
            return Err(TellusError::InvalidAlias {
                alias: source_id.to_string(),
                reason: "Sources must have an id that can be a valid tell alias.".to_string(),
            });
        }
        Ok(SourceInfo {
            source_id: source_id.to_string(),
            description: description.to_string(),
            display_name: source_id.to_string(),
            run_restriction: RunRestriction::None,
            status: SourceStatus::NotRun,
            last_run: None,
            last_run_message: SourceStatus::NotRun.to_string(),
        })
    }

    pub fn with_display_name(mut self, display_name: &str) -> SourceInfo {
        self.display_name = display_name.to_string();
        self
    }

    pub fn with_run_restriction(mut self, restriction: RunRestriction) -> SourceInfo {
        self.run_restriction = restriction;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn run_restriction(&self) -> RunRestriction {
        self.run_restriction
    }

    pub fn status(&self) -> SourceStatus {
        self.status
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn last_run_message(&self) -> &str {
        &self.last_run_message
    }

    /// The alias of the tell tracking this source's status.
    pub fn source_tell_alias(&self) -> String {
        format!("{SOURCE_TELL_PREFIX}{}", self.source_id)
    }

    /// Whether a scheduler should run this source now.
    pub fn should_run(&self) -> bool {
        !(self.run_restriction == RunRestriction::OnStartup && self.last_run.is_some())
    }

    pub fn status_starting(&mut self) {
        self.last_run = Some(Utc::now());
        self.last_run_message = "Currently running...".to_string();
        self.status = SourceStatus::Running;
    }

    pub fn status_failed(&mut self, message: &str) {
        self.last_run_message = message.to_string();
        self.status = SourceStatus::Failed;
    }

    pub fn status_complete(&mut self, message: &str) {
        self.last_run_message = message.to_string();
        self.status = SourceStatus::Completed;
    }

    pub fn load_completed(&self) -> bool {
        self.status == SourceStatus::Completed
    }

    pub fn load_failed(&self) -> bool {
        self.status == SourceStatus::Failed
    }

    pub fn to_json(&self) -> Value {
        json!({
            "source_id": self.source_id,
            "description": self.description,
            "display_name": self.display_name,
            "last_run": self.last_run.map(|at| at.to_rfc3339()),
            "last_run_message": self.last_run_message,
            "status": self.status.to_string(),
        })
    }

    /// The data block mirrored onto the source's own tell after each run.
    fn to_block(&self) -> DataBlock {
        let mut block = DataBlock::new();
        block.insert("description".to_string(), json!(self.description));
        block.insert("display-name".to_string(), json!(self.display_name));
        block.insert("status".to_string(), json!(self.status.to_string()));
        block.insert(
            "last-run".to_string(),
            json!(self.last_run.map(|at| at.to_rfc3339())),
        );
        block.insert(
            "last-run-message".to_string(),
            json!(self.last_run_message),
        );
        block
    }
}

/// The contract every data provider satisfies.
#[async_trait]
pub trait Source: Send + Sync {
    fn info(&self) -> &SourceInfo;

    fn info_mut(&mut self) -> &mut SourceInfo;

    /// Load the source. Called through the orchestrator, which handles
    /// status transitions and failure isolation. Returns a message describing
    /// the load results.
    async fn load(&mut self) -> anyhow::Result<String>;
}

/// Runs sources in priority order, isolating per-source failures.
///
/// Order is caller-supplied and semantically meaningful: earlier sources
/// establish baseline data that later sources refine.
pub struct Sourcer {
    teller: Arc<RwLock<Teller>>,
    sources: IndexMap<String, Box<dyn Source>>,
    runs: u64,
}

impl Sourcer {
    /// Duplicate source ids are fatal at construction.
    pub fn new(
        teller: Arc<RwLock<Teller>>,
        enabled_sources: Vec<Box<dyn Source>>,
    ) -> Result<Sourcer> {
        let mut sources: IndexMap<String, Box<dyn Source>> = IndexMap::new();
        for source in enabled_sources {
            let source_id = source.info().source_id().to_string();
            if sources.contains_key(&source_id) {
                return Err(TellusError::DuplicateSource(source_id));
            }
            sources.insert(source_id, source);
        }

        let sourcer = Sourcer {
            teller,
            sources,
            runs: 0,
        };
        log::info!(
            "The following sources are enabled: {:?}",
            sourcer.active_source_ids()
        );
        Ok(sourcer)
    }

    pub fn active_source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Info about every active source, for the sources endpoint.
    pub fn active_source_info(&self) -> Value {
        let mut info = serde_json::Map::new();
        for (source_id, source) in &self.sources {
            info.insert(source_id.clone(), source.info().to_json());
        }
        Value::Object(info)
    }

    pub fn info_for(&self, source_id: &str) -> Result<&SourceInfo> {
        self.sources
            .get(source_id)
            .map(|source| source.info())
            .ok_or_else(|| TellusError::NoSuchSource(source_id.to_string()))
    }

    /// Run every source, in order. A source whose run restriction advises
    /// against running again is skipped; a failing source is recorded as
    /// failed and never aborts its siblings.
    pub async fn run_all(&mut self) {
        self.runs += 1;
        log::info!("SOURCER RUN {} STARTING.", self.runs);
        for index in 0..self.sources.len() {
            if let Some((_, source)) = self.sources.get_index_mut(index) {
                if !source.info().should_run() {
                    let info = source.info();
                    log::info!(
                        "'{}' source will not load, as it has a run restriction of {:?}. \
                         Last run was: {:?}",
                        info.source_id(),
                        info.run_restriction(),
                        info.last_run()
                    );
                    continue;
                }
                Sourcer::run_load(source.as_mut()).await;
                let info = source.info().clone();
                self.record_run(&info).await;
            }
        }
        log::info!(
            "SOURCER RUN {} COMPLETE. All enabled sources loaded.",
            self.runs
        );
    }

    /// Run a single source by id. Run restrictions are advisory for
    /// schedulers; a direct invocation always runs the source.
    pub async fn run_one(&mut self, source_id: &str) -> Result<String> {
        let source = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| TellusError::NoSuchSource(source_id.to_string()))?;
        let message = Sourcer::run_load(source.as_mut()).await;
        let info = source.info().clone();
        self.record_run(&info).await;
        Ok(message)
    }

    /// Common setup and teardown around one source load. Any error from the
    /// source is captured into a failed status; it must never propagate.
    async fn run_load(source: &mut dyn Source) -> String {
        let source_id = source.info().source_id().to_string();
        log::info!("SOURCE: '{source_id}' - starting load");
        source.info_mut().status_starting();

        match source.load().await {
            Ok(message) => {
                let message = if message.is_empty() {
                    SourceStatus::Completed.to_string()
                } else {
                    message
                };
                source.info_mut().status_complete(&message);
                log::info!("SOURCE '{source_id}' - load complete: {message}");
                message
            }
            Err(error) => {
                let message =
                    format!("'{source_id}' source failed to load, with error: {error:#}");
                source.info_mut().status_failed(&message);
                log::error!("{message}");
                message
            }
        }
    }

    /// Mirror a source's run state into its own tell, so status shares the
    /// registry's storage substrate.
    async fn record_run(&self, info: &SourceInfo) {
        let mut teller = self.teller.write().await;
        let alias = info.source_tell_alias();
        match teller.get_or_create_tell(&alias, Category::Internal, APP_USERNAME) {
            Ok(tell) => {
                tell.update_data_from_source(info.source_id(), info.to_block(), None, true);
            }
            Err(error) => {
                log::error!("Unable to record run state for source '{alias}': {error}");
            }
        }
    }
}

/// Re-run all sources on a fixed interval. Problems inside a run are already
/// isolated per-source; the schedule itself keeps going regardless.
pub fn start_periodic_loads(
    sourcer: Arc<Mutex<Sourcer>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    log::info!(
        "Scheduling source reloads every {} seconds.",
        period.as_secs()
    );
    if period < DEFAULT_PERIOD {
        log::warn!(
            "The period is less than the default period of {} seconds. Be advised.",
            DEFAULT_PERIOD.as_secs()
        );
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            sourcer.lock().await.run_all().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        info: SourceInfo,
        fail: bool,
        loads: u64,
    }

    impl FakeSource {
        fn boxed(source_id: &str, fail: bool) -> Box<dyn Source> {
            Box::new(FakeSource {
                info: SourceInfo::new(source_id, "a test source").unwrap(),
                fail,
                loads: 0,
            })
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn info_mut(&mut self) -> &mut SourceInfo {
            &mut self.info
        }

        async fn load(&mut self) -> anyhow::Result<String> {
            self.loads += 1;
            if self.fail {
                anyhow::bail!("the external system is down");
            }
            Ok(format!("loaded {} times", self.loads))
        }
    }

    fn shared_teller() -> Arc<RwLock<Teller>> {
        Arc::new(RwLock::new(Teller::transient()))
    }

    #[test]
    fn test_source_id_must_be_a_valid_alias() {
        assert!(SourceInfo::new("good-source", "fine").is_ok());
        assert!(SourceInfo::new("Bad Source!", "nope").is_err());
        assert!(SourceInfo::new("x", "too short").is_err());
    }

    #[test]
    fn test_duplicate_source_ids_are_fatal() {
        let result = Sourcer::new(
            shared_teller(),
            vec![
                FakeSource::boxed("same-id", false),
                FakeSource::boxed("same-id", false),
            ],
        );
        assert!(matches!(result, Err(TellusError::DuplicateSource(id)) if id == "same-id"));
    }

    #[tokio::test]
    async fn test_one_failing_source_never_blocks_its_siblings() {
        let teller = shared_teller();
        let mut sourcer = Sourcer::new(
            teller,
            vec![
                FakeSource::boxed("first", false),
                FakeSource::boxed("second", true),
                FakeSource::boxed("third", false),
            ],
        )
        .unwrap();

        sourcer.run_all().await;

        assert_eq!(
            sourcer.info_for("first").unwrap().status(),
            SourceStatus::Completed
        );
        assert_eq!(
            sourcer.info_for("second").unwrap().status(),
            SourceStatus::Failed
        );
        assert_eq!(
            sourcer.info_for("third").unwrap().status(),
            SourceStatus::Completed
        );
        assert!(sourcer
            .info_for("second")
            .unwrap()
            .last_run_message()
            .contains("the external system is down"));
    }

    #[tokio::test]
    async fn test_on_startup_restriction_is_advisory() {
        let teller = shared_teller();
        let mut sourcer = Sourcer::new(
            teller,
            vec![Box::new(FakeSource {
                info: SourceInfo::new("once-only", "runs once")
                    .unwrap()
                    .with_run_restriction(RunRestriction::OnStartup),
                fail: false,
                loads: 0,
            })],
        )
        .unwrap();

        sourcer.run_all().await;
        assert_eq!(
            sourcer.info_for("once-only").unwrap().status(),
            SourceStatus::Completed
        );
        assert_eq!(
            sourcer.info_for("once-only").unwrap().last_run_message(),
            "loaded 1 times"
        );
        assert!(!sourcer.info_for("once-only").unwrap().should_run());

        // A second orchestrated run skips the load, leaving status intact.
        sourcer.run_all().await;
        assert_eq!(
            sourcer.info_for("once-only").unwrap().last_run_message(),
            "loaded 1 times"
        );

        // A direct invocation is not blocked by the restriction.
        let message = sourcer.run_one("once-only").await.unwrap();
        assert_eq!(message, "loaded 2 times");
    }

    #[tokio::test]
    async fn test_runs_record_status_into_a_source_tell() {
        let teller = shared_teller();
        let mut sourcer = Sourcer::new(
            Arc::clone(&teller),
            vec![FakeSource::boxed("tracked", false)],
        )
        .unwrap();
        sourcer.run_all().await;

        let teller = teller.read().await;
        let tell = teller.get("tellus-source-tracked").unwrap();
        assert!(tell.in_category(Category::Internal));
        assert_eq!(
            tell.get_datum("tracked", "status"),
            Some(&serde_json::json!("Completed"))
        );
    }

    #[tokio::test]
    async fn test_run_one_unknown_source() {
        let mut sourcer = Sourcer::new(shared_teller(), vec![]).unwrap();
        assert!(matches!(
            sourcer.run_one("ghost-source").await,
            Err(TellusError::NoSuchSource(_))
        ));
    }
}
