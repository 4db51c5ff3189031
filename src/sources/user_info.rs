//! User directory source.
//!
//! Connects user tells with information about the people behind them: the
//! externally authorized roster, profile fields, and links to their pages in
//! other systems. The directory itself sits behind an injected provider;
//! this source owns provisioning, probing, and promotion into the primary
//! user-info block.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::sources::{Source, SourceInfo};
use crate::teller::Teller;
use crate::users::{User, UserManager, AVATAR_URL, PHONE, USER_INFO_DATA};

/// Matches the user-info data block name, so this source's writes land in
/// the primary user-info block.
pub const SOURCE_ID: &str = USER_INFO_DATA;

/// How long a profile-URL liveness probe may take.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Profile fields a directory can supply for a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
}

/// The directory the organization authorizes users against.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Every externally valid username.
    async fn valid_usernames(&self) -> anyhow::Result<Vec<String>>;

    /// The profile for one user, if the directory has one.
    async fn profile(&self, username: &str) -> anyhow::Result<Option<UserProfile>>;

    /// Candidate (system name, URL) pairs for the user's pages in other
    /// systems; only reachable ones are recorded.
    fn profile_urls(&self, _username: &str) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Ping a URL and see if it is active: a basic bounded-wait check, counted
/// available when it returns 200 with a non-empty body.
pub async fn is_url_available(url: &str, timeout: Duration) -> bool {
    log::debug!("Checking if address '{url}' is available.");
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(error) => {
            log::debug!("Could not build probe client: {error}");
            return false;
        }
    };
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let available = status == reqwest::StatusCode::OK && !body.is_empty();
            if !available {
                log::debug!("'{url}' is not available - status was {status}");
            }
            available
        }
        Err(error) => {
            log::debug!("'{url}' is not available: {error}");
            false
        }
    }
}

/// The user-info source.
pub struct UserInfoSource {
    info: SourceInfo,
    teller: Arc<RwLock<Teller>>,
    users: Arc<RwLock<UserManager>>,
    provider: Box<dyn DirectoryProvider>,
}

impl UserInfoSource {
    pub fn new(
        teller: Arc<RwLock<Teller>>,
        users: Arc<RwLock<UserManager>>,
        provider: Box<dyn DirectoryProvider>,
    ) -> Result<UserInfoSource> {
        let info = SourceInfo::new(
            SOURCE_ID,
            "Connects a user tell with various information about them from around the org.",
        )?
        .with_display_name("User Info");
        Ok(UserInfoSource {
            info,
            teller,
            users,
            provider,
        })
    }

    /// Record whichever of the user's candidate profile URLs are reachable.
    async fn update_available_user_urls(&self, teller: &mut Teller, username: &str) {
        let mut available = Vec::new();
        for (system, url) in self.provider.profile_urls(username) {
            if is_url_available(&url, PROBE_TIMEOUT).await {
                available.push((system, url));
            } else {
                log::debug!("{url} not available");
            }
        }
        if available.is_empty() {
            return;
        }
        if let Ok(tell) = teller.get_mut(username) {
            for (system, url) in available {
                tell.update_datum_from_source(SOURCE_ID, &system, json!(url), None);
            }
        }
    }

    /// Fold the directory profile into the user's primary info block.
    fn apply_profile(teller: &mut Teller, username: &str, profile: &UserProfile) {
        let Ok(tell) = teller.get_mut(username) else {
            return;
        };
        match (&profile.full_name, &profile.email) {
            (Some(full_name), Some(email)) => User::set_user_info(tell, full_name, email),
            _ => log::warn!(
                "Profile information for '{username}' did not contain both full name and email."
            ),
        }
        User::set_user_info_property(tell, AVATAR_URL, profile.avatar_url.as_deref(), false);
        User::set_user_info_property(tell, PHONE, profile.phone.as_deref(), false);
    }
}

#[async_trait]
impl Source for UserInfoSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut SourceInfo {
        &mut self.info
    }

    async fn load(&mut self) -> anyhow::Result<String> {
        let roster = self.provider.valid_usernames().await?;
        log::info!("Retrieved {} usernames from the directory.", roster.len());

        let teller_ref = Arc::clone(&self.teller);
        let users_ref = Arc::clone(&self.users);
        let mut teller = teller_ref.write().await;
        let mut users = users_ref.write().await;

        let usernames = users.update_valid_usernames(&mut teller, roster);
        let mut provisioned = 0;
        for username in &usernames {
            match users.get_or_create_valid_user(&mut teller, username) {
                Ok(alias) => {
                    provisioned += 1;
                    self.update_available_user_urls(&mut teller, &alias).await;
                    match self.provider.profile(&alias).await {
                        Ok(Some(profile)) => {
                            UserInfoSource::apply_profile(&mut teller, &alias, &profile)
                        }
                        Ok(None) => {}
                        Err(error) => {
                            log::warn!("Error loading profile for '{alias}': {error:#}")
                        }
                    }
                }
                Err(error) => {
                    log::warn!(
                        "Attempted to get/create user for '{username}', \
                         but received an error: {error}"
                    );
                }
            }
        }

        users.refresh(&teller);
        teller.persist()?;
        Ok(format!(
            "Processed {provisioned} of {} valid users.",
            usernames.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Category;
    use crate::users::EMAIL;

    struct FixtureDirectory {
        roster: Vec<String>,
        profiles: Vec<(String, UserProfile)>,
    }

    #[async_trait]
    impl DirectoryProvider for FixtureDirectory {
        async fn valid_usernames(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.roster.clone())
        }

        async fn profile(&self, username: &str) -> anyhow::Result<Option<UserProfile>> {
            Ok(self
                .profiles
                .iter()
                .find(|(name, _)| name == username)
                .map(|(_, profile)| profile.clone()))
        }
    }

    fn fixture(roster: &[&str], profiles: Vec<(String, UserProfile)>) -> UserInfoSource {
        let teller = Arc::new(RwLock::new(Teller::transient()));
        let users = Arc::new(RwLock::new(UserManager::new()));
        UserInfoSource::new(
            teller,
            users,
            Box::new(FixtureDirectory {
                roster: roster.iter().map(|s| s.to_string()).collect(),
                profiles,
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_provisions_users_and_applies_profiles() {
        let profiles = vec![(
            "ada".to_string(),
            UserProfile {
                full_name: Some("Ada Lovelace".to_string()),
                email: Some("ada@example.com".to_string()),
                phone: Some("555-0100".to_string()),
                avatar_url: None,
            },
        )];
        let mut source = fixture(&["ada", "bob"], profiles);
        let teller = Arc::clone(&source.teller);
        let users = Arc::clone(&source.users);

        let message = source.load().await.unwrap();
        assert_eq!(message, "Processed 2 of 2 valid users.");

        let teller_guard = teller.read().await;
        let users_guard = users.read().await;
        let ada = users_guard.get(&teller_guard, "ada").unwrap();
        assert_eq!(ada.full_name(), Some("Ada Lovelace"));
        assert_eq!(ada.email(), Some("ada@example.com"));
        assert!(ada.tell().in_category(Category::User));
        // Profile-less users still get provisioned.
        assert!(users_guard.get(&teller_guard, "bob").is_ok());
        // The email index was refreshed.
        assert!(users_guard
            .get_by_email(&teller_guard, "ada@example.com")
            .is_ok());
    }

    #[tokio::test]
    async fn test_departed_users_are_deactivated_on_reload() {
        let mut source = fixture(&["carol"], Vec::new());
        let teller = Arc::clone(&source.teller);
        let users = Arc::clone(&source.users);
        {
            // carol and dan both existed previously.
            let mut teller_guard = teller.write().await;
            let mut users_guard = users.write().await;
            users_guard.update_valid_usernames(
                &mut teller_guard,
                vec!["carol".to_string(), "dan".to_string()],
            );
            users_guard
                .get_or_create_valid_user(&mut teller_guard, "dan")
                .unwrap();
        }

        source.load().await.unwrap();

        let teller_guard = teller.read().await;
        let users_guard = users.read().await;
        assert!(!users_guard.get(&teller_guard, "dan").unwrap().is_active());
        assert!(users_guard.get(&teller_guard, "carol").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_profile_without_email_warns_but_keeps_user() {
        let profiles = vec![(
            "erin".to_string(),
            UserProfile {
                full_name: Some("Erin".to_string()),
                email: None,
                phone: None,
                avatar_url: None,
            },
        )];
        let mut source = fixture(&["erin"], profiles);
        let teller = Arc::clone(&source.teller);
        let users = Arc::clone(&source.users);

        source.load().await.unwrap();

        let teller_guard = teller.read().await;
        let users_guard = users.read().await;
        let erin = users_guard.get(&teller_guard, "erin").unwrap();
        assert!(erin.tell().get_datum(USER_INFO_DATA, EMAIL).is_none());
    }
}
