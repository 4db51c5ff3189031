//! The user overlay: people, represented as tells.
//!
//! A user is a tell in a privileged category whose alias is the username.
//! Validity and activity are distinct: a valid username (externally
//! authorized) may have no tell yet, and a tell-backed user may have been
//! deactivated. Deactivation recategorizes, never deletes.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::config::{Category, APP_USERNAME, NEVER_VALID_USERNAMES};
use crate::error::{Result, TellusError};
use crate::sources::socializer::TAG_COFFEE_BOT;
use crate::tell::Tell;
use crate::teller::Teller;

/// The data block user info lives in; also the user-info source's id.
pub const USER_INFO_DATA: &str = "user-info";

pub const FULL_NAME: &str = "Full Name";
pub const EMAIL: &str = "Email";
pub const PHONE: &str = "Phone";
pub const AVATAR_URL: &str = "Avatar URL";
pub const LAST_LOGIN: &str = "last_login";

/// The user info properties that can be promoted from other sources.
pub const USER_INFO_PROPERTIES: &[&str] = &[FULL_NAME, EMAIL, PHONE, AVATAR_URL];

/// Whether a tell represents an active user.
pub fn is_user(tell: &Tell) -> bool {
    tell.in_category(Category::User)
}

/// Whether a tell represents a user, active or deactivated.
pub fn is_user_tell(tell: &Tell) -> bool {
    tell.in_category(Category::User) || tell.in_category(Category::InactiveUser)
}

/// A read facade over a user tell, with more semantically clear names.
/// Construction is validated: a non-user tell is rejected.
pub struct User<'a> {
    tell: &'a Tell,
}

impl<'a> User<'a> {
    pub fn new(tell: &'a Tell) -> Result<User<'a>> {
        if !is_user_tell(tell) {
            return Err(TellusError::InvalidUser(format!(
                "Attempted to create a user with a non-user tell: '{}'",
                tell.alias()
            )));
        }
        Ok(User { tell })
    }

    pub fn username(&self) -> &str {
        self.tell.alias()
    }

    pub fn tell(&self) -> &Tell {
        self.tell
    }

    pub fn full_name(&self) -> Option<&str> {
        self.info_property(FULL_NAME)
    }

    pub fn email(&self) -> Option<&str> {
        self.info_property(EMAIL)
    }

    pub fn last_login(&self) -> Option<&str> {
        self.info_property(LAST_LOGIN)
    }

    pub fn is_active(&self) -> bool {
        !self.tell.in_category(Category::InactiveUser)
    }

    fn info_property(&self, key: &str) -> Option<&str> {
        self.tell
            .get_datum(USER_INFO_DATA, key)
            .and_then(Value::as_str)
    }

    /// The tell's full JSON view, enhanced with user info properties.
    pub fn to_json(&self) -> Value {
        let mut additional = serde_json::Map::new();
        additional.insert("email".to_string(), json!(self.email()));
        additional.insert("fullName".to_string(), json!(self.full_name()));
        self.tell.tell_json(false, Some(additional))
    }

    // -----------------------------------------------------------------------
    // Mutations; these write through the user-info data block on the tell.
    // -----------------------------------------------------------------------

    /// Set the primary user information in addition to the alias (which is
    /// the short username).
    pub fn set_user_info(tell: &mut Tell, full_name: &str, email: &str) {
        tell.update_datum_from_source(USER_INFO_DATA, FULL_NAME, json!(full_name), None);
        tell.update_datum_from_source(USER_INFO_DATA, EMAIL, json!(email), None);
    }

    /// Set one user info property. `None` removes the property when
    /// `remove_if_none` is set, and is otherwise ignored.
    pub fn set_user_info_property(
        tell: &mut Tell,
        key: &str,
        value: Option<&str>,
        remove_if_none: bool,
    ) {
        match value {
            Some(value) => {
                tell.update_datum_from_source(USER_INFO_DATA, key, json!(value), None);
            }
            None if remove_if_none => {
                tell.remove_datum(USER_INFO_DATA, key);
            }
            None => {}
        }
    }

    /// Promote the user info found in another source's data block to be
    /// primary. Strictly additive: properties absent from the block are left
    /// alone.
    pub fn promote_info(tell: &mut Tell, data_key: &str) {
        for property in USER_INFO_PROPERTIES {
            let value = tell
                .get_datum(data_key, property)
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(value) = value {
                User::set_user_info_property(tell, property, Some(&value), false);
            }
        }
    }

    /// Record the current time as the user's last login.
    pub fn record_login(tell: &mut Tell) {
        tell.update_datum_from_source(
            USER_INFO_DATA,
            LAST_LOGIN,
            json!(chrono::Utc::now().to_rfc3339()),
            None,
        );
    }
}

/// Manages users on top of the registry. Keeps the set of externally valid
/// usernames and a denormalized email index, both rebuilt wholesale rather
/// than incrementally patched.
#[derive(Debug, Default)]
pub struct UserManager {
    valid_usernames: BTreeSet<String>,
    users_by_email: BTreeMap<String, String>,
}

impl UserManager {
    pub fn new() -> UserManager {
        UserManager::default()
    }

    pub fn with_valid_usernames<I: IntoIterator<Item = String>>(usernames: I) -> UserManager {
        let mut manager = UserManager::new();
        manager.add_valid_usernames(usernames);
        manager
    }

    fn add_valid_usernames<I: IntoIterator<Item = String>>(&mut self, usernames: I) {
        for name in usernames {
            if NEVER_VALID_USERNAMES.contains(&name.as_str()) {
                log::warn!(
                    "An attempt was made to add '{name}' as a valid username, but it is in \
                     the list of never-valid usernames ({NEVER_VALID_USERNAMES:?})."
                );
            } else {
                self.valid_usernames.insert(name);
            }
        }
    }

    /// Replace the valid-username set from an external roster, deactivating
    /// any user that is no longer valid. An empty roster is considered
    /// impossible and refused.
    pub fn update_valid_usernames(
        &mut self,
        teller: &mut Teller,
        current_valid_usernames: Vec<String>,
    ) -> Vec<String> {
        if current_valid_usernames.is_empty() {
            log::error!(
                "Tellus was just told there are no valid usernames. Tellus considers this \
                 impossible, so is leaving the valid usernames as: {:?}.",
                self.valid_usernames
            );
            return self.valid_usernames.iter().cloned().collect();
        }

        self.valid_usernames = current_valid_usernames.into_iter().collect();
        let mut all_active: BTreeSet<String> = self
            .active_usernames(teller)
            .into_iter()
            .collect();
        all_active.extend(self.valid_usernames.iter().cloned());

        let removed: Vec<String> = all_active
            .difference(&self.valid_usernames)
            .cloned()
            .collect();
        if !removed.is_empty() {
            log::info!("Removing {removed:?} from the list of valid usernames and users.");
            for username in removed {
                self.deactivate_user(teller, &username);
            }
        }

        self.valid_usernames.iter().cloned().collect()
    }

    /// Rebuild the email lookup from scratch, after updates to user data.
    pub fn refresh(&mut self, teller: &Teller) {
        log::info!("Refreshing user manager.");
        let mut by_email = BTreeMap::new();
        for tell in teller.tells(Some(Category::User)) {
            let Ok(user) = User::new(tell) else { continue };
            match user.email() {
                None => {
                    log::info!("User '{}' has no associated email address.", user.username());
                }
                Some(email) if by_email.contains_key(email) => {
                    log::error!(
                        "User '{}' has email '{email}', but that is already associated with \
                         user '{}'. This should not happen.",
                        user.username(),
                        by_email[email]
                    );
                }
                Some(email) => {
                    by_email.insert(email.to_string(), user.username().to_string());
                }
            }
        }
        self.users_by_email = by_email;
        log::info!("...wired up {} emails to users.", self.users_by_email.len());
    }

    pub fn is_valid_username(&self, username: &str) -> bool {
        self.valid_usernames.contains(username)
    }

    pub fn is_active_user(&self, teller: &Teller, username: &str) -> bool {
        self.is_valid_username(username)
            && self
                .get(teller, username)
                .map(|user| user.is_active())
                .unwrap_or(false)
    }

    /// Record a login: lazily provision the user if needed, then stamp the
    /// login time.
    pub fn login_user(&mut self, teller: &mut Teller, username: &str) -> Result<String> {
        log::debug!("'{username}' logged into tellus.");
        let username = self.get_or_create_valid_user(teller, username)?;
        User::record_login(teller.get_mut(&username)?);
        Ok(username)
    }

    /// Get a valid user, creating (or adopting) the backing tell if needed.
    /// The registry still needs to be persisted afterwards when anything was
    /// created. Will not return a deactivated user as-is.
    pub fn get_or_create_valid_user(
        &mut self,
        teller: &mut Teller,
        username: &str,
    ) -> Result<String> {
        if !self.is_valid_username(username) {
            return Err(TellusError::InvalidUser(format!(
                "'{username}' is not a valid tellus username."
            )));
        }

        let alias = Tell::clean_alias(username)?;
        enum Found {
            AlreadyUser,
            NotAUser,
            Missing,
        }
        let found = match teller.get(&alias) {
            Ok(tell) if is_user_tell(tell) => Found::AlreadyUser,
            Ok(_) => Found::NotAUser,
            Err(_) => Found::Missing,
        };

        match found {
            Found::AlreadyUser => return Ok(alias),
            Found::NotAUser => {
                teller.get_mut(&alias)?.add_category(Category::User);
                log::warn!(
                    "'{alias}' exists as a tell, but was not a user. Adding it as a user."
                );
            }
            Found::Missing => {
                teller.create_tell(&alias, Category::User, APP_USERNAME)?;
                log::info!("No existing user for username '{alias}', created one.");
            }
        }

        UserManager::perform_new_user_setup(teller.get_mut(&alias)?);
        Ok(alias)
    }

    /// Users are special, and get some social setup when first provisioned.
    fn perform_new_user_setup(tell: &mut Tell) {
        // New users get added to coffee bot by default.
        tell.add_tag(TAG_COFFEE_BOT);
    }

    /// Look up a user by username. Also finds deactivated users.
    pub fn get<'a>(&self, teller: &'a Teller, username: &str) -> Result<User<'a>> {
        match teller.get(username) {
            Ok(tell) if is_user_tell(tell) => User::new(tell),
            Ok(tell) => Err(TellusError::NotAUser {
                username: tell.alias().to_string(),
            }),
            Err(_) => Err(TellusError::NoSuchUser(format!(
                "No user currently exists for '{username}'."
            ))),
        }
    }

    pub fn get_by_email<'a>(&self, teller: &'a Teller, email: &str) -> Result<User<'a>> {
        match self.users_by_email.get(email) {
            Some(username) => self.get(teller, username),
            None => Err(TellusError::NoSuchUser(format!(
                "No tellus user was found with email '{email}'."
            ))),
        }
    }

    pub fn valid_usernames(&self) -> &BTreeSet<String> {
        &self.valid_usernames
    }

    pub fn count_active_users(&self, teller: &Teller) -> usize {
        teller.tells_count(Some(Category::User))
    }

    pub fn active_users<'a>(&self, teller: &'a Teller) -> Vec<User<'a>> {
        teller
            .tells(Some(Category::User))
            .into_iter()
            .filter_map(|tell| User::new(tell).ok())
            .collect()
    }

    pub fn active_usernames(&self, teller: &Teller) -> Vec<String> {
        teller
            .tells(Some(Category::User))
            .into_iter()
            .map(|tell| tell.alias().to_string())
            .collect()
    }

    /// Deactivate a user: the tell is retained, just recategorized from
    /// active to inactive. Returns the username when someone was
    /// deactivated.
    pub fn deactivate_user(&mut self, teller: &mut Teller, username: &str) -> Option<String> {
        log::info!("Deactivating user {username}.");
        let alias = match self.get(teller, username) {
            Ok(user) => user.username().to_string(),
            Err(error) => {
                log::error!("Error while attempting to deactivate user: {error}");
                return None;
            }
        };
        match teller.get_mut(&alias) {
            Ok(tell) => {
                tell.add_category(Category::InactiveUser);
                tell.remove_category(Category::User);
                Some(alias)
            }
            Err(error) => {
                log::error!("Error while attempting to deactivate user: {error}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(valid: &[&str]) -> UserManager {
        UserManager::with_valid_usernames(valid.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_never_valid_usernames_are_filtered() {
        let manager = manager_with(&["alice", "tellus", "service"]);
        assert!(manager.is_valid_username("alice"));
        assert!(!manager.is_valid_username("tellus"));
        assert!(!manager.is_valid_username("service"));
    }

    #[test]
    fn test_user_facade_requires_a_user_tell() {
        let tell = Tell::new("not-a-user", Category::Testing, None).unwrap();
        assert!(matches!(
            User::new(&tell),
            Err(TellusError::InvalidUser(_))
        ));
    }

    #[test]
    fn test_get_or_create_provisions_lazily() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["alice"]);

        assert!(matches!(
            manager.get(&teller, "alice"),
            Err(TellusError::NoSuchUser(_))
        ));

        let username = manager.get_or_create_valid_user(&mut teller, "alice").unwrap();
        assert_eq!(username, "alice");
        let user = manager.get(&teller, "alice").unwrap();
        assert!(user.is_active());
        // New users get the default social setup.
        assert!(user.tell().has_tag(TAG_COFFEE_BOT));
    }

    #[test]
    fn test_invalid_usernames_cannot_be_provisioned() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["alice"]);
        assert!(matches!(
            manager.get_or_create_valid_user(&mut teller, "mallory"),
            Err(TellusError::InvalidUser(_))
        ));
    }

    #[test]
    fn test_existing_non_user_tell_is_adopted() {
        let mut teller = Teller::transient();
        teller.create_tell("bob", Category::Go, "someone").unwrap();
        let mut manager = manager_with(&["bob"]);

        manager.get_or_create_valid_user(&mut teller, "bob").unwrap();
        let tell = teller.get("bob").unwrap();
        assert!(tell.in_category(Category::User));
        assert!(tell.in_category(Category::Go), "original categories remain");
    }

    #[test]
    fn test_deactivation_recategorizes_but_keeps_the_tell() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["carol"]);
        manager.get_or_create_valid_user(&mut teller, "carol").unwrap();

        manager.deactivate_user(&mut teller, "carol");
        let tell = teller.get("carol").unwrap();
        assert!(tell.in_category(Category::InactiveUser));
        assert!(!tell.in_category(Category::User));
        // Still findable as a (deactivated) user.
        let user = manager.get(&teller, "carol").unwrap();
        assert!(!user.is_active());
    }

    #[test]
    fn test_update_valid_usernames_deactivates_the_departed() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["dave", "erin"]);
        manager.get_or_create_valid_user(&mut teller, "dave").unwrap();
        manager.get_or_create_valid_user(&mut teller, "erin").unwrap();

        manager.update_valid_usernames(&mut teller, vec!["erin".to_string()]);
        assert!(!manager.is_valid_username("dave"));
        assert!(!manager.get(&teller, "dave").unwrap().is_active());
        assert!(manager.get(&teller, "erin").unwrap().is_active());
    }

    #[test]
    fn test_update_valid_usernames_refuses_an_empty_roster() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["frank"]);
        let kept = manager.update_valid_usernames(&mut teller, vec![]);
        assert_eq!(kept, vec!["frank".to_string()]);
        assert!(manager.is_valid_username("frank"));
    }

    #[test]
    fn test_refresh_rebuilds_email_index_wholesale() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["grace"]);
        manager.get_or_create_valid_user(&mut teller, "grace").unwrap();
        User::set_user_info(
            teller.get_mut("grace").unwrap(),
            "Grace Hopper",
            "grace@example.com",
        );

        manager.refresh(&teller);
        let user = manager.get_by_email(&teller, "grace@example.com").unwrap();
        assert_eq!(user.username(), "grace");
        assert_eq!(user.full_name(), Some("Grace Hopper"));

        assert!(matches!(
            manager.get_by_email(&teller, "nobody@example.com"),
            Err(TellusError::NoSuchUser(_))
        ));
    }

    #[test]
    fn test_login_records_last_login() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["heidi"]);
        manager.login_user(&mut teller, "heidi").unwrap();
        let user = manager.get(&teller, "heidi").unwrap();
        assert!(user.last_login().is_some());
    }

    #[test]
    fn test_promote_info_is_strictly_additive() {
        let mut teller = Teller::transient();
        let mut manager = manager_with(&["ivan"]);
        manager.get_or_create_valid_user(&mut teller, "ivan").unwrap();

        let tell = teller.get_mut("ivan").unwrap();
        User::set_user_info(tell, "Ivan", "ivan@example.com");
        tell.update_datum_from_source("directory-profile", FULL_NAME, json!("Ivan I."), None);
        User::promote_info(tell, "directory-profile");

        let user = manager.get(&teller, "ivan").unwrap();
        assert_eq!(user.full_name(), Some("Ivan I."));
        // Email wasn't in the promoted block, so the original stands.
        assert_eq!(user.email(), Some("ivan@example.com"));
    }
}
