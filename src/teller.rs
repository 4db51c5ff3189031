//! The teller: the in-memory registry of tells.
//!
//! An alphabetically-ordered collection keyed by canonical alias, providing
//! creation with uniqueness, exact and fuzzy lookup, query by category and
//! tag, rename, and delete. Durability is delegated to an injected
//! [`Persistor`]; every mutating web-facing operation flushes synchronously.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::Category;
use crate::error::{Result, TellusError};
use crate::persistence::Persistor;
use crate::slug::slugify;
use crate::tell::{DataBlock, Tell, PROP_ALIAS};

/// Parameter key carrying a rename request in UI updates.
pub const NEW_ALIAS: &str = "new_alias";

/// Similarity floor for fuzzy lookups: a candidate must score at least this
/// to be considered a match.
pub const FUZZY_SCORE_FLOOR: f64 = 0.75;

/// Swappable scoring function for fuzzy lookups; compares a cleaned query
/// against a candidate alias and returns a similarity in `[0, 1]`.
pub type ScoreFn = fn(&str, &str) -> f64;

/// Default scorer: normalized Levenshtein similarity over the
/// letters-and-digits-only forms of both strings.
pub fn default_score(query: &str, alias: &str) -> f64 {
    let compact: String = alias.chars().filter(|c| c.is_alphanumeric()).collect();
    strsim::normalized_levenshtein(query, &compact)
}

/// Which representation a query returns per tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TellRepr {
    /// Just the resolved go URL.
    GoUrl,
    /// The minimal structured view.
    Minimal,
    /// The full structured view.
    Full,
}

impl TellRepr {
    fn render(self, tell: &Tell) -> Value {
        match self {
            TellRepr::GoUrl => serde_json::json!(tell.go_url()),
            TellRepr::Minimal => tell.minimal_tell_json(),
            TellRepr::Full => tell.tell_json(false, None),
        }
    }
}

/// Manages our tells.
pub struct Teller {
    tells: BTreeMap<String, Tell>,
    persistor: Option<Box<dyn Persistor>>,
    score: ScoreFn,
}

impl Teller {
    pub fn new(persistor: Box<dyn Persistor>) -> Teller {
        Teller {
            tells: BTreeMap::new(),
            persistor: Some(persistor),
            score: default_score,
        }
    }

    /// A teller with no persistor, holding tells only for one source's
    /// scratch work or for tests.
    pub fn transient() -> Teller {
        Teller {
            tells: BTreeMap::new(),
            persistor: None,
            score: default_score,
        }
    }

    /// Override the fuzzy scoring function.
    pub fn with_score_fn(mut self, score: ScoreFn) -> Teller {
        self.score = score;
        self
    }

    /// All tell aliases, in canonical order. Mostly to simplify testing.
    pub fn aliases(&self) -> Vec<&str> {
        self.tells.keys().map(String::as_str).collect()
    }

    /// All tells, optionally restricted to one category.
    pub fn tells(&self, category: Option<Category>) -> Vec<&Tell> {
        match category {
            None => self.tells.values().collect(),
            Some(category) => self
                .tells
                .values()
                .filter(|tell| tell.in_category(category))
                .collect(),
        }
    }

    pub fn tells_count(&self, category: Option<Category>) -> usize {
        self.tells(category).len()
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// The main creation method; all new tells ultimately go through here.
    /// Fails with a duplicate error (carrying the existing tell) if the
    /// cleaned alias is already taken.
    pub fn create_tell(
        &mut self,
        raw_alias: &str,
        category: Category,
        created_by: &str,
    ) -> Result<&mut Tell> {
        self.create_tell_with(raw_alias, category, created_by, None, None)
    }

    pub fn create_tell_with(
        &mut self,
        raw_alias: &str,
        category: Category,
        created_by: &str,
        url: Option<&str>,
        description: Option<&str>,
    ) -> Result<&mut Tell> {
        let clean_alias = Tell::clean_alias(raw_alias)?;
        if let Some(existing) = self.tells.get(&clean_alias) {
            return Err(TellusError::DuplicateTell {
                existing: Box::new(existing.clone()),
            });
        }

        let tell = Tell::with_initial(&clean_alias, category, Some(created_by), url, description)?;
        Ok(self.tells.entry(clean_alias).or_insert(tell))
    }

    /// Construct a new tell from a dictionary of data; the dict must carry an
    /// alias entry, which is cleaned (with a warning when cleaning changed
    /// it).
    pub fn create_tell_from_dict(
        &mut self,
        category: Category,
        tell_dict: &DataBlock,
        source_id: &str,
        created_by: Option<&str>,
    ) -> Result<&mut Tell> {
        let created_by = created_by.unwrap_or(source_id).to_string();
        let raw_alias = tell_dict
            .get(PROP_ALIAS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let clean_alias = Tell::clean_alias(&raw_alias)?;

        let mut values = tell_dict.clone();
        if clean_alias != raw_alias {
            log::warn!("Cleaning alias, changing {raw_alias} to {clean_alias}");
            values.insert(PROP_ALIAS.to_string(), serde_json::json!(clean_alias));
        }

        let alias = clean_alias.clone();
        self.create_tell(&clean_alias, category, &created_by)?;
        let tell = self.get_mut(&alias)?;
        tell.update_from_dict_representation(&values, source_id, Some(&created_by), false, false)?;
        Ok(tell)
    }

    /// Tells created from the UI come through here, so human-driven creation
    /// is distinguishable from source-driven creation.
    pub fn create_tell_with_parameters(
        &mut self,
        category: Category,
        params: &DataBlock,
        username: &str,
    ) -> Result<&mut Tell> {
        self.create_tell_from_dict(
            category,
            params,
            Category::UserModified.as_str(),
            Some(username),
        )
    }

    pub fn get_or_create_tell(
        &mut self,
        raw_alias: &str,
        category: Category,
        created_by: &str,
    ) -> Result<&mut Tell> {
        let clean_alias = Tell::clean_alias(raw_alias)?;
        if self.tells.contains_key(&clean_alias) {
            let tell = self.get_mut(&clean_alias)?;
            if !tell.in_category(category) {
                log::info!("Tell '{}' is being added to category '{category}'.", tell.alias());
                tell.add_category(category);
            }
            return Ok(tell);
        }
        log::info!("Creating tell '{clean_alias}' in category '{category}'.");
        self.create_tell(&clean_alias, category, created_by)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Exact lookup by alias (after cleaning).
    pub fn get(&self, raw_alias: &str) -> Result<&Tell> {
        let clean_alias = Tell::clean_alias(raw_alias)
            .map_err(|_| TellusError::NoSuchTell(raw_alias.to_string()))?;
        self.tells
            .get(&clean_alias)
            .ok_or_else(|| TellusError::NoSuchTell(raw_alias.to_string()))
    }

    pub fn get_mut(&mut self, raw_alias: &str) -> Result<&mut Tell> {
        let clean_alias = Tell::clean_alias(raw_alias)
            .map_err(|_| TellusError::NoSuchTell(raw_alias.to_string()))?;
        self.tells
            .get_mut(&clean_alias)
            .ok_or_else(|| TellusError::NoSuchTell(raw_alias.to_string()))
    }

    /// Exact lookup, falling back to fuzzy matching on a miss. The fuzzy
    /// path succeeds only when exactly one candidate clears the similarity
    /// floor.
    pub fn get_or_search(&self, raw_alias: &str) -> Result<&Tell> {
        match self.get(raw_alias) {
            Ok(tell) => Ok(tell),
            Err(_) => {
                let clean_alias = Tell::clean_alias(raw_alias)
                    .map_err(|_| TellusError::NoSuchTell(raw_alias.to_string()))?;
                let matches = self.search(&clean_alias);
                if matches.len() == 1 {
                    Ok(matches[0])
                } else {
                    Err(TellusError::NoSuchTell(raw_alias.to_string()))
                }
            }
        }
    }

    /// Approximate lookup: every tell whose alias scores at or above the
    /// floor against the query. Deterministic for a fixed alias set, scorer,
    /// and floor, since aliases are walked in canonical order.
    pub fn search(&self, raw: &str) -> Vec<&Tell> {
        let needle: String = slugify(raw)
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        if needle.is_empty() {
            return Vec::new();
        }
        self.tells
            .values()
            .filter(|tell| (self.score)(&needle, tell.alias()) >= FUZZY_SCORE_FLOOR)
            .collect()
    }

    pub fn has_tell(&self, raw_alias: &str) -> bool {
        self.get(raw_alias).is_ok()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Delete the tell with the given alias. Requires the fully correct
    /// canonical alias (no cleaning, no fuzzy matching).
    ///
    /// Known limitation: group memberships and tags on other tells that
    /// reference the deleted alias are left dangling, not cleaned up.
    pub fn delete_tell(&mut self, alias: &str) -> Result<Tell> {
        self.tells
            .remove(alias)
            .ok_or_else(|| TellusError::NoSuchTell(alias.to_string()))
    }

    /// Add the tag if absent, remove it if present. Returns the tag when it
    /// was added, `None` when it was removed.
    pub fn toggle_tag(&mut self, alias: &str, tag: &str) -> Result<Option<String>> {
        let tell = self.get_mut(alias)?;
        if tell.has_tag(tag) {
            tell.remove_tag(tag);
            Ok(None)
        } else {
            tell.add_tag(tag);
            Ok(Some(tag.to_string()))
        }
    }

    /// Rename a tell: remove the old key, re-validate and reassign the
    /// alias, and reinsert. Returns the new canonical alias. On any failure
    /// the registry is left unchanged.
    pub fn update_alias(&mut self, old_alias: &str, new_alias: &str) -> Result<String> {
        if self.has_tell(new_alias) {
            return Err(TellusError::InvalidUpdate(format!(
                "Attempted to rename tell '{old_alias}' to '{new_alias}', \
                 but a tell with that alias already exists."
            )));
        }
        let mut tell = self
            .tells
            .remove(old_alias)
            .ok_or_else(|| TellusError::NoSuchTell(old_alias.to_string()))?;
        match tell.reassign_alias(new_alias) {
            Ok(()) => {
                let canonical = tell.alias().to_string();
                self.tells.insert(canonical.clone(), tell);
                Ok(canonical)
            }
            Err(error) => {
                // Validation failed; put it back untouched.
                self.tells.insert(old_alias.to_string(), tell);
                Err(error)
            }
        }
    }

    /// Update a tell from UI parameters: requires the full canonical alias,
    /// honors a `new_alias` rename request, and marks the tell
    /// user-modified (updates here can only be done by humans).
    pub fn update_tell_from_ui(
        &mut self,
        params: &DataBlock,
        modified_by: &str,
        replace_tags: bool,
    ) -> Result<&Tell> {
        let alias = params
            .get(PROP_ALIAS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !self.tells.contains_key(&alias) {
            return Err(TellusError::InvalidUpdate(format!(
                "No existing tell with alias '{alias}'. Updates require a full canonical alias."
            )));
        }

        let mut params = params.clone();
        let mut current_alias = alias.clone();
        if let Some(new_alias) = params
            .remove(NEW_ALIAS)
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            if !new_alias.is_empty() && new_alias != alias {
                log::info!("Updating tell '{alias}' to alias '{new_alias}'.");
                current_alias = self.update_alias(&alias, &new_alias)?;
            }
        }

        params.insert(
            PROP_ALIAS.to_string(),
            serde_json::json!(current_alias.clone()),
        );
        let tell = self
            .tells
            .get_mut(&current_alias)
            .ok_or_else(|| TellusError::NoSuchTell(current_alias.clone()))?;
        tell.update_from_dict_representation(
            &params,
            Category::UserModified.as_str(),
            Some(modified_by),
            replace_tags,
            false,
        )?;
        tell.make_user_modified();
        Ok(tell)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Parse a dot-separated query string into required categories and tags.
    ///
    /// The first segment gets special treatment: it is promoted to a category
    /// when it names one (prefixed or not); every later segment must use the
    /// fully-qualified form to count as a category, and is otherwise
    /// slugified into a tag.
    pub fn parse_query_string(query_string: &str) -> (BTreeSet<Category>, BTreeSet<String>) {
        let mut categories = BTreeSet::new();
        let mut tags = BTreeSet::new();

        let mut parts = query_string.split('.');
        if let Some(first) = parts.next() {
            match Category::parse(&Category::ensure_prefix(first)) {
                Some(category) => {
                    categories.insert(category);
                }
                None => {
                    if !first.is_empty() {
                        tags.insert(slugify(first));
                    }
                }
            }
        }
        for item in parts {
            if item.is_empty() {
                continue;
            }
            match Category::parse(item) {
                Some(category) => {
                    categories.insert(category);
                }
                None => {
                    tags.insert(slugify(item));
                }
            }
        }

        (categories, tags)
    }

    /// Query the registry. A tell matches when it has every required
    /// category and every required tag, and is not in any ignored category.
    /// `None` (or an empty/all-separator string) matches everything.
    pub fn query_tells(
        &self,
        query_string: Option<&str>,
        ignore_categories: &[Category],
        repr: TellRepr,
    ) -> serde_json::Map<String, Value> {
        let filter = query_string.map(Teller::parse_query_string);
        let mut results = serde_json::Map::new();
        for tell in self.tells.values() {
            let matches = match &filter {
                None => true,
                Some((categories, tags)) => {
                    tell.in_all_categories(categories) && tell.has_all_tags(tags, true)
                }
            };
            if matches && !tell.in_any_categories(ignore_categories) {
                results.insert(tell.alias().to_string(), repr.render(tell));
            }
        }
        results
    }

    // -----------------------------------------------------------------------
    // Grouping
    // -----------------------------------------------------------------------

    /// Add `member` to `root`'s group. The root is made a member of its own
    /// group first (an explicit pre-step, so grouping roots are always
    /// self-members before anything joins them).
    pub fn add_to_group(&mut self, member_alias: &str, root_alias: &str) -> Result<()> {
        let root = self.get_mut(root_alias)?;
        let root_alias = root.alias().to_string();
        if !root.in_group(&root_alias) {
            root.create_group();
        }
        if member_alias != root_alias {
            self.get_mut(member_alias)?.join_group(&root_alias);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load tells from the persisted save. Records whose alias no longer
    /// validates are dropped with an error log; structurally malformed
    /// records fail the load.
    pub fn load_tells(&mut self) -> Result<()> {
        let Some(persistor) = self.persistor.as_mut() else {
            return Ok(());
        };
        let loaded = persistor.load()?;
        if let Some(header) = &loaded.header {
            log::info!(
                "Loading save written by {} version {} ({} saves that run).",
                header.persistor,
                header.version,
                header.save_counts
            );
        }
        for record in loaded.records {
            let tell: Tell = serde_json::from_str(&record)?;
            match Tell::clean_alias(tell.alias()) {
                Ok(clean) if clean == tell.alias() => {
                    self.tells.insert(tell.alias().to_string(), tell);
                }
                _ => {
                    log::error!(
                        "Tell found in save file with invalid alias '{}'. \
                         This tell will be removed from the save file.",
                        tell.alias()
                    );
                }
            }
        }
        Ok(())
    }

    /// Flush every tell to the persistor. A transient teller is a no-op.
    pub fn persist(&mut self) -> Result<()> {
        let Some(persistor) = self.persistor.as_mut() else {
            log::debug!("Transient teller asked to persist; nothing to do.");
            return Ok(());
        };
        let mut records = Vec::with_capacity(self.tells.len());
        for tell in self.tells.values() {
            records.push(serde_json::to_string(tell)?);
        }
        persistor.persist(&records)
    }

    pub fn persistence_file(&self) -> Option<std::path::PathBuf> {
        self.persistor.as_ref().and_then(|p| p.persistence_file())
    }

    pub fn is_local_persistence(&self) -> bool {
        self.persistor
            .as_ref()
            .map(|p| p.is_local_persistence())
            .unwrap_or(true)
    }

    /// The raw save-file contents, for debugging.
    pub fn read_file(&self) -> String {
        match &self.persistor {
            Some(persistor) => persistor.read_file(),
            None => "No persistor configured.".to_string(),
        }
    }
}

impl Default for Teller {
    fn default() -> Teller {
        Teller::transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn teller_with(aliases: &[&str]) -> Teller {
        let mut teller = Teller::transient();
        for alias in aliases {
            teller
                .create_tell(alias, Category::Testing, "tester")
                .unwrap();
        }
        teller
    }

    #[test]
    fn test_create_and_get() {
        let mut teller = Teller::transient();
        teller
            .create_tell_with(
                "My Link",
                Category::Go,
                "alice",
                Some("http://target"),
                None,
            )
            .unwrap();
        let tell = teller.get("my-link").unwrap();
        assert_eq!(tell.go_url().as_deref(), Some("http://target"));
        // Raw form cleans to the same alias.
        assert_eq!(teller.get("  My Link  ").unwrap().alias(), "my-link");
    }

    #[test]
    fn test_duplicate_creation_fails_with_existing_tell() {
        let mut teller = teller_with(&["taken"]);
        let error = teller
            .create_tell(" TAKEN!! ", Category::Testing, "tester")
            .unwrap_err();
        match error {
            TellusError::DuplicateTell { existing } => assert_eq!(existing.alias(), "taken"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
        assert_eq!(teller.tells_count(None), 1);
    }

    #[test]
    fn test_get_missing_is_a_lookup_error() {
        let teller = Teller::transient();
        assert!(matches!(
            teller.get("nothing-here"),
            Err(TellusError::NoSuchTell(_))
        ));
        // An unusable alias is also reported as not-found on lookup.
        assert!(matches!(teller.get("x"), Err(TellusError::NoSuchTell(_))));
    }

    #[test]
    fn test_exact_match_never_uses_fuzzy_scoring() {
        fn zero_score(_: &str, _: &str) -> f64 {
            0.0
        }
        let mut teller = Teller::transient().with_score_fn(zero_score);
        teller
            .create_tell("exactly", Category::Testing, "tester")
            .unwrap();
        assert_eq!(teller.get_or_search("exactly").unwrap().alias(), "exactly");
    }

    #[test]
    fn test_fuzzy_lookup_requires_a_single_clear_winner() {
        let mut teller = teller_with(&["deploy-dashboard"]);
        // One close candidate: resolves.
        let found = teller.get_or_search("deploy-dashbord").unwrap();
        assert_eq!(found.alias(), "deploy-dashboard");

        // A second, equally close candidate makes resolution ambiguous.
        teller
            .create_tell("deploy-dashboards", Category::Testing, "tester")
            .unwrap();
        assert!(matches!(
            teller.get_or_search("deploy-dashbord"),
            Err(TellusError::NoSuchTell(_))
        ));

        // Nothing close at all: not found.
        assert!(matches!(
            teller.get_or_search("zzzzzz"),
            Err(TellusError::NoSuchTell(_))
        ));
    }

    #[test]
    fn test_delete_requires_canonical_alias() {
        let mut teller = teller_with(&["doomed"]);
        assert!(matches!(
            teller.delete_tell("DOOMED"),
            Err(TellusError::NoSuchTell(_))
        ));
        let removed = teller.delete_tell("doomed").unwrap();
        assert_eq!(removed.alias(), "doomed");
        assert_eq!(teller.tells_count(None), 0);
    }

    #[test]
    fn test_toggle_tag_flips() {
        let mut teller = teller_with(&["flippable"]);
        assert_eq!(
            teller.toggle_tag("flippable", "coffee").unwrap(),
            Some("coffee".to_string())
        );
        assert!(teller.get("flippable").unwrap().has_tag("coffee"));
        assert_eq!(teller.toggle_tag("flippable", "coffee").unwrap(), None);
        assert!(!teller.get("flippable").unwrap().has_tag("coffee"));
    }

    #[test]
    fn test_rename_moves_the_key_and_rejects_collisions() {
        let mut teller = teller_with(&["old-name", "occupied"]);
        assert!(matches!(
            teller.update_alias("old-name", "occupied"),
            Err(TellusError::InvalidUpdate(_))
        ));
        teller.update_alias("old-name", "new-name").unwrap();
        assert!(teller.has_tell("new-name"));
        assert!(!teller.has_tell("old-name"));
    }

    #[test]
    fn test_rename_restores_on_invalid_new_alias() {
        let mut teller = teller_with(&["stable"]);
        assert!(teller.update_alias("stable", "all").is_err());
        assert!(teller.has_tell("stable"));
    }

    #[test]
    fn test_parse_query_string_promotes_first_segment_categories() {
        let (categories, tags) = Teller::parse_query_string("go.foo.bar");
        assert!(categories.contains(&Category::Go));
        assert_eq!(categories.len(), 1);
        assert!(tags.contains("foo"));
        assert!(tags.contains("bar"));
    }

    #[test]
    fn test_parse_query_string_later_segments_need_full_form() {
        let (categories, tags) = Teller::parse_query_string("foo.go");
        assert!(categories.is_empty());
        assert!(tags.contains("foo"));
        assert!(tags.contains("go"));

        let (categories, tags) = Teller::parse_query_string("foo.tellus-go");
        assert!(categories.contains(&Category::Go));
        assert!(tags.contains("foo"));
        assert!(!tags.contains("tellus-go"));
    }

    #[test]
    fn test_parse_query_string_empty_and_separators_mean_no_filter() {
        for raw in ["", "...", "."] {
            let (categories, tags) = Teller::parse_query_string(raw);
            assert!(categories.is_empty(), "for {raw:?}");
            assert!(tags.is_empty(), "for {raw:?}");
        }
    }

    #[test]
    fn test_query_tells_filters_and_renders() {
        let mut teller = Teller::transient();
        teller
            .create_tell_with("go-one", Category::Go, "t", Some("http://one"), None)
            .unwrap();
        teller
            .create_tell_with("go-two", Category::Go, "t", Some("http://two"), None)
            .unwrap();
        teller
            .create_tell("plain", Category::Testing, "t")
            .unwrap();
        teller.get_mut("go-two").unwrap().add_tag("special");

        let all = teller.query_tells(None, &[], TellRepr::GoUrl);
        assert_eq!(all.len(), 3);

        let gos = teller.query_tells(Some("go"), &[], TellRepr::GoUrl);
        assert_eq!(gos.len(), 2);
        assert_eq!(gos["go-one"], json!("http://one"));

        let special = teller.query_tells(Some("go.special"), &[], TellRepr::Minimal);
        assert_eq!(special.len(), 1);
        assert_eq!(special["go-two"]["alias"], json!("go-two"));

        let suppressed = teller.query_tells(None, &[Category::Go], TellRepr::GoUrl);
        assert_eq!(suppressed.len(), 1);
        assert!(suppressed.contains_key("plain"));
    }

    #[test]
    fn test_query_matches_alias_as_implicit_tag() {
        let mut teller = Teller::transient();
        teller.create_tell("go-one", Category::Go, "t").unwrap();
        let hits = teller.query_tells(Some("go.go-one"), &[], TellRepr::Minimal);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_update_tell_from_ui_updates_and_marks_user_modified() {
        let mut teller = Teller::transient();
        teller.create_tell("editable", Category::Go, "t").unwrap();
        let mut params = DataBlock::new();
        params.insert(PROP_ALIAS.to_string(), json!("editable"));
        params.insert("description".to_string(), json!("edited"));
        params.insert("tags".to_string(), json!("one two"));

        let tell = teller
            .update_tell_from_ui(&params, "alice", true)
            .unwrap();
        assert_eq!(tell.description(), Some("edited"));
        assert!(tell.in_category(Category::UserModified));
        assert_eq!(tell.audit_info().last_modified_by(), "alice");
    }

    #[test]
    fn test_update_tell_from_ui_handles_rename() {
        let mut teller = Teller::transient();
        teller.create_tell("before", Category::Go, "t").unwrap();
        let mut params = DataBlock::new();
        params.insert(PROP_ALIAS.to_string(), json!("before"));
        params.insert(NEW_ALIAS.to_string(), json!("after"));
        params.insert("description".to_string(), json!("moved"));

        let tell = teller.update_tell_from_ui(&params, "alice", false).unwrap();
        assert_eq!(tell.alias(), "after");
        assert!(!teller.has_tell("before"));
        assert_eq!(teller.get("after").unwrap().description(), Some("moved"));
    }

    #[test]
    fn test_update_tell_from_ui_requires_canonical_alias() {
        let mut teller = Teller::transient();
        teller.create_tell("present", Category::Go, "t").unwrap();
        let mut params = DataBlock::new();
        params.insert(PROP_ALIAS.to_string(), json!("PRESENT"));
        assert!(matches!(
            teller.update_tell_from_ui(&params, "alice", false),
            Err(TellusError::InvalidUpdate(_))
        ));
    }

    #[test]
    fn test_get_or_create_adds_category_to_existing_tell() {
        let mut teller = teller_with(&["recycled"]);
        teller
            .get_or_create_tell("recycled", Category::Sourced, "src")
            .unwrap();
        assert!(teller.get("recycled").unwrap().in_category(Category::Sourced));
        assert_eq!(teller.tells_count(None), 1);
    }

    #[test]
    fn test_create_tell_from_dict_cleans_alias() {
        let mut teller = Teller::transient();
        let mut dict = DataBlock::new();
        dict.insert(PROP_ALIAS.to_string(), json!("Messy Alias!"));
        dict.insert("description".to_string(), json!("cleaned up"));
        let tell = teller
            .create_tell_from_dict(Category::Sourced, &dict, "some-source", None)
            .unwrap();
        assert_eq!(tell.alias(), "messy-alias");
        assert_eq!(tell.description(), Some("cleaned up"));
        assert_eq!(tell.audit_info().created_by(), "some-source");
    }

    #[test]
    fn test_group_membership_ensures_root_first() {
        let mut teller = teller_with(&["root-tell", "member-tell"]);
        teller.add_to_group("member-tell", "root-tell").unwrap();

        let root = teller.get("root-tell").unwrap();
        assert!(root.in_group("root-tell"), "roots must self-join first");
        let member = teller.get("member-tell").unwrap();
        assert!(member.in_group("root-tell"));
        assert!(member.has_tag("root-tell"));
    }

    #[test]
    fn test_aliases_are_sorted() {
        let teller = teller_with(&["zebra", "apple", "mango"]);
        assert_eq!(teller.aliases(), vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn test_persist_and_reload_round_trips_the_registry() {
        use crate::persistence::FilePersistor;

        let dir = tempfile::tempdir().unwrap();
        let persistor = || {
            Box::new(FilePersistor::new(Some(dir.path().to_path_buf()), "tells.txt").unwrap())
        };

        let mut teller = Teller::new(persistor());
        teller
            .create_tell_with(
                "durable",
                Category::Go,
                "alice",
                Some("http://durable"),
                Some("survives restarts"),
            )
            .unwrap();
        teller.get_mut("durable").unwrap().add_tag("kept");
        teller.persist().unwrap();

        let mut reloaded = Teller::new(persistor());
        reloaded.load_tells().unwrap();
        let tell = reloaded.get("durable").unwrap();
        assert_eq!(tell.go_url().as_deref(), Some("http://durable"));
        assert_eq!(tell.description(), Some("survives restarts"));
        assert!(tell.has_tag("kept"));
        assert_eq!(tell.audit_info().created_by(), "alice");
        assert_eq!(
            tell.property_sources().get("go_url"),
            Some(&vec!["tellus-go".to_string()])
        );
    }

    #[test]
    fn test_transient_persist_is_a_noop() {
        let mut teller = teller_with(&["floating"]);
        teller.persist().unwrap();
        assert!(teller.is_local_persistence());
    }
}
