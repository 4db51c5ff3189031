//! The tell: a versioned, multi-source record.
//!
//! Tells are assembled from multiple independent sources. Every contributor
//! writes into its own named data block, never directly into canonical
//! fields; [`Tell::coalesce`] derives the canonical properties (description,
//! go URL, tags) from those blocks according to a fixed prioritization
//! scheme, and records per-property provenance for UI transparency.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::AuditInfo;
use crate::config::{self, Category, COALESCE_PRIORITY};
use crate::error::{Result, TellusError};
use crate::slug::{slugify, string_to_tags};

/// Canonical property names.
pub const PROP_ALIAS: &str = "alias";
pub const PROP_DESCRIPTION: &str = "description";
pub const PROP_GO_URL: &str = "go_url";
pub const PROP_TAGS: &str = "tags";

/// The properties that coalescing recomputes.
pub const UPDATEABLE_PROPERTIES: &[&str] = &[PROP_DESCRIPTION, PROP_GO_URL, PROP_TAGS];

/// The properties accepted by property updates (alias is checked, not set).
pub const CORE_PROPERTIES: &[&str] =
    &[PROP_ALIAS, PROP_DESCRIPTION, PROP_GO_URL, PROP_TAGS];

/// Data-block key a source's tag contribution moves to once folded into the
/// canonical tag set.
const SRC_TAGS_KEY: &str = "source-tags";

/// Data-block key for per-source info surfaced in the UI.
pub const TELLUS_INFO_KEY: &str = "tellus-info";

/// Domain used for synthesized internal link URLs.
const INTERNAL_LINK_DOMAIN: &str = "example.com";

/// One source's contribution: a key/value mapping.
pub type DataBlock = serde_json::Map<String, Value>;

/// A single registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tell {
    alias: String,
    #[serde(default)]
    categories: BTreeSet<Category>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    data: BTreeMap<String, DataBlock>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    go_url: Option<String>,
    #[serde(default)]
    groups: BTreeSet<String>,
    #[serde(default)]
    property_sources: BTreeMap<String, Vec<String>>,
    audit: AuditInfo,
}

impl Tell {
    /// Construct a tell. Tells are created by the [`crate::Teller`], never
    /// directly by callers; a tell always belongs to at least one category.
    pub fn new(alias: &str, category: Category, created_by: Option<&str>) -> Result<Tell> {
        let alias = Tell::validate_alias(alias, Some(category))?;
        let mut categories = BTreeSet::new();
        categories.insert(category);
        Ok(Tell {
            alias,
            categories,
            tags: BTreeSet::new(),
            data: BTreeMap::new(),
            description: None,
            go_url: None,
            groups: BTreeSet::new(),
            property_sources: BTreeMap::new(),
            audit: AuditInfo::new(created_by),
        })
    }

    /// Construct a tell and seed its creating category's data block with an
    /// initial URL and/or description.
    pub fn with_initial(
        alias: &str,
        category: Category,
        created_by: Option<&str>,
        go_url: Option<&str>,
        description: Option<&str>,
    ) -> Result<Tell> {
        let mut tell = Tell::new(alias, category, created_by)?;
        let creator = tell.audit.created_by().to_string();
        if let Some(description) = description {
            tell.update_datum_from_source(
                category.as_str(),
                PROP_DESCRIPTION,
                json!(description),
                Some(&creator),
            );
        }
        if let Some(go_url) = go_url {
            tell.update_datum_from_source(
                category.as_str(),
                PROP_GO_URL,
                json!(go_url),
                Some(&creator),
            );
        }
        Ok(tell)
    }

    // -----------------------------------------------------------------------
    // Alias validation
    // -----------------------------------------------------------------------

    /// Slugify an alias, rejecting anything shorter than two characters.
    pub fn clean_alias(raw: &str) -> Result<String> {
        if raw.trim().len() < 2 {
            return Err(TellusError::InvalidAlias {
                alias: raw.to_string(),
                reason: "Aliases must be two characters or more.".to_string(),
            });
        }
        Ok(slugify(raw))
    }

    /// Whether the slug is reserved: its first dash-delimited segment is
    /// shorter than two characters, or the full slug is a reserved word.
    /// A privileged category bypasses the check entirely.
    pub fn is_slug_reserved(slug: &str, category_override: Option<Category>) -> bool {
        if matches!(category_override, Some(c) if c.bypasses_reserved_words()) {
            return false;
        }
        let first = slug.split('-').next().unwrap_or("");
        first.len() < 2 || config::is_reserved_word(slug)
    }

    /// Clean an alias and reject reserved slugs.
    pub fn validate_alias(raw: &str, category_override: Option<Category>) -> Result<String> {
        let slug = Tell::clean_alias(raw)?;
        if Tell::is_slug_reserved(&slug, category_override) {
            return Err(TellusError::InvalidAlias {
                alias: raw.to_string(),
                reason: format!("'{slug}' is one of a handful of reserved strings for tellus."),
            });
        }
        Ok(slug)
    }

    /// Reassigning an alias is more involved than other attributes and should
    /// only ever be done by the registry, during creation or a rename.
    pub fn reassign_alias(&mut self, alias: &str) -> Result<()> {
        self.alias = Tell::validate_alias(alias, None)?;
        Ok(())
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    // -----------------------------------------------------------------------
    // Canonical properties
    // -----------------------------------------------------------------------

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The resolved target URL. Link tells without an explicit URL fall back
    /// to their synthesized internal URL.
    pub fn go_url(&self) -> Option<String> {
        if self.go_url.is_none() && self.in_category(Category::Link) {
            return self.internal_url();
        }
        self.go_url.clone()
    }

    pub fn internal_url(&self) -> Option<String> {
        if self.in_category(Category::Link) || self.in_category(Category::Dns) {
            return Some(format!("http://{}.{INTERNAL_LINK_DOMAIN}", self.alias));
        }
        None
    }

    pub fn is_go(&self) -> bool {
        self.in_category(Category::Go)
    }

    /// True when every non-alias property is empty; mostly for testing.
    pub fn has_no_properties(&self) -> bool {
        self.description.is_none() && self.go_url().is_none() && self.tags.is_empty()
    }

    pub fn audit_info(&self) -> &AuditInfo {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn add_tag(&mut self, tag: &str) {
        let slug = slugify(tag);
        if !slug.is_empty() {
            self.tags.insert(slug);
        }
    }

    pub fn add_tags<I: IntoIterator<Item = String>>(&mut self, tags: I) {
        self.tags.extend(tags);
    }

    pub fn remove_tag(&mut self, tag: &str) -> Option<String> {
        if self.tags.remove(tag) {
            Some(tag.to_string())
        } else {
            None
        }
    }

    /// True when the tell has every requested tag. The tell's own alias
    /// counts as an implicit tag: if it appears among the requested tags, the
    /// tell matches outright.
    pub fn has_all_tags(&self, tags: &BTreeSet<String>, include_alias: bool) -> bool {
        if include_alias && tags.contains(self.alias.as_str()) {
            return true;
        }
        tags.iter().all(|tag| self.tags.contains(tag))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let mut single = BTreeSet::new();
        single.insert(tag.to_string());
        self.has_all_tags(&single, true)
    }

    // -----------------------------------------------------------------------
    // Categories
    // -----------------------------------------------------------------------

    pub fn categories(&self) -> &BTreeSet<Category> {
        &self.categories
    }

    pub fn add_category(&mut self, category: Category) {
        self.categories.insert(category);
    }

    /// Add a category by its string form. Unknown categories are a hard
    /// failure, never silently ignored.
    pub fn add_category_str(&mut self, category: &str) -> Result<()> {
        match Category::parse(category) {
            Some(category) => {
                self.categories.insert(category);
                Ok(())
            }
            None => Err(TellusError::InvalidCategory(category.to_string())),
        }
    }

    pub fn remove_category(&mut self, category: Category) {
        if !self.categories.remove(&category) {
            log::error!(
                "Attempted to remove '{}' from category '{category}', but it wasn't in that category.",
                self.alias
            );
        }
    }

    pub fn in_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }

    pub fn in_all_categories(&self, categories: &BTreeSet<Category>) -> bool {
        categories.iter().all(|c| self.categories.contains(c))
    }

    pub fn in_any_categories(&self, categories: &[Category]) -> bool {
        categories.iter().any(|c| self.categories.contains(c))
    }

    /// True when this tell's categories are a subset of the passed set.
    pub fn categories_are_subset_of(&self, categories: &[Category]) -> bool {
        self.categories.iter().all(|c| categories.contains(c))
    }

    pub fn make_user_modified(&mut self) {
        self.add_category(Category::UserModified);
    }

    /// A tell is read-only unless it belongs to an editable category.
    pub fn read_only(&self) -> bool {
        !self.in_any_categories(config::EDITABLE_CATEGORIES)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn in_group(&self, group_name: &str) -> bool {
        self.groups.contains(group_name)
    }

    /// Record membership in the named group: the group root's alias becomes a
    /// tag on this tell and an entry in its group set. Root self-membership
    /// is the registry's responsibility (see `Teller::add_to_group`).
    pub fn join_group(&mut self, root_alias: &str) {
        self.add_tag(root_alias);
        self.groups.insert(root_alias.to_string());
    }

    /// Make this tell a grouping root by joining its own group.
    pub fn create_group(&mut self) {
        let alias = self.alias.clone();
        self.join_group(&alias);
    }

    // -----------------------------------------------------------------------
    // Data blocks
    // -----------------------------------------------------------------------

    /// The source ids currently holding a data block on this tell.
    pub fn sources(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    pub fn data(&self) -> &BTreeMap<String, DataBlock> {
        &self.data
    }

    pub fn get_data(&self, source_id: &str) -> Option<&DataBlock> {
        self.data.get(source_id)
    }

    pub fn get_datum(&self, source_id: &str, key: &str) -> Option<&Value> {
        self.data.get(source_id).and_then(|block| block.get(key))
    }

    pub fn clear_data(&mut self, source_id: &str) -> Option<DataBlock> {
        self.data.remove(source_id)
    }

    pub fn remove_datum(&mut self, source_id: &str, key: &str) -> Option<Value> {
        self.data.get_mut(source_id).and_then(|block| block.remove(key))
    }

    /// Write (or merge) a source's data block, stamp audit info, and
    /// recoalesce. Writing under a source id that names a known category also
    /// places the tell in that category.
    pub fn update_data_from_source(
        &mut self,
        source_id: &str,
        data: DataBlock,
        modified_by: Option<&str>,
        replace_data: bool,
    ) {
        self.merge_block(source_id, data, replace_data);
        let by = modified_by.unwrap_or(source_id).to_string();
        self.audit.modified(&by);
        if let Some(category) = Category::parse(source_id) {
            self.categories.insert(category);
        }
        // Always coalesce after an external data update.
        self.coalesce();
    }

    pub fn update_datum_from_source(
        &mut self,
        source_id: &str,
        key: &str,
        value: Value,
        modified_by: Option<&str>,
    ) {
        let mut block = DataBlock::new();
        block.insert(key.to_string(), value);
        self.update_data_from_source(source_id, block, modified_by, false);
    }

    fn merge_block(&mut self, source_id: &str, data: DataBlock, replace: bool) {
        if replace || !self.data.contains_key(source_id) {
            self.data.insert(source_id.to_string(), data);
        } else if let Some(existing) = self.data.get_mut(source_id) {
            for (key, value) in data {
                existing.insert(key, value);
            }
        }
    }

    /// Update the tell from a "full" dictionary representation including the
    /// alias, which is cross-checked. Generally only used by sources that
    /// provide a whole tell (the UI, or a tool YAML file).
    pub fn update_from_dict_representation(
        &mut self,
        values: &DataBlock,
        source_id: &str,
        modified_by: Option<&str>,
        replace_tags: bool,
        replace_data: bool,
    ) -> Result<()> {
        let raw_alias = values
            .get(PROP_ALIAS)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let alias = Tell::validate_alias(raw_alias, Category::parse(source_id))?;
        if alias != self.alias {
            return Err(TellusError::InvalidUpdate(format!(
                "Attempt to update the values of tell '{}' did not contain the correct \
                 'alias' value, even after cleaning to '{alias}'.",
                self.alias
            )));
        }

        if replace_tags {
            self.tags.clear();
        }

        self.update_data_from_source(source_id, values.clone(), modified_by, replace_data);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Coalescing
    // -----------------------------------------------------------------------

    /// The prioritized source order for coalescing: the fixed override list
    /// first, then any other sources present on the tell in ascending lexical
    /// order. Reversed gives the low-to-high walk order coalescing needs.
    pub fn prioritized_sources(&self, reverse_order: bool) -> Vec<String> {
        let mut remaining: BTreeSet<&str> = self.data.keys().map(String::as_str).collect();
        let mut ordered: Vec<String> = Vec::new();
        for category in COALESCE_PRIORITY {
            if remaining.remove(category.as_str()) {
                ordered.push(category.as_str().to_string());
            }
        }
        ordered.extend(remaining.into_iter().map(str::to_string));
        if reverse_order {
            ordered.reverse();
        }
        ordered
    }

    /// Pull the data from all sources together and assign the canonical
    /// properties according to the prioritization scheme, recording which
    /// sources contributed to each property.
    ///
    /// Scalar properties are recomputed from scratch on every pass, so a
    /// high-priority source clearing its value lets a lower-priority one show
    /// through again. Tags are different: once a source's tags have been
    /// folded into the canonical set, that contribution moves to an
    /// informational side key and never coalesces again, so the tag set only
    /// grows as sources come and go.
    pub fn coalesce(&mut self) {
        for property in UPDATEABLE_PROPERTIES {
            if *property != PROP_TAGS {
                self.clear_scalar(property);
            }
            let mut contributors: Vec<String> = Vec::new();
            for source_id in self.prioritized_sources(true) {
                let value = self
                    .data
                    .get(&source_id)
                    .and_then(|block| block.get(*property))
                    .cloned();
                match value {
                    Some(value) if !value.is_null() => {
                        self.apply_coalesced(property, &value);
                        contributors.push(source_id.clone());
                        if *property == PROP_TAGS {
                            if let Some(block) = self.data.get_mut(&source_id) {
                                block.insert(SRC_TAGS_KEY.to_string(), value);
                                block.remove(PROP_TAGS);
                            }
                        }
                    }
                    Some(_) => {
                        // Stale null entry: prune it.
                        if let Some(block) = self.data.get_mut(&source_id) {
                            block.remove(*property);
                        }
                    }
                    None => {}
                }
            }

            if contributors.is_empty() {
                self.property_sources.remove(*property);
            } else {
                contributors.reverse();
                self.property_sources
                    .insert((*property).to_string(), contributors);
            }
        }
    }

    /// Which sources currently contribute each canonical property, highest
    /// priority first.
    pub fn property_sources(&self) -> &BTreeMap<String, Vec<String>> {
        &self.property_sources
    }

    fn clear_scalar(&mut self, property: &str) {
        match property {
            PROP_DESCRIPTION => self.description = None,
            PROP_GO_URL => self.go_url = None,
            _ => {}
        }
    }

    fn apply_coalesced(&mut self, property: &str, value: &Value) {
        match property {
            PROP_DESCRIPTION => self.description = scalar_string(value),
            PROP_GO_URL => self.go_url = scalar_string(value),
            PROP_TAGS => self.fold_tags(value, false),
            _ => {}
        }
    }

    fn fold_tags(&mut self, value: &Value, replace: bool) {
        let tags: BTreeSet<String> = match value {
            Value::String(raw) => string_to_tags(raw),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(slugify)
                .filter(|tag| !tag.is_empty())
                .collect(),
            _ => BTreeSet::new(),
        };
        if replace {
            self.tags = tags;
        } else {
            self.tags.extend(tags);
        }
    }

    // -----------------------------------------------------------------------
    // Per-source UI info
    // -----------------------------------------------------------------------

    /// Record (or clear, when `value` is `None`) a source's UI-relevant info
    /// datum.
    pub fn update_tellus_info(&mut self, source_id: &str, value: Option<Value>) {
        match value {
            None => {
                // Clearing info that was never set is fine.
                self.remove_datum(source_id, TELLUS_INFO_KEY);
            }
            Some(value) => {
                self.update_datum_from_source(source_id, TELLUS_INFO_KEY, value, None);
            }
        }
    }

    /// Additional per-source information relevant to the UI.
    pub fn tellus_info(&self) -> serde_json::Map<String, Value> {
        let mut info = serde_json::Map::new();
        for (source_id, block) in &self.data {
            if let Some(value) = block.get(TELLUS_INFO_KEY) {
                info.insert(source_id.clone(), value.clone());
            }
        }
        info
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    fn properties_json(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert(PROP_ALIAS.to_string(), json!(self.alias));
        map.insert(PROP_GO_URL.to_string(), json!(self.go_url()));
        map.insert(PROP_DESCRIPTION.to_string(), json!(self.description));
        map.insert("categories".to_string(), json!(self.categories));
        map.insert(PROP_TAGS.to_string(), json!(self.tags));
        map
    }

    /// The JSON view of the tell. The minimal form carries just the basic
    /// properties; the full form adds groups, raw data blocks, the read-only
    /// flag, and audit info. `additional` entries are overlaid on top.
    pub fn tell_json(
        &self,
        minimal: bool,
        additional: Option<serde_json::Map<String, Value>>,
    ) -> Value {
        let mut map = self.properties_json();
        let info = self.tellus_info();
        if !info.is_empty() {
            map.insert(TELLUS_INFO_KEY.to_string(), Value::Object(info));
        }

        if !minimal {
            map.insert("groups".to_string(), json!(self.groups));
            map.insert("data".to_string(), json!(self.data));
            map.insert("read-only".to_string(), json!(self.read_only()));
            map.insert("z-audit-info".to_string(), self.audit.to_json());
        }

        if let Some(additional) = additional {
            for (key, value) in additional {
                map.insert(key, value);
            }
        }

        Value::Object(map)
    }

    pub fn minimal_tell_json(&self) -> Value {
        self.tell_json(true, None)
    }

    /// The `{alias: go_url}` form returned after go-link creation.
    pub fn go_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(self.alias.clone(), json!(self.go_url()));
        Value::Object(map)
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
