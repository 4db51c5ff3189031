//! Closed vocabularies and application constants.
//!
//! Categories are a closed, versioned enumeration: adding one is a code
//! change. Their behavior (editability, coalescing priority, reserved-word
//! exemption) is expressed as methods on [`Category`] so policy lives in one
//! place instead of scattered string comparisons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace prefix for all category strings and internal aliases.
pub const TELLUS_PREFIX: &str = "tellus-";

/// Username recorded when tellus itself creates or modifies a record.
pub const APP_USERNAME: &str = "tellus";

/// Default save file name for the file persistor.
pub const SAVE_FILE_NAME: &str = "tellus_tells_save.txt";

/// The tell that backs the "About" link.
pub const ABOUT_TELL_ALIAS: &str = "tellus-about";

/// Non-user accounts that tend to show up in external rosters.
pub const NEVER_VALID_USERNAMES: &[&str] = &["tellus", "service"];

/// Control words claimed by the UI; creating tells with these names is
/// disallowed.
pub const RESERVED_UI_WORDS: &[&str] = &[
    "all",
    "all-tells",
    "delete-tell",
    "update-tell",
    "toggle-tag",
    "tellusstaticfiles",
];

/// Categories generally suppressed in the UI unless explicitly requested.
pub const UI_SUPPRESSED_CATEGORIES: &[Category] = &[Category::DnsOther];

/// UI route fragments shared with the front end.
pub const UI_ROUTE_GO: &str = "/#go";
pub const UI_ROUTE_TELL: &str = "/#t.";
pub const PARAM_SEPARATOR: &str = ".";

/// The UI route displaying a single tell.
pub fn ui_route_to_tell(alias: &str) -> String {
    format!("{UI_ROUTE_TELL}{alias}")
}

/// The UI route for the go-link creation form, pre-seeded with an alias.
pub fn ui_route_go(alias: &str) -> String {
    format!("{UI_ROUTE_GO}{PARAM_SEPARATOR}{alias}")
}

/// The closed set of known tell categories.
///
/// Categories gate editability and double as data-source identifiers: a data
/// block written under a category's string form automatically places the tell
/// in that category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Category {
    /// Go links; the core user-modifiable tell kind.
    #[serde(rename = "tellus-go")]
    Go,
    /// Links which are (or have been) actually active.
    #[serde(rename = "tellus-link")]
    Link,
    /// DNS entries which might be links.
    #[serde(rename = "tellus-dns")]
    Dns,
    /// Other DNS entries, likely not links.
    #[serde(rename = "tellus-dns-other")]
    DnsOther,
    /// Internal tells, often with special behavior.
    #[serde(rename = "tellus-internal")]
    Internal,
    /// Primary tool entries, from tool YAML files.
    #[serde(rename = "tellus-tool")]
    Tool,
    /// Related tool entries, from tool YAML files.
    #[serde(rename = "tellus-tool-related")]
    ToolRelated,
    /// Created or modified by a human; automated updates tread carefully.
    #[serde(rename = "tellus-user-modified")]
    UserModified,
    /// A tell representing an active user.
    #[serde(rename = "tellus-user")]
    User,
    /// A tell representing a deactivated user.
    #[serde(rename = "tellus-inactive-user")]
    InactiveUser,
    /// A tell specifying a spreadsheet to load.
    #[serde(rename = "tellus-sheet-spec")]
    SheetSpec,
    /// Came from a source, no other special behavior.
    #[serde(rename = "tellus-sourced")]
    Sourced,
    /// Only for use in unit tests; must never gain special behavior, so it is
    /// safe as a generic category for testing purposes.
    #[serde(rename = "tellus-testing-only")]
    Testing,
}

/// Fixed priority override for coalescing: these sources win over everything
/// else, in this order (human edits first, then go-link data).
pub const COALESCE_PRIORITY: &[Category] = &[Category::UserModified, Category::Go];

/// Categories whose tells the UI is currently allowed to edit.
pub const EDITABLE_CATEGORIES: &[Category] = &[Category::Go, Category::UserModified];

impl Category {
    /// Every known category.
    pub const ALL: &'static [Category] = &[
        Category::Go,
        Category::Link,
        Category::Dns,
        Category::DnsOther,
        Category::Internal,
        Category::Tool,
        Category::ToolRelated,
        Category::UserModified,
        Category::User,
        Category::InactiveUser,
        Category::SheetSpec,
        Category::Sourced,
        Category::Testing,
    ];

    /// The namespaced string form of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Go => "tellus-go",
            Category::Link => "tellus-link",
            Category::Dns => "tellus-dns",
            Category::DnsOther => "tellus-dns-other",
            Category::Internal => "tellus-internal",
            Category::Tool => "tellus-tool",
            Category::ToolRelated => "tellus-tool-related",
            Category::UserModified => "tellus-user-modified",
            Category::User => "tellus-user",
            Category::InactiveUser => "tellus-inactive-user",
            Category::SheetSpec => "tellus-sheet-spec",
            Category::Sourced => "tellus-sourced",
            Category::Testing => "tellus-testing-only",
        }
    }

    /// Parse the fully-qualified (namespaced) string form.
    pub fn parse(value: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.as_str() == value)
    }

    /// Ensure a category string carries the namespace prefix.
    pub fn ensure_prefix(value: &str) -> String {
        if value.starts_with(TELLUS_PREFIX) {
            value.to_string()
        } else {
            format!("{TELLUS_PREFIX}{value}")
        }
    }

    /// Whether tells in this category may be edited from the UI.
    pub fn is_editable(self) -> bool {
        EDITABLE_CATEGORIES.contains(&self)
    }

    /// Internal tells may use otherwise-reserved aliases.
    pub fn bypasses_reserved_words(self) -> bool {
        self == Category::Internal
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a slug is one of the handful of strings tellus reserves for
/// itself: every category name plus the UI control words.
pub fn is_reserved_word(slug: &str) -> bool {
    Category::ALL.iter().any(|c| c.as_str() == slug) || RESERVED_UI_WORDS.contains(&slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trips_through_strings() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(*category));
        }
    }

    #[test]
    fn test_parse_requires_namespaced_form() {
        assert_eq!(Category::parse("go"), None);
        assert_eq!(Category::parse("tellus-go"), Some(Category::Go));
    }

    #[test]
    fn test_ensure_prefix() {
        assert_eq!(Category::ensure_prefix("go"), "tellus-go");
        assert_eq!(Category::ensure_prefix("tellus-go"), "tellus-go");
    }

    #[test]
    fn test_editability_policy() {
        assert!(Category::Go.is_editable());
        assert!(Category::UserModified.is_editable());
        assert!(!Category::Internal.is_editable());
        assert!(!Category::User.is_editable());
    }

    #[test]
    fn test_reserved_words_cover_categories_and_ui_words() {
        assert!(is_reserved_word("tellus-go"));
        assert!(is_reserved_word("all"));
        assert!(is_reserved_word("toggle-tag"));
        assert!(!is_reserved_word("my-cool-link"));
    }

    #[test]
    fn test_category_serde_uses_namespaced_strings() {
        let json = serde_json::to_string(&Category::UserModified).unwrap();
        assert_eq!(json, "\"tellus-user-modified\"");
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::UserModified);
    }
}
