//! Alias and tag normalization.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^-\w\s]").unwrap());
static SEPARATOR_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s_+]+").unwrap());
static TAG_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s,.]").unwrap());

/// Create a canonical "slug" from a string. Canonical tags and aliases can
/// only contain lowercase alphanumeric characters and dashes.
///
/// Idempotent: `slugify(slugify(x)) == slugify(x)`, and trimmed input never
/// yields leading or trailing dashes.
pub fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let cleared = NON_SLUG_CHARS.replace_all(&lowered, " ");
    SEPARATOR_RUN.replace_all(cleared.trim(), "-").into_owned()
}

/// Split a free-form string on whitespace, commas, and dots into a set of
/// slugified tags, dropping anything that normalizes to empty.
pub fn string_to_tags(raw: &str) -> BTreeSet<String> {
    TAG_SPLIT
        .split(raw)
        .map(slugify)
        .filter(|tag| !tag.is_empty())
        .collect()
}
