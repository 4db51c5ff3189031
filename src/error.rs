//! Error types for tellus.

use thiserror::Error;

use crate::tell::Tell;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TellusError>;

/// The tellus error taxonomy.
///
/// Validation errors are raised before any state change; lookup errors are
/// distinct so callers can choose create-on-miss behavior; conflict errors
/// carry the pre-existing record so callers can merge, report, or abort.
#[derive(Debug, Error)]
pub enum TellusError {
    /// The alias failed validation (too short, or reserved).
    #[error("Cannot create a tell with alias '{alias}'. {reason}")]
    InvalidAlias { alias: String, reason: String },

    /// The tag failed validation.
    #[error("Cannot create the tag '{tag}'. {reason}")]
    InvalidTag { tag: String, reason: String },

    /// The category string is not in the closed category set.
    #[error("'{0}' is not a known tellus category")]
    InvalidCategory(String),

    /// A tell update was malformed (bad property name, alias mismatch, ...).
    #[error("{0}")]
    InvalidUpdate(String),

    /// The query string could not be interpreted.
    #[error("'{0}' is not a valid query for tellus")]
    InvalidQuery(String),

    /// A tell with the same canonical alias already exists.
    #[error("A tell for '{}' already exists.", existing.alias())]
    DuplicateTell { existing: Box<Tell> },

    /// No tell matched the alias.
    #[error("A tell matching alias '{0}' could not be found.")]
    NoSuchTell(String),

    /// Two sources were registered under the same source id.
    #[error("Attempted to add two sources with the same source id: '{0}'.")]
    DuplicateSource(String),

    /// No source is registered under the id.
    #[error("No source is registered with id '{0}'.")]
    NoSuchSource(String),

    /// The username is not externally authorized.
    #[error("{0}")]
    InvalidUser(String),

    /// No user record exists for the username or email.
    #[error("{0}")]
    NoSuchUser(String),

    /// A tell was found for the username, but it is not a user tell.
    #[error(
        "An attempt was made to retrieve user '{username}', but the tell found is not a user."
    )]
    NotAUser { username: String },

    /// The persistor was configured incorrectly.
    #[error("Persistor set up incorrectly: '{0}'.")]
    PersistenceSetup(String),

    /// An I/O failure while persisting or loading.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] std::io::Error),

    /// A persisted record did not fit the current schema.
    #[error("Malformed persisted record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}
