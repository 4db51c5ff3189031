//! # Tellus
//!
//! An internal go-link and knowledge registry. Short aliases resolve to URLs
//! and are enriched with metadata contributed by multiple independently
//! refreshing data sources, plus human edits from the web UI.
//!
//! The heart of the crate is the multi-source coalescing model: every
//! contributor writes into its own named data block on a [`tell::Tell`], and
//! the canonical fields (description, go URL, tags) are deterministically
//! recomputed from those blocks on every external write, preserving
//! per-source provenance throughout.

pub mod audit;
pub mod config;
pub mod error;
pub mod persistence;
pub mod server;
pub mod slug;
pub mod sources;
pub mod tell;
pub mod teller;
pub mod users;

pub use config::Category;
pub use error::TellusError;
pub use tell::Tell;
pub use teller::{TellRepr, Teller};

/// Library version, reported in save-file headers and the status endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
