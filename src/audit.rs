//! Audit metadata for persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Recorded when no creator is supplied.
pub const UNKNOWN_USER: &str = "unknown";

/// Standard audit information carried by every persisted record. Creation
/// fields are immutable; modification fields are updated on every
/// field-affecting write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    created_by: String,
    created: DateTime<Utc>,
    last_modified_by: String,
    last_modified: DateTime<Utc>,
}

impl AuditInfo {
    pub fn new(created_by: Option<&str>) -> Self {
        let created_by = created_by.unwrap_or(UNKNOWN_USER).to_string();
        let created = Utc::now();
        AuditInfo {
            last_modified_by: created_by.clone(),
            created_by,
            created,
            last_modified: created,
        }
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_modified_by(&self) -> &str {
        &self.last_modified_by
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Stamp a modification.
    pub fn modified(&mut self, modified_by: &str) {
        self.last_modified_by = modified_by.to_string();
        self.last_modified = Utc::now();
    }

    /// Seconds since the last modification, against `comparison_time` when
    /// given (largely to make certain testing easier).
    pub fn seconds_since_last_modified(&self, comparison_time: Option<DateTime<Utc>>) -> i64 {
        let at = comparison_time.unwrap_or_else(Utc::now);
        (at - self.last_modified).num_seconds()
    }

    /// The flat JSON form used in tell views.
    pub fn to_json(&self) -> Value {
        json!({
            "created": self.created.to_rfc3339(),
            "created_by": self.created_by,
            "last_modified": self.last_modified.to_rfc3339(),
            "last_modified_by": self.last_modified_by,
        })
    }
}
