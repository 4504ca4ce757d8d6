//! Pending-export generation (§6): a snapshot of items awaiting operator
//! review, written to `user_data/pending/summary.json` at startup.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-subsystem count, or the reason it could not be computed. A failure
/// in one subsystem never prevents the others from being reported.
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemSummary {
    /// Count of actionable (awaiting-review) items, if the scan succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Failure reason, if this subsystem's scan errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubsystemSummary {
    /// A subsystem whose scan succeeded with `count` actionable items.
    pub fn ok(count: usize) -> Self {
        Self { count: Some(count), error: None }
    }

    /// A subsystem whose scan failed with `reason`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self { count: None, error: Some(reason.into()) }
    }
}

/// The full `user_data/pending/summary.json` document.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    /// When this snapshot was generated.
    pub generated_at: DateTime<Utc>,
    /// Packs awaiting approval (states `pending` or `modified`).
    pub packs: SubsystemSummary,
    /// Capability handler candidates awaiting review.
    pub capability: SubsystemSummary,
    /// Pip requirement candidates awaiting review.
    pub pip: SubsystemSummary,
}

impl PendingSummary {
    /// Write this summary to `<user_data_root>/pending/summary.json`.
    pub async fn write(&self, user_data_root: &Path) -> std::io::Result<()> {
        let dir = user_data_root.join("pending");
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_string_pretty(self)
            .unwrap_or_else(|_| "{}".to_string());
        tokio::fs::write(dir.join("summary.json"), body).await
    }
}
