// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The append-only audit trail (§4.8): one categorized, newline-delimited
//! JSON event stream per `(category, date)` pair, where the date is derived
//! from each entry's own `ts` rather than wall-clock time. Distinct from the
//! transient `tracing` log lines emitted elsewhere in the workspace — this
//! is the durable, replayable record an operator or external collaborator
//! can reconstruct history from.
//!
//! The entry shape itself ([`rumi_core::AuditEntry`], [`rumi_core::AuditCategory`],
//! [`rumi_core::AuditSeverity`]) lives in `rumi-core`, since every subsystem
//! that emits audit entries needs it without depending on this writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use rumi_core::{AuditCategory, AuditEntry, AuditSeverity};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Errors from audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AuditError> for rumi_error::RumiError {
    fn from(err: AuditError) -> Self {
        rumi_error::RumiError::new(rumi_error::ErrorKind::SchemaInvalid, err.to_string())
    }
}

type FileKey = (AuditCategory, NaiveDate);

/// Append-only audit writer.
///
/// Maintains one open `BufWriter<File>` per `(category, date)` file,
/// each guarded by its own `tokio::sync::Mutex` so concurrent writers to
/// distinct categories/days never block one another, while writes within
/// a single file are strictly serialized (single-writer discipline, §5).
pub struct AuditLog {
    dir: PathBuf,
    writers: Mutex<BTreeMap<FileKey, Arc<Mutex<BufWriter<tokio::fs::File>>>>>,
}

impl AuditLog {
    /// Open (creating if needed) the audit directory at
    /// `<user_data_root>/audit/`.
    pub async fn open(user_data_root: impl AsRef<Path>) -> Result<Self, AuditError> {
        let dir = user_data_root.as_ref().join("audit");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, writers: Mutex::new(BTreeMap::new()) })
    }

    fn path_for(&self, category: AuditCategory, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}_{}.jsonl", category.file_stem(), date.format("%Y-%m-%d")))
    }

    async fn writer_for(
        &self,
        key: FileKey,
    ) -> Result<Arc<Mutex<BufWriter<tokio::fs::File>>>, AuditError> {
        let mut writers = self.writers.lock().await;
        if let Some(w) = writers.get(&key) {
            return Ok(Arc::clone(w));
        }
        let path = self.path_for(key.0, key.1);
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let writer = Arc::new(Mutex::new(BufWriter::new(file)));
        writers.insert(key, Arc::clone(&writer));
        Ok(writer)
    }

    /// Append one entry, serialized into its `(category, date)` file.
    ///
    /// The file-routing date comes from `entry.ts`; a `ts` this process
    /// could not have produced validly (it is always set by the caller)
    /// is taken at face value, matching §4.8.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let date = entry.ts.date_naive();
        let key = (entry.category, date);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let writer = self.writer_for(key).await?;
        let mut guard = writer.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.flush().await?;
        drop(guard);

        if matches!(entry.severity, AuditSeverity::Error | AuditSeverity::Security) || !entry.success
        {
            tracing::warn!(
                category = entry.category.file_stem(),
                action = %entry.action,
                success = entry.success,
                "audit entry recorded"
            );
        } else {
            tracing::debug!(
                category = entry.category.file_stem(),
                action = %entry.action,
                "audit entry recorded"
            );
        }
        Ok(())
    }

    /// Read back all entries for `category` on `date`, in file order.
    /// Returns an empty vec if the file does not exist.
    pub async fn read_category_date(
        &self,
        category: AuditCategory,
        date: NaiveDate,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.path_for(category, date);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }

    /// Return the last `limit` entries across every category/date file in
    /// the audit directory, sorted by `ts` ascending, for `rumi audit tail`.
    pub async fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut all = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                all.push(serde_json::from_str::<AuditEntry>(line)?);
            }
        }
        all.sort_by_key(|e| e.ts);
        if all.len() > limit {
            let start = all.len() - limit;
            Ok(all.split_off(start))
        } else {
            Ok(all)
        }
    }
}

/// Convenience builder for the common case of a minimal `info`,
/// `success: true` entry, since [`rumi_core::AuditEntry`] itself has no
/// constructor (it is a plain data type shared across crates).
pub fn new_entry(category: AuditCategory, action: impl Into<String>) -> AuditEntry {
    AuditEntry {
        ts: chrono::Utc::now(),
        category,
        severity: AuditSeverity::Info,
        action: action.into(),
        success: true,
        pack_id: None,
        flow_id: None,
        step_id: None,
        phase: None,
        details: BTreeMap::new(),
        rejection_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_read_back_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path()).await.unwrap();
        let mut entry = new_entry(AuditCategory::Approval, "approve");
        entry.pack_id = Some("demo".into());
        entry.details.insert("manifest_hash".into(), serde_json::json!("abc123"));
        let ts = entry.ts;
        log.record(entry).await.unwrap();

        let entries = log.read_category_date(AuditCategory::Approval, ts.date_naive()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "approve");
        assert_eq!(entries[0].pack_id.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn distinct_categories_go_to_distinct_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path()).await.unwrap();
        let ts = chrono::Utc::now();
        log.record(new_entry(AuditCategory::Network, "attempt")).await.unwrap();
        log.record(new_entry(AuditCategory::Security, "integrity_mismatch")).await.unwrap();

        let network = log.read_category_date(AuditCategory::Network, ts.date_naive()).await.unwrap();
        let security = log.read_category_date(AuditCategory::Security, ts.date_naive()).await.unwrap();
        assert_eq!(network.len(), 1);
        assert_eq!(security.len(), 1);
    }

    #[tokio::test]
    async fn rejected_entry_carries_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path()).await.unwrap();
        let mut entry = new_entry(AuditCategory::Network, "dispatch");
        entry.success = false;
        entry.rejection_reason = Some("domain not in allowlist".into());
        log.record(entry).await.unwrap();

        let entries = log.tail(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rejection_reason.as_deref(), Some("domain not in allowlist"));
    }

    #[tokio::test]
    async fn tail_merges_and_sorts_across_categories() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path()).await.unwrap();
        for i in 0..5 {
            log.record(new_entry(AuditCategory::FlowExecution, format!("step-{i}")))
                .await
                .unwrap();
        }
        for i in 0..5 {
            log.record(new_entry(AuditCategory::Capability, format!("dispatch-{i}")))
                .await
                .unwrap();
        }
        let tail = log.tail(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        for pair in tail.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[tokio::test]
    async fn read_category_date_returns_empty_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path()).await.unwrap();
        let entries = log
            .read_category_date(AuditCategory::Container, chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_category_all_land() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(AuditLog::open(tmp.path()).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..20 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.record(new_entry(AuditCategory::SharedDict, format!("propose-{i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let entries = log.tail(100).await.unwrap();
        assert_eq!(entries.len(), 20);
    }
}
