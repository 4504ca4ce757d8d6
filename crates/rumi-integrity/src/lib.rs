// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-integrity
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Pack discovery, SHA-256 manifest computation, and the [`ApprovalStore`]
//! persistence layer (§4.3). A Pack may execute code only while it is
//! `approved` *and* its current on-disk manifest matches the one recorded at
//! approval time; any drift demotes it to `modified`, invalidates that
//! Pack's `NetworkGrant`, and writes a security audit entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rumi_core::{Pack, PackState};
use rumi_error::{ErrorKind, RumiError};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Directory names excluded from manifest computation because they hold
/// transient, per-invocation runtime state rather than Pack-authored content.
const TRANSIENT_SUBDIRS: &[&str] = &[".git", "__pycache__", ".pytest_cache"];

/// Result of re-verifying a Pack's manifest against its on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// The recomputed manifest matches the recorded one.
    Ok,
    /// The recomputed manifest differs; the Pack has been demoted to
    /// [`PackState::Modified`] as a side effect.
    Modified,
}

/// Errors from approval-store operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// Requested Pack has no record in the store.
    #[error("pack not found: {pack_id}")]
    NotFound {
        /// The missing Pack's id.
        pack_id: String,
    },
    /// `approve` was called while the Pack was in a state that does not
    /// permit approval (only `pending`, `modified`, or `rejected` do).
    #[error("pack {pack_id} cannot be approved from state {from:?}")]
    InvalidTransition {
        /// The Pack's id.
        pack_id: String,
        /// The state it was in when approval was attempted.
        from: PackState,
    },
    /// Two discovered directories claim the same `pack_id`.
    #[error("duplicate pack_id {pack_id}: {first} and {second}")]
    DuplicatePackId {
        /// The conflicting id.
        pack_id: String,
        /// First directory found.
        first: String,
        /// Second directory found.
        second: String,
    },
    /// `ecosystem.json` is missing or malformed.
    #[error("invalid ecosystem.json in {dir}: {reason}")]
    InvalidManifestDescriptor {
        /// Directory that failed to parse.
        dir: String,
        /// Parse or validation failure detail.
        reason: String,
    },
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApprovalError> for RumiError {
    fn from(err: ApprovalError) -> Self {
        let kind = match &err {
            ApprovalError::InvalidTransition { .. } => ErrorKind::Conflict,
            ApprovalError::DuplicatePackId { .. } => ErrorKind::Conflict,
            ApprovalError::InvalidManifestDescriptor { .. } => ErrorKind::SchemaInvalid,
            ApprovalError::NotFound { .. } => ErrorKind::NotApproved,
            ApprovalError::Io(_) | ApprovalError::Json(_) => ErrorKind::SchemaInvalid,
        };
        RumiError::new(kind, err.to_string())
    }
}

/// `ecosystem.json` descriptor read from a candidate Pack directory.
#[derive(Debug, Clone, serde::Deserialize)]
struct EcosystemDescriptor {
    pack_id: String,
    #[serde(default)]
    pack_identity: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

/// Compute the `{relative_path → sha256(content)}` manifest of a Pack's
/// directory tree, excluding [`TRANSIENT_SUBDIRS`].
pub fn compute_manifest(root: &Path) -> Result<BTreeMap<String, String>, ApprovalError> {
    let mut manifest = BTreeMap::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map(|name| !TRANSIENT_SUBDIRS.contains(&name))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path();
        let rel = abs.strip_prefix(root).unwrap_or(abs);
        let content = std::fs::read(abs)?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let sha256 = format!("{:x}", hasher.finalize());
        manifest.insert(rel.to_string_lossy().replace('\\', "/"), sha256);
    }

    Ok(manifest)
}

/// Discover candidate Pack directories under `ecosystem_root`, reading each
/// one's `ecosystem.json`.
///
/// Primary layout is `ecosystem_root/<pack_id>/`; the legacy fallback
/// `ecosystem_root/packs/<pack_id>/` is also scanned, with the primary
/// location winning on collision. A `pack_id` mismatch between the directory
/// name and the descriptor's own `pack_id` field, or two *different*
/// directories both legitimately claiming a name after the
/// primary-wins rule, results in an error for that entry only.
pub fn discover_packs(ecosystem_root: &Path) -> Result<Vec<Pack>, ApprovalError> {
    let mut found: BTreeMap<String, (PathBuf, EcosystemDescriptor)> = BTreeMap::new();

    let primary = ecosystem_root.to_path_buf();
    let legacy = ecosystem_root.join("packs");

    for (dir, is_primary) in [(primary, true), (legacy, false)] {
        if !dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(&dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let descriptor_path = path.join("ecosystem.json");
            if !descriptor_path.is_file() {
                continue;
            }
            let dir_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            let raw = std::fs::read_to_string(&descriptor_path)?;
            let descriptor: EcosystemDescriptor = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "skipping pack with invalid ecosystem.json");
                    continue;
                }
            };
            if descriptor.pack_id != dir_name {
                tracing::warn!(
                    dir = %path.display(),
                    declared = %descriptor.pack_id,
                    "skipping pack: directory name does not match declared pack_id"
                );
                continue;
            }

            match found.get(&dir_name) {
                Some((existing_path, _)) if is_primary => {
                    tracing::debug!(
                        pack_id = %dir_name,
                        primary = %path.display(),
                        shadowed = %existing_path.display(),
                        "primary pack location takes precedence over legacy"
                    );
                    found.insert(dir_name.clone(), (path, descriptor));
                }
                Some(_) => {
                    // legacy entry found after primary already recorded; primary wins, skip.
                }
                None => {
                    found.insert(dir_name.clone(), (path, descriptor));
                }
            }
        }
    }

    let now = Utc::now();
    let packs = found
        .into_iter()
        .map(|(pack_id, (root, descriptor))| Pack {
            pack_id,
            pack_identity: descriptor.pack_identity,
            root: root.to_string_lossy().to_string(),
            metadata: descriptor.metadata,
            state: PackState::Installed,
            manifest: None,
            discovered_at: now,
            approved_at: None,
        })
        .collect();

    Ok(packs)
}

/// In-memory, filesystem-backed registry of Pack approval state.
///
/// Persists each Pack's record as `user_data/permissions/approvals/<pack_id>.json`.
pub struct ApprovalStore {
    user_data_root: PathBuf,
    packs: BTreeMap<String, Pack>,
    grants: Option<Arc<rumi_grant::GrantStore>>,
    audit: Option<Arc<rumi_audit::AuditLog>>,
}

impl ApprovalStore {
    /// Create a store rooted at `user_data_root`, loading any previously
    /// persisted approval records.
    ///
    /// A store built this way demotes a drifted Pack to `modified` but has
    /// no [`rumi_grant::GrantStore`]/`AuditLog` to invalidate grants or
    /// record a security entry with — call [`Self::with_security_hooks`] to
    /// wire those in, as `KernelCore::start` does.
    pub fn load(user_data_root: impl Into<PathBuf>) -> Result<Self, ApprovalError> {
        let user_data_root = user_data_root.into();
        let mut packs = BTreeMap::new();
        let approvals_dir = user_data_root.join("permissions/approvals");
        if approvals_dir.is_dir() {
            for entry in std::fs::read_dir(&approvals_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = std::fs::read_to_string(&path)?;
                let pack: Pack = serde_json::from_str(&raw)?;
                packs.insert(pack.pack_id.clone(), pack);
            }
        }
        Ok(Self { user_data_root, packs, grants: None, audit: None })
    }

    /// Attach the `GrantStore`/`AuditLog` handles this store notifies when a
    /// Pack drifts from `approved` to `modified` (§4.3).
    #[must_use]
    pub fn with_security_hooks(mut self, grants: Arc<rumi_grant::GrantStore>, audit: Arc<rumi_audit::AuditLog>) -> Self {
        self.grants = Some(grants);
        self.audit = Some(audit);
        self
    }

    /// Invalidate `pack_id`'s `NetworkGrant` and write a `Security`-severity
    /// audit entry. Called whenever `scan`/`verify` demotes a Pack to
    /// `modified`; a store with no hooks attached is a no-op.
    async fn notify_modified(&self, pack_id: &str) {
        if let Some(grants) = &self.grants {
            if let Err(err) = grants.invalidate_network_grant(pack_id) {
                tracing::warn!(pack_id, error = %err, "failed to invalidate network grant after manifest drift");
            }
        }
        if let Some(audit) = &self.audit {
            let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::Security, "pack_manifest_drift");
            entry.success = false;
            entry.severity = rumi_core::AuditSeverity::Security;
            entry.pack_id = Some(pack_id.to_string());
            entry.rejection_reason = Some("manifest hash no longer matches the approved record".to_string());
            let _ = audit.record(entry).await;
        }
    }

    fn record_path(&self, pack_id: &str) -> PathBuf {
        self.user_data_root.join("permissions/approvals").join(format!("{pack_id}.json"))
    }

    fn persist(&self, pack: &Pack) -> Result<(), ApprovalError> {
        let dir = self.user_data_root.join("permissions/approvals");
        std::fs::create_dir_all(&dir)?;
        let serialized = serde_json::to_string_pretty(pack)?;
        std::fs::write(self.record_path(&pack.pack_id), serialized)?;
        Ok(())
    }

    /// Look up a Pack's current record.
    pub fn get(&self, pack_id: &str) -> Option<&Pack> {
        self.packs.get(pack_id)
    }

    /// All known Pack records.
    pub fn all(&self) -> impl Iterator<Item = &Pack> {
        self.packs.values()
    }

    /// Discover Pack directories under `ecosystem_root`, registering new ones
    /// as `pending` and re-verifying existing ones (demoting to `modified` on
    /// drift). Returns the set of pack_ids touched by this scan.
    pub async fn scan(&mut self, ecosystem_root: &Path) -> Result<Vec<String>, ApprovalError> {
        let discovered = discover_packs(ecosystem_root)?;
        let mut touched = Vec::new();
        let mut drifted = Vec::new();

        for mut discovered_pack in discovered {
            let pack_id = discovered_pack.pack_id.clone();
            touched.push(pack_id.clone());

            match self.packs.get(&pack_id) {
                None => {
                    discovered_pack.state = PackState::Pending;
                    tracing::info!(pack_id = %pack_id, "new pack discovered, pending approval");
                    self.persist(&discovered_pack)?;
                    self.packs.insert(pack_id, discovered_pack);
                }
                Some(existing) if existing.state == PackState::Approved => {
                    let root = PathBuf::from(&existing.root);
                    let current = compute_manifest(&root)?;
                    let recorded = existing.manifest.clone().unwrap_or_default();
                    if current != recorded {
                        let mut updated = existing.clone();
                        updated.state = PackState::Modified;
                        tracing::warn!(pack_id = %pack_id, "manifest drift detected, demoting to modified");
                        self.persist(&updated)?;
                        self.packs.insert(pack_id.clone(), updated);
                        drifted.push(pack_id);
                    }
                }
                Some(_) => {
                    // Pending/Modified/Rejected/Blocked/Installed: leave state, just
                    // refresh root/metadata in case the directory moved.
                }
            }
        }

        for pack_id in &drifted {
            self.notify_modified(pack_id).await;
        }

        Ok(touched)
    }

    /// Approve a Pack currently in `pending`, `modified`, or `rejected`,
    /// recomputing and recording its manifest.
    pub fn approve(&mut self, pack_id: &str) -> Result<(), ApprovalError> {
        let pack = self.packs.get(pack_id).ok_or_else(|| ApprovalError::NotFound {
            pack_id: pack_id.to_string(),
        })?;

        if !matches!(
            pack.state,
            PackState::Pending | PackState::Modified | PackState::Rejected
        ) {
            return Err(ApprovalError::InvalidTransition {
                pack_id: pack_id.to_string(),
                from: pack.state,
            });
        }

        let root = PathBuf::from(&pack.root);
        let manifest = compute_manifest(&root)?;

        let mut updated = pack.clone();
        updated.state = PackState::Approved;
        updated.manifest = Some(manifest);
        updated.approved_at = Some(Utc::now());

        tracing::info!(pack_id = %pack_id, "pack approved");
        self.persist(&updated)?;
        self.packs.insert(pack_id.to_string(), updated);
        Ok(())
    }

    /// Reject a Pack, recording the given reason in the log line.
    pub fn reject(&mut self, pack_id: &str, reason: &str) -> Result<(), ApprovalError> {
        let pack = self.packs.get(pack_id).ok_or_else(|| ApprovalError::NotFound {
            pack_id: pack_id.to_string(),
        })?;

        let mut updated = pack.clone();
        updated.state = PackState::Rejected;
        tracing::info!(pack_id = %pack_id, reason = %reason, "pack rejected");
        self.persist(&updated)?;
        self.packs.insert(pack_id.to_string(), updated);
        Ok(())
    }

    /// Recompute a Pack's manifest and compare it against the recorded one.
    ///
    /// A drift demotes an `approved` Pack to `modified` as a side effect,
    /// invalidates its `NetworkGrant`, writes a security audit entry, and
    /// triggers a caller-visible [`VerifyResult::Modified`].
    pub async fn verify(&mut self, pack_id: &str) -> Result<VerifyResult, ApprovalError> {
        let pack = self.packs.get(pack_id).ok_or_else(|| ApprovalError::NotFound {
            pack_id: pack_id.to_string(),
        })?;

        let root = PathBuf::from(&pack.root);
        let current = compute_manifest(&root)?;
        let recorded = pack.manifest.clone().unwrap_or_default();

        if current == recorded {
            return Ok(VerifyResult::Ok);
        }

        let was_approved = pack.state == PackState::Approved;
        let mut updated = pack.clone();
        if was_approved {
            updated.state = PackState::Modified;
        }
        tracing::warn!(pack_id = %pack_id, "verify found manifest drift");
        self.persist(&updated)?;
        self.packs.insert(pack_id.to_string(), updated);
        if was_approved {
            self.notify_modified(pack_id).await;
        }
        Ok(VerifyResult::Modified)
    }

    /// Current state of a Pack, if known.
    pub fn status(&self, pack_id: &str) -> Option<PackState> {
        self.packs.get(pack_id).map(|p| p.state)
    }

    /// Returns `true` if `pack_id` and every ancestor in its hierarchical
    /// chain (see [`rumi_core::hierarchy`]) is `approved` *and*
    /// manifest-verified right now.
    pub async fn is_authorized(&mut self, pack_id: &str) -> Result<bool, ApprovalError> {
        let mut chain = vec![pack_id.to_string()];
        chain.extend(rumi_core::hierarchy::ancestors(pack_id).into_iter().map(String::from));

        for id in chain {
            match self.status(&id) {
                Some(PackState::Approved) => {
                    if self.verify(&id).await? != VerifyResult::Ok {
                        return Ok(false);
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_pack(root: &Path, pack_id: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(pack_id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("ecosystem.json"),
            format!(r#"{{"pack_id": "{pack_id}"}}"#),
        )
        .unwrap();
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    #[test]
    fn compute_manifest_excludes_transient_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let pack = write_pack(tmp.path(), "demo", &[("a.py", "print(1)")]);
        fs::create_dir_all(pack.join("__pycache__")).unwrap();
        fs::write(pack.join("__pycache__/a.pyc"), "junk").unwrap();

        let manifest = compute_manifest(&pack).unwrap();
        assert!(manifest.contains_key("a.py"));
        assert!(manifest.contains_key("ecosystem.json"));
        assert!(!manifest.keys().any(|k| k.contains("__pycache__")));
    }

    #[test]
    fn discover_packs_finds_primary_location() {
        let tmp = tempfile::tempdir().unwrap();
        write_pack(tmp.path(), "demo", &[("a.py", "1")]);
        let packs = discover_packs(tmp.path()).unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].pack_id, "demo");
        assert_eq!(packs[0].state, PackState::Installed);
    }

    #[test]
    fn discover_packs_primary_wins_over_legacy() {
        let tmp = tempfile::tempdir().unwrap();
        write_pack(tmp.path(), "demo", &[("a.py", "primary")]);
        write_pack(&tmp.path().join("packs"), "demo", &[("a.py", "legacy")]);

        let packs = discover_packs(tmp.path()).unwrap();
        assert_eq!(packs.len(), 1);
        let manifest = compute_manifest(Path::new(&packs[0].root)).unwrap();
        assert!(manifest.contains_key("a.py"));
        assert!(packs[0].root.contains("demo"));
        assert!(!packs[0].root.contains("packs/demo"));
    }

    #[tokio::test]
    async fn scan_registers_new_pack_as_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();

        assert_eq!(store.status("demo"), Some(PackState::Pending));
    }

    #[tokio::test]
    async fn approve_requires_pending_modified_or_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.approve("demo").unwrap();
        assert_eq!(store.status("demo"), Some(PackState::Approved));

        // Approving an already-approved pack is not a valid transition.
        let err = store.approve("demo").unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn verify_is_idempotent_after_approve() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.approve("demo").unwrap();

        assert_eq!(store.verify("demo").await.unwrap(), VerifyResult::Ok);
        assert_eq!(store.verify("demo").await.unwrap(), VerifyResult::Ok);
    }

    #[tokio::test]
    async fn verify_detects_drift_and_demotes_to_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        let pack_dir = write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.approve("demo").unwrap();

        fs::write(pack_dir.join("a.py"), "2").unwrap();

        assert_eq!(store.verify("demo").await.unwrap(), VerifyResult::Modified);
        assert_eq!(store.status("demo"), Some(PackState::Modified));
    }

    #[tokio::test]
    async fn reject_then_approve_is_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.reject("demo", "looks suspicious").unwrap();
        assert_eq!(store.status("demo"), Some(PackState::Rejected));

        store.approve("demo").unwrap();
        assert_eq!(store.status("demo"), Some(PackState::Approved));
    }

    #[tokio::test]
    async fn is_authorized_requires_manifest_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        let pack_dir = write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let mut store = ApprovalStore::load(&user_data).unwrap();
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.approve("demo").unwrap();
        assert!(store.is_authorized("demo").await.unwrap());

        fs::write(pack_dir.join("a.py"), "tampered").unwrap();
        assert!(!store.is_authorized("demo").await.unwrap());
    }

    #[test]
    fn is_authorized_false_for_unknown_pack() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ApprovalStore::load(tmp.path().join("user_data")).unwrap();
        assert_eq!(store.status("missing"), None);
    }

    #[tokio::test]
    async fn persisted_records_reload_across_store_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        {
            let mut store = ApprovalStore::load(&user_data).unwrap();
            store.scan(&tmp.path().join("ecosystem")).await.unwrap();
            store.approve("demo").unwrap();
        }

        let reloaded = ApprovalStore::load(&user_data).unwrap();
        assert_eq!(reloaded.status("demo"), Some(PackState::Approved));
    }

    #[tokio::test]
    async fn verify_drift_invalidates_grant_and_writes_security_audit() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        let pack_dir = write_pack(&tmp.path().join("ecosystem"), "demo", &[("a.py", "1")]);

        let grants = Arc::new(rumi_grant::GrantStore::open(&user_data).unwrap());
        let audit = Arc::new(rumi_audit::AuditLog::open(&user_data).await.unwrap());
        grants
            .issue_network_grant("demo", vec!["example.com".to_string()], vec![443], "operator")
            .unwrap();

        let mut store = ApprovalStore::load(&user_data)
            .unwrap()
            .with_security_hooks(grants.clone(), audit.clone());
        store.scan(&tmp.path().join("ecosystem")).await.unwrap();
        store.approve("demo").unwrap();

        fs::write(pack_dir.join("a.py"), "tampered").unwrap();
        assert_eq!(store.verify("demo").await.unwrap(), VerifyResult::Modified);

        assert!(grants.load_network_grant("demo").is_none());

        let tail = audit.tail(10).await.unwrap();
        assert!(tail.iter().any(|entry| {
            entry.action == "pack_manifest_drift"
                && entry.severity == rumi_core::AuditSeverity::Security
                && entry.pack_id.as_deref() == Some("demo")
        }));
    }
}
