// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-candidate
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The generic candidate approval state machine (§4.9), shared by capability
//! handler approval and pip-requirement approval. Consumers differ only in
//! discovery (`CandidateDiscoverer::discover`) and installation
//! (`CandidateDiscoverer::perform_install`); the cooldown/strike/block
//! engine and its persistence are implemented exactly once here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rumi_core::PipCandidate;
use rumi_core::candidate::{CandidateState, ContainerSpec, PipInstallPlan};
use rumi_error::{ErrorKind, RumiError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

/// One hour, per §4.9's reject cooldown.
pub const COOLDOWN: Duration = Duration::hours(1);

/// Strike count at which a candidate is demoted to [`CandidateState::Blocked`].
pub const STRIKE_LIMIT: u32 = 3;

/// Errors from candidate approval operations.
#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    /// No candidate with this key is tracked.
    #[error("unknown candidate: {0}")]
    NotFound(String),
    /// The candidate is not in an actionable state (already installed,
    /// blocked, or still within its post-reject cooldown window).
    #[error("candidate {key} is not actionable (state={state:?})")]
    NotActionable {
        /// Candidate key.
        key: String,
        /// Current state.
        state: CandidateState,
    },
    /// The candidate is within its post-reject cooldown window.
    #[error("candidate {key} is in cooldown until {until}")]
    InCooldown {
        /// Candidate key.
        key: String,
        /// When the cooldown ends.
        until: DateTime<Utc>,
    },
    /// `requirements.lock` contained a disallowed line.
    #[error("requirements.lock line rejected: {reason} ({line:?})")]
    InvalidLockLine {
        /// The offending line.
        line: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Installation failed.
    #[error("install failed for {key}: {source}")]
    InstallFailed {
        /// Candidate key.
        key: String,
        /// Underlying error.
        #[source]
        source: RumiError,
    },
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CandidateError> for RumiError {
    fn from(err: CandidateError) -> Self {
        let kind = match &err {
            CandidateError::NotFound(_) => ErrorKind::NotApproved,
            CandidateError::NotActionable { .. } | CandidateError::InCooldown { .. } => {
                ErrorKind::Conflict
            }
            CandidateError::InvalidLockLine { .. } => ErrorKind::SchemaInvalid,
            CandidateError::InstallFailed { .. } => ErrorKind::ContainerUnavailable,
            CandidateError::Io(_) | CandidateError::Json(_) => ErrorKind::SchemaInvalid,
        };
        RumiError::new(kind, err.to_string())
    }
}

/// The pair of operations that differ between capability-handler approval
/// and pip-requirement approval; everything else is shared.
pub trait CandidateDiscoverer {
    /// Concrete candidate type this discoverer produces.
    type Candidate: Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Scan for candidates currently present on disk.
    fn discover(&self) -> Result<Vec<Self::Candidate>, RumiError>;

    /// Stable identity for a candidate (must include a content hash so that
    /// editing the underlying file mints a new identity).
    fn candidate_key(candidate: &Self::Candidate) -> String;

    /// Carry out installation for an approved candidate.
    fn perform_install(&self, candidate: &Self::Candidate) -> Result<(), RumiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidateRecord<C> {
    candidate: C,
    state: CandidateState,
    strikes: u32,
    last_rejected_at: Option<DateTime<Utc>>,
    last_rejection_reason: Option<String>,
}

/// Generic cooldown/strike/block approval engine over some
/// [`CandidateDiscoverer`].
pub struct CandidateManager<D: CandidateDiscoverer> {
    discoverer: D,
    store_path: PathBuf,
    records: BTreeMap<String, CandidateRecord<D::Candidate>>,
}

impl<D: CandidateDiscoverer> CandidateManager<D> {
    /// Load (or initialize) a manager persisting to `store_path`.
    pub fn load(discoverer: D, store_path: impl Into<PathBuf>) -> Result<Self, CandidateError> {
        let store_path = store_path.into();
        let records = if store_path.is_file() {
            let raw = std::fs::read_to_string(&store_path)?;
            serde_json::from_str(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { discoverer, store_path, records })
    }

    fn persist(&self) -> Result<(), CandidateError> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.store_path, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }

    /// Re-run discovery, registering any newly-seen candidate (by key) as
    /// [`CandidateState::Candidate`]. Existing records are left untouched —
    /// a candidate whose underlying content changed mints a new key and so
    /// is treated as genuinely new.
    pub fn scan(&mut self) -> Result<Vec<String>, CandidateError> {
        let discovered = self.discoverer.discover()?;
        let mut new_keys = Vec::new();
        for candidate in discovered {
            let key = D::candidate_key(&candidate);
            if !self.records.contains_key(&key) {
                self.records.insert(
                    key.clone(),
                    CandidateRecord {
                        candidate,
                        state: CandidateState::Candidate,
                        strikes: 0,
                        last_rejected_at: None,
                        last_rejection_reason: None,
                    },
                );
                new_keys.push(key);
            }
        }
        self.persist()?;
        Ok(new_keys)
    }

    fn cooldown_until(record: &CandidateRecord<D::Candidate>) -> Option<DateTime<Utc>> {
        record.last_rejected_at.map(|t| t + COOLDOWN)
    }

    fn require_actionable(&self, key: &str) -> Result<&CandidateRecord<D::Candidate>, CandidateError> {
        let record = self.records.get(key).ok_or_else(|| CandidateError::NotFound(key.to_string()))?;
        if !record.state.is_actionable() {
            return Err(CandidateError::NotActionable { key: key.to_string(), state: record.state });
        }
        if let Some(until) = Self::cooldown_until(record)
            && Utc::now() < until
        {
            return Err(CandidateError::InCooldown { key: key.to_string(), until });
        }
        Ok(record)
    }

    /// Approve a candidate: runs `perform_install`, then marks it
    /// [`CandidateState::Installed`].
    pub fn approve(&mut self, key: &str) -> Result<(), CandidateError> {
        self.require_actionable(key)?;
        let candidate = self.records[key].candidate.clone();
        self.discoverer
            .perform_install(&candidate)
            .map_err(|source| CandidateError::InstallFailed { key: key.to_string(), source })?;

        let record = self.records.get_mut(key).expect("checked by require_actionable");
        record.state = CandidateState::Installed;
        self.persist()?;
        tracing::info!(key, "candidate approved and installed");
        Ok(())
    }

    /// Reject a candidate: increments its strike count, starts the
    /// cooldown, and — at [`STRIKE_LIMIT`] strikes — demotes it to
    /// [`CandidateState::Blocked`] (no longer actionable until `unblock`).
    pub fn reject(&mut self, key: &str, reason: &str) -> Result<(), CandidateError> {
        self.require_actionable(key)?;
        let record = self.records.get_mut(key).expect("checked by require_actionable");
        record.strikes += 1;
        record.last_rejected_at = Some(Utc::now());
        record.last_rejection_reason = Some(reason.to_string());
        record.state = if record.strikes >= STRIKE_LIMIT {
            CandidateState::Blocked
        } else {
            CandidateState::Rejected
        };
        let blocked = record.state == CandidateState::Blocked;
        self.persist()?;
        tracing::warn!(key, reason, blocked, "candidate rejected");
        Ok(())
    }

    /// Explicit operator action to clear strikes and cooldown on a blocked
    /// candidate, returning it to [`CandidateState::Candidate`].
    pub fn unblock(&mut self, key: &str) -> Result<(), CandidateError> {
        let record =
            self.records.get_mut(key).ok_or_else(|| CandidateError::NotFound(key.to_string()))?;
        record.strikes = 0;
        record.last_rejected_at = None;
        record.last_rejection_reason = None;
        record.state = CandidateState::Candidate;
        self.persist()?;
        tracing::info!(key, "candidate unblocked");
        Ok(())
    }

    /// Current state of a tracked candidate.
    pub fn status(&self, key: &str) -> Option<CandidateState> {
        self.records.get(key).map(|r| r.state)
    }

    /// All tracked candidates, keyed by `candidate_key`.
    pub fn all(&self) -> impl Iterator<Item = (&String, &D::Candidate, CandidateState)> {
        self.records.iter().map(|(k, r)| (k, &r.candidate, r.state))
    }
}

// ---------------------------------------------------------------------------
// PipDiscoverer
// ---------------------------------------------------------------------------

/// Lines forbidden anywhere in a `requirements.lock` entry, per §4.9.
const FORBIDDEN_SUBSTRINGS: &[&str] = &["git+", "http://", "https://", "file:", "../", "@"];

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)
}

/// Parses one `NAME==VERSION` requirements.lock line, enforcing the strict
/// grammar from §4.9. Blank lines and `#`-comments are not candidates (the
/// caller filters them before calling this).
fn parse_lock_line(pack_id: &str, line: &str) -> Result<PipCandidate, CandidateError> {
    let trimmed = line.trim();

    if trimmed.starts_with("-e") || trimmed.starts_with('-') {
        return Err(CandidateError::InvalidLockLine {
            line: line.to_string(),
            reason: "flags are not permitted in requirements.lock".into(),
        });
    }
    if trimmed.contains('/') {
        return Err(CandidateError::InvalidLockLine {
            line: line.to_string(),
            reason: "path separators are not permitted".into(),
        });
    }
    for needle in FORBIDDEN_SUBSTRINGS {
        if trimmed.contains(needle) {
            return Err(CandidateError::InvalidLockLine {
                line: line.to_string(),
                reason: format!("disallowed token `{needle}`"),
            });
        }
    }

    let Some((name, version)) = trimmed.split_once("==") else {
        return Err(CandidateError::InvalidLockLine {
            line: line.to_string(),
            reason: "expected NAME==VERSION".into(),
        });
    };
    if name.is_empty() || version.is_empty() || version.contains("==") {
        return Err(CandidateError::InvalidLockLine {
            line: line.to_string(),
            reason: "expected exactly one NAME==VERSION pair".into(),
        });
    }

    Ok(PipCandidate {
        pack_id: pack_id.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        sha_of_lockfile_line: sha256_hex(trimmed),
        allow_sdist: false,
        state: CandidateState::Candidate,
    })
}

/// Parse a full `requirements.lock` file body into [`PipCandidate`]s,
/// skipping blank lines and `#`-comments.
pub fn parse_requirements_lock(
    pack_id: &str,
    contents: &str,
) -> Result<Vec<PipCandidate>, CandidateError> {
    let mut candidates = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        candidates.push(parse_lock_line(pack_id, line)?);
    }
    Ok(candidates)
}

/// Discovers pip candidates by parsing `<pack_dir>/requirements.lock` files
/// and plans (but does not execute) their two-container install.
pub struct PipDiscoverer {
    /// Ecosystem root to scan for `<pack_id>/requirements.lock`.
    pub ecosystem_root: PathBuf,
}

impl PipDiscoverer {
    /// Construct a discoverer rooted at `ecosystem_root`.
    pub fn new(ecosystem_root: impl Into<PathBuf>) -> Self {
        Self { ecosystem_root: ecosystem_root.into() }
    }

    /// Build the two-container install plan for `candidate`, per §4.9: a
    /// `bridge`-networked download stage, then a `none`-networked install
    /// stage that never touches the network.
    pub fn install_plan(candidate: &PipCandidate) -> PipInstallPlan {
        let package_ref = format!("{}=={}", candidate.name, candidate.version);
        let download = ContainerSpec {
            image: "rumi/pip-download:latest".into(),
            network: "bridge".into(),
            drop_all_caps: true,
            args: vec![
                "download".into(),
                "--no-deps".into(),
                if candidate.allow_sdist {
                    "--no-binary=:none:".into()
                } else {
                    "--only-binary=:all:".into()
                },
                package_ref.clone(),
            ],
        };
        let install = ContainerSpec {
            image: "rumi/pip-install:latest".into(),
            network: "none".into(),
            drop_all_caps: true,
            args: vec!["install".into(), "--no-index".into(), package_ref],
        };
        PipInstallPlan { download, install }
    }
}

impl CandidateDiscoverer for PipDiscoverer {
    type Candidate = PipCandidate;

    fn discover(&self) -> Result<Vec<PipCandidate>, RumiError> {
        let mut candidates = Vec::new();
        if !self.ecosystem_root.is_dir() {
            return Ok(candidates);
        }
        for entry in std::fs::read_dir(&self.ecosystem_root).map_err(CandidateError::Io)? {
            let entry = entry.map_err(CandidateError::Io)?;
            if !entry.path().is_dir() {
                continue;
            }
            let pack_id = entry.file_name().to_string_lossy().into_owned();
            let lock_path = entry.path().join("requirements.lock");
            if !lock_path.is_file() {
                continue;
            }
            let contents = std::fs::read_to_string(&lock_path).map_err(CandidateError::Io)?;
            candidates.extend(parse_requirements_lock(&pack_id, &contents)?);
        }
        Ok(candidates)
    }

    fn candidate_key(candidate: &PipCandidate) -> String {
        candidate.candidate_key()
    }

    /// Records the two-container plan as structured data; actually invoking
    /// the containers is the external pip-execution collaborator's job (§1).
    fn perform_install(&self, candidate: &PipCandidate) -> Result<(), RumiError> {
        let plan = Self::install_plan(candidate);
        tracing::info!(
            package = %format!("{}=={}", candidate.name, candidate.version),
            download_image = %plan.download.image,
            install_image = %plan.install.image,
            "pip install plan recorded for external execution"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDiscoverer {
        candidates: Vec<PipCandidate>,
        install_calls: std::cell::RefCell<Vec<String>>,
        fail_install: bool,
    }

    impl CandidateDiscoverer for CountingDiscoverer {
        type Candidate = PipCandidate;

        fn discover(&self) -> Result<Vec<PipCandidate>, RumiError> {
            Ok(self.candidates.clone())
        }

        fn candidate_key(candidate: &PipCandidate) -> String {
            candidate.candidate_key()
        }

        fn perform_install(&self, candidate: &PipCandidate) -> Result<(), RumiError> {
            if self.fail_install {
                return Err(RumiError::new(ErrorKind::ContainerUnavailable, "boom"));
            }
            self.install_calls.borrow_mut().push(candidate.candidate_key());
            Ok(())
        }
    }

    fn sample_candidate(name: &str) -> PipCandidate {
        PipCandidate {
            pack_id: "demo".into(),
            name: name.into(),
            version: "1.0.0".into(),
            sha_of_lockfile_line: sha256_hex(&format!("{name}==1.0.0")),
            allow_sdist: false,
            state: CandidateState::Candidate,
        }
    }

    #[test]
    fn scan_registers_new_candidates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let first = mgr.scan().unwrap();
        assert_eq!(first.len(), 1);
        let second = mgr.scan().unwrap();
        assert!(second.is_empty(), "re-scan of identical candidate should not re-register");
    }

    #[test]
    fn approve_calls_perform_install_and_marks_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let keys = mgr.scan().unwrap();
        mgr.approve(&keys[0]).unwrap();
        assert_eq!(mgr.status(&keys[0]), Some(CandidateState::Installed));
    }

    #[test]
    fn three_rejects_trigger_block() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let keys = mgr.scan().unwrap();
        let key = &keys[0];

        // Manually clear cooldown between rejects so repeated rejects don't
        // immediately hit InCooldown in this unit test.
        mgr.reject(key, "looks sketchy").unwrap();
        assert_eq!(mgr.status(key), Some(CandidateState::Rejected));
        mgr.records.get_mut(key).unwrap().last_rejected_at = None;

        mgr.reject(key, "still sketchy").unwrap();
        assert_eq!(mgr.status(key), Some(CandidateState::Rejected));
        mgr.records.get_mut(key).unwrap().last_rejected_at = None;

        mgr.reject(key, "final strike").unwrap();
        assert_eq!(mgr.status(key), Some(CandidateState::Blocked));
    }

    #[test]
    fn blocked_candidate_is_not_actionable_until_unblock() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let keys = mgr.scan().unwrap();
        let key = &keys[0];
        for _ in 0..3 {
            let _ = mgr.reject(key, "bad");
            mgr.records.get_mut(key).unwrap().last_rejected_at = None;
        }
        assert_eq!(mgr.status(key), Some(CandidateState::Blocked));
        assert!(mgr.approve(key).is_err());
        mgr.unblock(key).unwrap();
        assert_eq!(mgr.status(key), Some(CandidateState::Candidate));
        assert!(mgr.approve(key).is_ok());
    }

    #[test]
    fn reject_then_immediate_reject_hits_cooldown() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let keys = mgr.scan().unwrap();
        let key = &keys[0];
        mgr.reject(key, "first").unwrap();
        let err = mgr.reject(key, "too soon").unwrap_err();
        assert!(matches!(err, CandidateError::InCooldown { .. }));
    }

    #[test]
    fn install_failure_leaves_candidate_actionable() {
        let tmp = tempfile::tempdir().unwrap();
        let discoverer = CountingDiscoverer {
            candidates: vec![sample_candidate("requests")],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: true,
        };
        let mut mgr = CandidateManager::load(discoverer, tmp.path().join("store.json")).unwrap();
        let keys = mgr.scan().unwrap();
        let err = mgr.approve(&keys[0]).unwrap_err();
        assert!(matches!(err, CandidateError::InstallFailed { .. }));
        assert_eq!(mgr.status(&keys[0]), Some(CandidateState::Candidate));
    }

    #[test]
    fn persists_and_reloads_across_manager_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let store_path = tmp.path().join("store.json");
        {
            let discoverer = CountingDiscoverer {
                candidates: vec![sample_candidate("requests")],
                install_calls: std::cell::RefCell::new(Vec::new()),
                fail_install: false,
            };
            let mut mgr = CandidateManager::load(discoverer, &store_path).unwrap();
            mgr.scan().unwrap();
        }
        let discoverer = CountingDiscoverer {
            candidates: vec![],
            install_calls: std::cell::RefCell::new(Vec::new()),
            fail_install: false,
        };
        let mgr = CandidateManager::load(discoverer, &store_path).unwrap();
        assert_eq!(mgr.all().count(), 1);
    }

    #[test]
    fn parse_requirements_lock_accepts_valid_lines() {
        let contents = "# a comment\n\nrequests==2.31.0\nclick==8.1.7\n";
        let candidates = parse_requirements_lock("demo", contents).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "requests");
        assert_eq!(candidates[1].version, "8.1.7");
    }

    #[test]
    fn parse_requirements_lock_rejects_editable_install() {
        let err = parse_requirements_lock("demo", "-e git+https://example.com/repo\n").unwrap_err();
        assert!(matches!(err, CandidateError::InvalidLockLine { .. }));
    }

    #[test]
    fn parse_requirements_lock_rejects_direct_url_reference() {
        let err = parse_requirements_lock("demo", "requests @ https://example.com/x.whl\n")
            .unwrap_err();
        assert!(matches!(err, CandidateError::InvalidLockLine { .. }));
    }

    #[test]
    fn parse_requirements_lock_rejects_path_separator() {
        let err = parse_requirements_lock("demo", "../evil==1.0\n").unwrap_err();
        assert!(matches!(err, CandidateError::InvalidLockLine { .. }));
    }

    #[test]
    fn parse_requirements_lock_rejects_missing_pin() {
        let err = parse_requirements_lock("demo", "requests\n").unwrap_err();
        assert!(matches!(err, CandidateError::InvalidLockLine { .. }));
    }

    #[test]
    fn editing_lockfile_line_mints_new_candidate_key() {
        let a = parse_requirements_lock("demo", "requests==2.31.0\n").unwrap();
        let b = parse_requirements_lock("demo", "requests==2.31.1\n").unwrap();
        assert_ne!(a[0].candidate_key(), b[0].candidate_key());
    }
}
