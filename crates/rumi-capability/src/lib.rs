// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-capability
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! `CapabilityBroker`: candidate discovery for Pack-contributed capability
//! handlers, a TOCTOU-guarded trust+grant approval flow, and a UDS listener
//! that dispatches granted requests to installed handlers (§4.6). Approval
//! (`CandidateManager::approve`) and usage (`GrantStore::grant_capability`)
//! are deliberately separate: installing a handler never by itself
//! authorizes any principal to call it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rumi_core::CapabilityCandidate;
use rumi_core::candidate::CandidateState;
use rumi_error::{ErrorKind, RumiError};
use rumi_grant::{GrantStore, TrustStore};
use rumi_protocol::{CapabilityRequest, CapabilityResponse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const HANDLERS_DIR: &str = "share/capability_handlers";
const HANDLER_MANIFEST: &str = "handler.json";
const HANDLER_ENTRYPOINT_DEFAULT: &str = "handler.py";

/// Errors from capability handler discovery, approval, or dispatch.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// `handler.py` no longer hashes to the value embedded in the
    /// candidate's identity; the file changed between scan and approve.
    #[error("handler.py for `{slug}` changed since it was scanned (TOCTOU)")]
    HashMismatch {
        /// Candidate slug.
        slug: String,
    },
    /// The declared `entrypoint` escapes its candidate's slug directory.
    #[error("entrypoint `{entrypoint}` for `{slug}` escapes its handler directory")]
    EntrypointEscape {
        /// Candidate slug.
        slug: String,
        /// Declared entrypoint.
        entrypoint: String,
    },
    /// A handler is already installed at this slug with a different
    /// `(handler_id, sha256)`; approval never silently overwrites.
    #[error("handler slug `{0}` is already installed with a different handler_id/sha256")]
    InstalledConflict(String),
    /// No installed handler advertises this permission.
    #[error("no installed handler for permission `{0}`")]
    UnknownPermission(String),
    /// The installed handler's current on-disk hash is no longer trusted.
    #[error("handler `{0}` is no longer trust-approved")]
    NotTrusted(String),
    /// Handler entrypoint process failed to run or exited non-zero.
    #[error("handler execution failed: {0}")]
    ExecutionFailed(String),
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CapabilityError> for RumiError {
    fn from(err: CapabilityError) -> Self {
        let kind = match &err {
            CapabilityError::HashMismatch { .. } => ErrorKind::IntegrityMismatch,
            CapabilityError::EntrypointEscape { .. } => ErrorKind::PathEscape,
            CapabilityError::InstalledConflict(_) => ErrorKind::Conflict,
            CapabilityError::UnknownPermission(_) => ErrorKind::NotApproved,
            CapabilityError::NotTrusted(_) => ErrorKind::TrustMissing,
            CapabilityError::ExecutionFailed(_) => ErrorKind::ContainerUnavailable,
            CapabilityError::Io(_) | CapabilityError::Json(_) => ErrorKind::SchemaInvalid,
        };
        RumiError::new(kind, err.to_string())
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Deserialize)]
struct HandlerManifest {
    handler_id: String,
    permission_id: String,
    #[serde(default = "default_entrypoint")]
    entrypoint: String,
}

fn default_entrypoint() -> String {
    HANDLER_ENTRYPOINT_DEFAULT.to_string()
}

/// Rejects an `entrypoint` containing a `..` component and returns the
/// candidate's slug directory joined with it, refusing to resolve outside
/// that directory (§4.6 step 2).
fn validate_entrypoint(slug_dir: &Path, slug: &str, entrypoint: &str) -> Result<PathBuf, CapabilityError> {
    if Path::new(entrypoint).components().any(|c| c.as_os_str() == "..") {
        return Err(CapabilityError::EntrypointEscape { slug: slug.to_string(), entrypoint: entrypoint.to_string() });
    }
    let joined = slug_dir.join(entrypoint);
    let canonical_dir = slug_dir.canonicalize().map_err(CapabilityError::Io)?;
    let canonical = joined.canonicalize().map_err(CapabilityError::Io)?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(CapabilityError::EntrypointEscape { slug: slug.to_string(), entrypoint: entrypoint.to_string() });
    }
    Ok(canonical)
}

/// Discovers capability-handler candidates under
/// `<ecosystem_root>/<pack_id>/share/capability_handlers/<slug>/` and
/// installs approved ones to `<user_data_root>/capabilities/handlers/<slug>/`.
pub struct CapabilityDiscoverer {
    /// Ecosystem root to scan for Pack-contributed handlers.
    pub ecosystem_root: PathBuf,
    /// `user_data` root under which installed handlers and the TrustStore
    /// are persisted.
    pub user_data_root: PathBuf,
}

impl CapabilityDiscoverer {
    /// Construct a discoverer over `ecosystem_root`, installing to
    /// `user_data_root`.
    pub fn new(ecosystem_root: impl Into<PathBuf>, user_data_root: impl Into<PathBuf>) -> Self {
        Self { ecosystem_root: ecosystem_root.into(), user_data_root: user_data_root.into() }
    }

    fn installed_dir(&self, slug: &str) -> PathBuf {
        self.user_data_root.join("capabilities/handlers").join(slug)
    }
}

impl rumi_candidate::CandidateDiscoverer for CapabilityDiscoverer {
    type Candidate = CapabilityCandidate;

    fn discover(&self) -> Result<Vec<CapabilityCandidate>, RumiError> {
        let mut candidates = Vec::new();
        if !self.ecosystem_root.is_dir() {
            return Ok(candidates);
        }
        for pack_entry in std::fs::read_dir(&self.ecosystem_root).map_err(CapabilityError::Io)? {
            let pack_entry = pack_entry.map_err(CapabilityError::Io)?;
            if !pack_entry.path().is_dir() {
                continue;
            }
            let pack_id = pack_entry.file_name().to_string_lossy().into_owned();
            let handlers_dir = pack_entry.path().join(HANDLERS_DIR);
            let Ok(slug_entries) = std::fs::read_dir(&handlers_dir) else { continue };

            for slug_entry in slug_entries.flatten() {
                if !slug_entry.path().is_dir() {
                    continue;
                }
                let slug = slug_entry.file_name().to_string_lossy().into_owned();
                let manifest_path = slug_entry.path().join(HANDLER_MANIFEST);
                let Ok(raw) = std::fs::read_to_string(&manifest_path) else { continue };
                let Ok(manifest) = serde_json::from_str::<HandlerManifest>(&raw) else {
                    warn!(target: "rumi.capability.discover", pack_id, slug, "malformed handler.json, skipping");
                    continue;
                };
                let handler_py = slug_entry.path().join(HANDLER_ENTRYPOINT_DEFAULT);
                let Ok(sha256) = sha256_file(&handler_py) else {
                    warn!(target: "rumi.capability.discover", pack_id, slug, "missing handler.py, skipping");
                    continue;
                };

                candidates.push(CapabilityCandidate {
                    pack_id: pack_id.clone(),
                    slug,
                    handler_id: manifest.handler_id,
                    permission_id: manifest.permission_id,
                    entrypoint: manifest.entrypoint,
                    sha256,
                    state: CandidateState::Candidate,
                });
            }
        }
        Ok(candidates)
    }

    fn candidate_key(candidate: &CapabilityCandidate) -> String {
        candidate.candidate_key()
    }

    /// TOCTOU-guarded install (§4.6 step 1-4). Does not grant usage and
    /// does not reload any broker's in-memory registry — callers must call
    /// [`CapabilityBroker::reload_handlers`] themselves after a successful
    /// approval.
    fn perform_install(&self, candidate: &CapabilityCandidate) -> Result<(), RumiError> {
        let slug_dir = self.ecosystem_root.join(&candidate.pack_id).join(HANDLERS_DIR).join(&candidate.slug);
        let handler_py = slug_dir.join(HANDLER_ENTRYPOINT_DEFAULT);
        let manifest_path = slug_dir.join(HANDLER_MANIFEST);

        let current_sha = sha256_file(&handler_py).map_err(CapabilityError::Io)?;
        if current_sha != candidate.sha256 {
            return Err(CapabilityError::HashMismatch { slug: candidate.slug.clone() }.into());
        }

        validate_entrypoint(&slug_dir, &candidate.slug, &candidate.entrypoint)?;

        let dest_dir = self.installed_dir(&candidate.slug);
        let dest_manifest = dest_dir.join(HANDLER_MANIFEST);
        let dest_handler_py = dest_dir.join(HANDLER_ENTRYPOINT_DEFAULT);
        if dest_manifest.is_file() {
            let existing_raw = std::fs::read_to_string(&dest_manifest).map_err(CapabilityError::Io)?;
            let existing: HandlerManifest =
                serde_json::from_str(&existing_raw).map_err(CapabilityError::Json)?;
            let existing_sha = sha256_file(&dest_handler_py).map_err(CapabilityError::Io)?;
            if existing.handler_id != candidate.handler_id || existing_sha != candidate.sha256 {
                return Err(CapabilityError::InstalledConflict(candidate.slug.clone()).into());
            }
            // Identical (handler_id, sha256) already installed: idempotent no-op
            // for the copy step, but trust still needs recording below.
        } else {
            std::fs::create_dir_all(&dest_dir).map_err(CapabilityError::Io)?;
            std::fs::copy(&manifest_path, &dest_manifest).map_err(CapabilityError::Io)?;
            std::fs::copy(&handler_py, &dest_handler_py).map_err(CapabilityError::Io)?;
        }

        let mut trust = TrustStore::load(&self.user_data_root).map_err(RumiError::from)?;
        trust.trust(&candidate.handler_id, &candidate.sha256).map_err(RumiError::from)?;

        tracing::info!(
            slug = %candidate.slug,
            handler_id = %candidate.handler_id,
            "capability handler installed and trusted"
        );
        Ok(())
    }
}

/// A handler installed under `user_data/capabilities/handlers/<slug>/`,
/// resolved and ready to dispatch.
#[derive(Debug, Clone)]
struct InstalledHandler {
    handler_id: String,
    entrypoint: PathBuf,
    handler_py: PathBuf,
}

/// Per-principal Capability broker: one UDS listener per Pack, dispatching
/// granted requests to installed, Trust-approved handlers (§4.6).
pub struct CapabilityBroker {
    grants: Arc<GrantStore>,
    audit: Arc<rumi_audit::AuditLog>,
    user_data_root: PathBuf,
    sock_dir: PathBuf,
    handlers: RwLock<BTreeMap<String, InstalledHandler>>,
}

impl CapabilityBroker {
    /// Build a broker over a shared `GrantStore` and `AuditLog`, listening
    /// under `sock_dir` (one `<pack_id>.sock` file per Pack), with its
    /// in-memory handler registry populated from whatever is currently
    /// installed under `user_data_root`.
    pub async fn new(
        grants: Arc<GrantStore>,
        audit: Arc<rumi_audit::AuditLog>,
        user_data_root: impl Into<PathBuf>,
        sock_dir: impl Into<PathBuf>,
    ) -> Result<Self, CapabilityError> {
        let broker = Self {
            grants,
            audit,
            user_data_root: user_data_root.into(),
            sock_dir: sock_dir.into(),
            handlers: RwLock::new(BTreeMap::new()),
        };
        broker.reload_handlers().await?;
        Ok(broker)
    }

    /// Re-scan `<user_data_root>/capabilities/handlers/` and rebuild the
    /// in-memory `permission_id -> handler` registry. Called at startup and
    /// after every successful `approve()` (§4.6 step 5).
    pub async fn reload_handlers(&self) -> Result<(), CapabilityError> {
        let dir = self.user_data_root.join("capabilities/handlers");
        let mut handlers = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let manifest_path = entry.path().join(HANDLER_MANIFEST);
                let Ok(raw) = std::fs::read_to_string(&manifest_path) else { continue };
                let Ok(manifest) = serde_json::from_str::<HandlerManifest>(&raw) else {
                    warn!(target: "rumi.capability.reload", path = %manifest_path.display(), "malformed installed handler.json, skipping");
                    continue;
                };
                let handler_py = entry.path().join(HANDLER_ENTRYPOINT_DEFAULT);
                let entrypoint = entry.path().join(&manifest.entrypoint);
                handlers.insert(
                    manifest.permission_id.clone(),
                    InstalledHandler { handler_id: manifest.handler_id, entrypoint, handler_py },
                );
            }
        }
        let count = handlers.len();
        *self.handlers.write().await = handlers;
        debug!(target: "rumi.capability.reload", count, "handler registry reloaded");
        Ok(())
    }

    /// Bind and accept connections on `<sock_dir>/<pack_id>.sock` forever.
    /// Each accepted connection is served on its own task; `pack_id` is the
    /// principal identity for every request on this socket, never the
    /// payload (§4.6 dispatch step 1).
    pub async fn listen(self: Arc<Self>, pack_id: String) -> Result<(), CapabilityError> {
        std::fs::create_dir_all(&self.sock_dir)?;
        let path = self.sock_dir.join(format!("{pack_id}.sock"));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(target: "rumi.capability.listen", pack_id = %pack_id, path = %path.display(), "capability broker listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let broker = self.clone();
            let pack_id = pack_id.clone();
            tokio::spawn(async move { broker.serve_connection(pack_id, stream).await });
        }
    }

    async fn serve_connection(&self, principal_id: String, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let req: CapabilityRequest = match rumi_protocol::read_framed(&mut reader).await {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(e) => {
                    warn!(target: "rumi.capability.frame", principal_id = %principal_id, error = %e, "malformed request frame");
                    return;
                }
            };
            let response = self.handle(&principal_id, req).await;
            if rumi_protocol::write_framed(&mut write_half, &response).await.is_err() {
                return;
            }
        }
    }

    async fn handle(&self, principal_id: &str, req: CapabilityRequest) -> CapabilityResponse {
        let permission_id = req.permission_id.clone();
        match self.handle_inner(principal_id, req).await {
            Ok(result) => {
                self.audit_attempt(principal_id, &permission_id, true, None).await;
                CapabilityResponse { allowed: true, result: Some(result), rejection_reason: None }
            }
            Err(reason) => {
                self.audit_attempt(principal_id, &permission_id, false, Some(reason.clone())).await;
                CapabilityResponse { allowed: false, result: None, rejection_reason: Some(reason) }
            }
        }
    }

    async fn handle_inner(
        &self,
        principal_id: &str,
        req: CapabilityRequest,
    ) -> Result<serde_json::Value, String> {
        if !self.grants.has_capability_grant(principal_id, &req.permission_id) {
            return Err("no capability grant for this permission".to_string());
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&req.permission_id)
                .cloned()
                .ok_or_else(|| format!("no installed handler for permission `{}`", req.permission_id))?
        };

        let current_sha = sha256_file(&handler.handler_py).map_err(|e| format!("reading handler.py: {e}"))?;
        let trust = TrustStore::load(&self.user_data_root).map_err(|e| e.to_string())?;
        if !trust.is_trusted(&handler.handler_id, &current_sha) {
            return Err(format!("handler `{}` is no longer trust-approved", handler.handler_id));
        }

        self.execute_handler(&handler, req.args).await
    }

    /// Runs the handler entrypoint in a dedicated, short-lived host process
    /// (not a container: capability handlers are the privileged boundary
    /// and run with the Kernel's own host identity, §4.6 dispatch step 4).
    async fn execute_handler(
        &self,
        handler: &InstalledHandler,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("python3")
            .arg(&handler.entrypoint)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawning handler entrypoint: {e}"))?;

        let payload = serde_json::to_vec(&args).map_err(|e| format!("encoding handler args: {e}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| format!("writing handler stdin: {e}"))?;
        }

        let output =
            child.wait_with_output().await.map_err(|e| format!("waiting on handler process: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "handler exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| format!("invalid JSON on handler stdout: {e}"))
    }

    async fn audit_attempt(&self, principal_id: &str, permission_id: &str, allowed: bool, rejection_reason: Option<String>) {
        let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::Capability, "capability_dispatch");
        entry.success = allowed;
        entry.pack_id = Some(principal_id.to_string());
        entry.severity = if allowed { rumi_core::AuditSeverity::Info } else { rumi_core::AuditSeverity::Warning };
        entry.details.insert("permission_id".into(), serde_json::json!(permission_id));
        entry.rejection_reason = rejection_reason;
        let _ = self.audit.record(entry).await;
    }
}

/// Grant `permission_id` to `principal_id`: the step that turns an
/// `installed` handler into one a given Pack may actually call. Thin
/// wrapper kept here (rather than requiring callers reach into
/// `rumi-grant` directly) so the Trust/Grant separation reads as one API
/// (§4.6: "Approval records installed; it does NOT grant usage").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Principal (always a `pack_id`) receiving the grant.
    pub principal_id: String,
    /// Permission id being granted.
    pub permission_id: String,
    /// Operator identity issuing the grant.
    pub granted_by: String,
}

/// Issue a capability grant, independent of the approval/install flow.
pub fn grant(grants: &GrantStore, req: GrantRequest) -> Result<(), RumiError> {
    grants
        .grant_capability(&req.principal_id, &req.permission_id, &req.granted_by)
        .map_err(RumiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumi_candidate::{CandidateDiscoverer as _, CandidateManager};
    use std::fs;

    fn write_handler(ecosystem_root: &Path, pack_id: &str, slug: &str, handler_id: &str, permission_id: &str) {
        let dir = ecosystem_root.join(pack_id).join(HANDLERS_DIR).join(slug);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(HANDLER_MANIFEST),
            serde_json::json!({
                "handler_id": handler_id,
                "permission_id": permission_id,
                "entrypoint": "handler.py",
            })
            .to_string(),
        )
        .unwrap();
        fs::write(dir.join(HANDLER_ENTRYPOINT_DEFAULT), "print('hello')\n").unwrap();
    }

    #[test]
    fn discover_finds_handler_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");
        let discoverer = CapabilityDiscoverer::new(tmp.path(), tmp.path().join("user_data"));
        let found = discoverer.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handler_id, "weather-handler");
        assert_eq!(found[0].permission_id, "net.weather");
    }

    #[test]
    fn candidate_key_changes_when_handler_py_edited() {
        let tmp = tempfile::tempdir().unwrap();
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");
        let discoverer = CapabilityDiscoverer::new(tmp.path(), tmp.path().join("user_data"));
        let before = discoverer.discover().unwrap();
        let key_before = CapabilityDiscoverer::candidate_key(&before[0]);

        fs::write(
            tmp.path().join("acme").join(HANDLERS_DIR).join("weather").join(HANDLER_ENTRYPOINT_DEFAULT),
            "print('edited')\n",
        )
        .unwrap();
        let after = discoverer.discover().unwrap();
        let key_after = CapabilityDiscoverer::candidate_key(&after[0]);
        assert_ne!(key_before, key_after);
    }

    #[test]
    fn approve_installs_and_trusts_handler() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");

        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let mut mgr = CandidateManager::load(discoverer, user_data.join("capabilities/candidates.json")).unwrap();
        let keys = mgr.scan().unwrap();
        mgr.approve(&keys[0]).unwrap();

        assert!(user_data.join("capabilities/handlers/weather/handler.py").is_file());
        let trust = TrustStore::load(&user_data).unwrap();
        let sha = sha256_file(&tmp.path().join("acme").join(HANDLERS_DIR).join("weather/handler.py")).unwrap();
        assert!(trust.is_trusted("weather-handler", &sha));
    }

    #[test]
    fn approve_fails_when_handler_py_edited_after_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");

        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let mut mgr = CandidateManager::load(discoverer, user_data.join("capabilities/candidates.json")).unwrap();
        let keys = mgr.scan().unwrap();

        fs::write(
            tmp.path().join("acme").join(HANDLERS_DIR).join("weather").join(HANDLER_ENTRYPOINT_DEFAULT),
            "print('tampered')\n",
        )
        .unwrap();

        let err = mgr.approve(&keys[0]).unwrap_err();
        assert!(matches!(err, rumi_candidate::CandidateError::InstallFailed { .. }));
        assert!(!user_data.join("capabilities/handlers/weather/handler.py").is_file());
    }

    #[test]
    fn approve_rejects_entrypoint_with_dotdot() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        let dir = tmp.path().join("acme").join(HANDLERS_DIR).join("weather");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(HANDLER_MANIFEST),
            serde_json::json!({
                "handler_id": "weather-handler",
                "permission_id": "net.weather",
                "entrypoint": "../../etc/passwd",
            })
            .to_string(),
        )
        .unwrap();
        fs::write(dir.join(HANDLER_ENTRYPOINT_DEFAULT), "print('hello')\n").unwrap();

        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let mut mgr = CandidateManager::load(discoverer, user_data.join("capabilities/candidates.json")).unwrap();
        let keys = mgr.scan().unwrap();
        let err = mgr.approve(&keys[0]).unwrap_err();
        assert!(matches!(err, rumi_candidate::CandidateError::InstallFailed { .. }));
    }

    #[test]
    fn approve_is_idempotent_for_identical_reinstall() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");

        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let candidate = discoverer.discover().unwrap().remove(0);
        discoverer.perform_install(&candidate).unwrap();
        // Re-running install against the identical candidate must not error.
        discoverer.perform_install(&candidate).unwrap();
    }

    #[tokio::test]
    async fn dispatch_denies_without_capability_grant() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");
        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let candidate = discoverer.discover().unwrap().remove(0);
        discoverer.perform_install(&candidate).unwrap();

        let grants = Arc::new(GrantStore::open(&user_data).unwrap());
        let audit = Arc::new(rumi_audit::AuditLog::open(&user_data).await.unwrap());
        let broker =
            CapabilityBroker::new(grants, audit, &user_data, user_data.join("sockets")).await.unwrap();

        let err = broker
            .handle_inner("acme", CapabilityRequest { permission_id: "net.weather".into(), args: serde_json::json!({}) })
            .await
            .unwrap_err();
        assert!(err.contains("grant"));
    }

    #[tokio::test]
    async fn dispatch_denies_when_handler_not_trusted() {
        let tmp = tempfile::tempdir().unwrap();
        let user_data = tmp.path().join("user_data");
        write_handler(tmp.path(), "acme", "weather", "weather-handler", "net.weather");
        let discoverer = CapabilityDiscoverer::new(tmp.path(), &user_data);
        let candidate = discoverer.discover().unwrap().remove(0);
        discoverer.perform_install(&candidate).unwrap();

        let grants = Arc::new(GrantStore::open(&user_data).unwrap());
        grants.grant_capability("acme", "net.weather", "operator").unwrap();
        // Tamper with the installed copy after trust was recorded for the original hash.
        fs::write(user_data.join("capabilities/handlers/weather/handler.py"), "print('evil')\n").unwrap();

        let audit = Arc::new(rumi_audit::AuditLog::open(&user_data).await.unwrap());
        let broker =
            CapabilityBroker::new(grants, audit, &user_data, user_data.join("sockets")).await.unwrap();

        let err = broker
            .handle_inner("acme", CapabilityRequest { permission_id: "net.weather".into(), args: serde_json::json!({}) })
            .await
            .unwrap_err();
        assert!(err.contains("trust"));
    }
}
