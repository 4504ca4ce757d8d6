// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-block
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! `BlockExecutor`: resolves a `python_file_call` Step's target file under
//! its owning Pack's root, runs it inside an isolated per-invocation
//! container, and implements [`rumi_flow::BlockDispatcher`] so `rumi-flow`
//! never links container/process concerns directly (§4.4).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumi_error::{ErrorKind, RumiError};
use rumi_flow::BlockDispatcher;
use rumi_host::retry::{spawn_with_retry, RetryConfig};
use rumi_host::{ContainerSpec, ExecContext, HostError};
use rumi_integrity::ApprovalStore;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

/// Candidate subdirectories tried, in order, under a Pack's root when
/// resolving a `python_file_call` Step's `file` field. The raw relative
/// path (no prefix) is always tried last.
const CANDIDATE_SUBDIRS: &[&str] = &["blocks", "backend/blocks", "backend/components", "backend"];

/// Errors raised while resolving or dispatching a block invocation.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// The owning Pack has no recorded approval-state entry.
    #[error("pack `{0}` has no approval record")]
    UnknownPack(String),
    /// No candidate path existed under the Pack root for the requested file.
    #[error("block file `{file}` not found under pack `{pack_id}`")]
    NotFound {
        /// Owning Pack id.
        pack_id: String,
        /// Requested relative file path.
        file: String,
    },
    /// A candidate path resolved (via symlink or `..`) outside the Pack root.
    #[error("block file `{file}` for pack `{pack_id}` resolved outside the pack root")]
    PathEscape {
        /// Owning Pack id.
        pack_id: String,
        /// Requested relative file path.
        file: String,
    },
    /// Container execution failed even after retries, and host fallback is
    /// either disabled or also failed.
    #[error("container execution failed: {0}")]
    Container(#[from] HostError),
    /// Host-Python permissive-mode fallback failed.
    #[error("host-python fallback failed: {0}")]
    HostFallback(String),
    /// Underlying I/O error (path canonicalization, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BlockError> for RumiError {
    fn from(err: BlockError) -> Self {
        let kind = match &err {
            BlockError::UnknownPack(_) => ErrorKind::NotApproved,
            BlockError::NotFound { .. } => ErrorKind::SchemaInvalid,
            BlockError::PathEscape { .. } => ErrorKind::PathEscape,
            BlockError::Container(HostError::Timeout { .. }) => ErrorKind::Timeout,
            BlockError::Container(HostError::Cancelled) => ErrorKind::Cancelled,
            BlockError::Container(_) | BlockError::HostFallback(_) => ErrorKind::ContainerUnavailable,
            BlockError::Io(_) => ErrorKind::SchemaInvalid,
        };
        RumiError::new(kind, err.to_string())
    }
}

/// Static configuration for every container a `BlockExecutor` spawns.
#[derive(Debug, Clone)]
pub struct BlockExecutorConfig {
    /// Docker image used for block invocations.
    pub default_image: String,
    /// Directory holding per-Pack Egress broker UDS sockets.
    pub egress_sock_dir: PathBuf,
    /// Directory holding per-Pack Capability broker UDS sockets.
    pub capability_sock_dir: PathBuf,
    /// Supplementary GID granting container access to Egress sockets.
    pub egress_socket_gid: Option<u32>,
    /// Supplementary GID granting container access to Capability sockets.
    pub capability_socket_gid: Option<u32>,
    /// Default memory limit applied to block containers, in megabytes.
    pub default_memory_limit_mb: u64,
    /// Wall-clock timeout for a single block invocation.
    pub timeout: Duration,
    /// Mirrors `RUMI_SECURITY_MODE=permissive`: allow falling back to host
    /// Python when container execution is unavailable.
    pub permissive_fallback: bool,
    /// Retry policy applied to container spawn failures.
    pub retry: RetryConfig,
}

impl Default for BlockExecutorConfig {
    fn default() -> Self {
        Self {
            default_image: "rumi/python-block:latest".to_string(),
            egress_sock_dir: PathBuf::from("/run/rumi/egress/packs"),
            capability_sock_dir: PathBuf::from("/run/rumi/capability/packs"),
            egress_socket_gid: None,
            capability_socket_gid: None,
            default_memory_limit_mb: rumi_host::DEFAULT_MEMORY_LIMIT_MB,
            timeout: Duration::from_secs(30),
            permissive_fallback: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Resolves and runs a Pack's `python_file_call` target inside an isolated
/// per-invocation container (or, in permissive mode, on the host as a
/// last resort).
pub struct BlockExecutor {
    approvals: Arc<Mutex<ApprovalStore>>,
    audit: Arc<rumi_audit::AuditLog>,
    user_data_root: PathBuf,
    config: BlockExecutorConfig,
}

impl BlockExecutor {
    /// Build a `BlockExecutor` over a shared `ApprovalStore` and `AuditLog`.
    pub fn new(
        approvals: Arc<Mutex<ApprovalStore>>,
        audit: Arc<rumi_audit::AuditLog>,
        user_data_root: impl Into<PathBuf>,
        config: BlockExecutorConfig,
    ) -> Self {
        Self { approvals, audit, user_data_root: user_data_root.into(), config }
    }

    async fn pack_root(&self, pack_id: &str) -> Result<PathBuf, BlockError> {
        let approvals = self.approvals.lock().await;
        let pack = approvals.get(pack_id).ok_or_else(|| BlockError::UnknownPack(pack_id.to_string()))?;
        Ok(PathBuf::from(&pack.root))
    }

    /// Resolve `file_rel` to an absolute, canonicalized path strictly inside
    /// `pack_root`, trying [`CANDIDATE_SUBDIRS`] in order before the raw
    /// relative path. Any candidate that exists but canonicalizes outside
    /// the Pack root is treated as an escape attempt and refused immediately
    /// (it does not fall through to the next candidate).
    pub fn resolve_block_path(pack_root: &Path, pack_id: &str, file_rel: &str) -> Result<PathBuf, BlockError> {
        let canonical_root = pack_root.canonicalize()?;

        let mut candidates: Vec<PathBuf> =
            CANDIDATE_SUBDIRS.iter().map(|sub| pack_root.join(sub).join(file_rel)).collect();
        candidates.push(pack_root.join(file_rel));

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            let canonical = candidate.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                warn!(
                    target: "rumi.block.resolve",
                    pack_id,
                    file = file_rel,
                    resolved = %canonical.display(),
                    "refusing block path that escapes pack root"
                );
                return Err(BlockError::PathEscape { pack_id: pack_id.to_string(), file: file_rel.to_string() });
            }
            return Ok(canonical);
        }

        Err(BlockError::NotFound { pack_id: pack_id.to_string(), file: file_rel.to_string() })
    }

    fn container_spec(&self, pack_id: &str, pack_root: &Path, resolved_file: &Path) -> ContainerSpec {
        let mut spec = ContainerSpec::new(pack_id, self.config.default_image.clone(), pack_root.to_path_buf());
        spec.memory_limit_mb = self.config.default_memory_limit_mb;
        spec.timeout = self.config.timeout;
        spec.data_dir = Some(self.user_data_root.join("packs").join(pack_id));

        let egress_sock = self.config.egress_sock_dir.join(format!("{pack_id}.sock"));
        if egress_sock.exists() {
            spec.egress_socket = Some(egress_sock);
            spec.egress_socket_gid = self.config.egress_socket_gid;
        }
        let capability_sock = self.config.capability_sock_dir.join(format!("{pack_id}.sock"));
        if capability_sock.exists() {
            spec.capability_socket = Some(capability_sock);
            spec.capability_socket_gid = self.config.capability_socket_gid;
        }

        let mut env = BTreeMap::new();
        if let Ok(rel) = resolved_file.strip_prefix(pack_root.canonicalize().unwrap_or_else(|_| pack_root.to_path_buf())) {
            env.insert("RUMI_BLOCK_FILE".to_string(), rel.to_string_lossy().to_string());
        }
        spec.env = env;
        spec
    }

    async fn run_in_container(
        &self,
        pack_id: &str,
        pack_root: &Path,
        resolved_file: &Path,
        input_data: Value,
        exec_context: rumi_protocol::BlockExecContext,
        cancel: rumi_core::CancellationToken,
    ) -> Result<Value, HostError> {
        let spec = self.container_spec(pack_id, pack_root, resolved_file);
        let outcome = spawn_with_retry(spec, &self.config.retry).await?;
        let host_ctx = ExecContext {
            flow_id: exec_context.flow_id,
            step_id: exec_context.step_id,
            phase: exec_context.phase,
            ts: chrono::DateTime::parse_from_rfc3339(&exec_context.ts)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
            owner_pack: exec_context.owner_pack,
        };
        outcome.value.run(input_data, host_ctx, cancel).await
    }

    /// Last-resort execution path for `RUMI_SECURITY_MODE=permissive`: runs
    /// the resolved file with the host's `python3` interpreter, outside any
    /// container isolation. Every invocation of this path is audited at
    /// `warning` severity.
    async fn run_on_host(&self, resolved_file: &Path, input_data: &Value) -> Result<Value, BlockError> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("python3")
            .arg(resolved_file)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| BlockError::HostFallback(e.to_string()))?;

        let payload = serde_json::to_vec(input_data).map_err(|e| BlockError::HostFallback(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| BlockError::HostFallback(e.to_string()))?;
        }

        let output = child.wait_with_output().await.map_err(|e| BlockError::HostFallback(e.to_string()))?;
        if !output.status.success() {
            return Err(BlockError::HostFallback(format!(
                "host python exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| BlockError::HostFallback(format!("invalid JSON on stdout: {e}")))
    }

    async fn record_permissive_fallback(&self, pack_id: &str, file: &str, reason: &str) {
        let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::Container, "permissive_host_fallback");
        entry.severity = rumi_core::AuditSeverity::Warning;
        entry.pack_id = Some(pack_id.to_string());
        entry.details.insert("file".into(), Value::String(file.to_string()));
        entry.details.insert("reason".into(), Value::String(reason.to_string()));
        let _ = self.audit.record(entry).await;
    }

    async fn record_container_failure(&self, pack_id: &str, file: &str, error: &str) {
        let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::Container, "container_execution_failed");
        entry.success = false;
        entry.severity = rumi_core::AuditSeverity::Error;
        entry.pack_id = Some(pack_id.to_string());
        entry.details.insert("file".into(), Value::String(file.to_string()));
        entry.rejection_reason = Some(error.to_string());
        let _ = self.audit.record(entry).await;
    }
}

#[async_trait]
impl BlockDispatcher for BlockExecutor {
    async fn run(
        &self,
        owner_pack: &str,
        file: &str,
        input_data: Value,
        exec_context: rumi_protocol::BlockExecContext,
        cancel: rumi_core::CancellationToken,
    ) -> Result<Value, RumiError> {
        let pack_root = self.pack_root(owner_pack).await?;
        let resolved = Self::resolve_block_path(&pack_root, owner_pack, file)?;

        match self
            .run_in_container(owner_pack, &pack_root, &resolved, input_data.clone(), exec_context, cancel)
            .await
        {
            Ok(value) => Ok(value),
            Err(host_err) => {
                self.record_container_failure(owner_pack, file, &host_err.to_string()).await;
                if self.config.permissive_fallback {
                    self.record_permissive_fallback(owner_pack, file, &host_err.to_string()).await;
                    self.run_on_host(&resolved, &input_data).await.map_err(RumiError::from)
                } else {
                    Err(BlockError::Container(host_err).into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn resolves_file_directly_under_blocks_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let pack_root = tmp.path().join("demo");
        write(&pack_root.join("blocks/main.py"), "print('hi')");

        let resolved = BlockExecutor::resolve_block_path(&pack_root, "demo", "main.py").unwrap();
        assert_eq!(resolved, pack_root.join("blocks/main.py").canonicalize().unwrap());
    }

    #[test]
    fn falls_back_through_candidate_subdirs_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let pack_root = tmp.path().join("demo");
        write(&pack_root.join("backend/components/gen.py"), "print('hi')");

        let resolved = BlockExecutor::resolve_block_path(&pack_root, "demo", "gen.py").unwrap();
        assert_eq!(resolved, pack_root.join("backend/components/gen.py").canonicalize().unwrap());
    }

    #[test]
    fn raw_relative_path_is_tried_last() {
        let tmp = tempfile::tempdir().unwrap();
        let pack_root = tmp.path().join("demo");
        write(&pack_root.join("scripts/raw.py"), "print('hi')");

        let resolved = BlockExecutor::resolve_block_path(&pack_root, "demo", "scripts/raw.py").unwrap();
        assert_eq!(resolved, pack_root.join("scripts/raw.py").canonicalize().unwrap());
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let pack_root = tmp.path().join("demo");
        fs::create_dir_all(&pack_root).unwrap();

        let err = BlockExecutor::resolve_block_path(&pack_root, "demo", "missing.py").unwrap_err();
        assert!(matches!(err, BlockError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let pack_root = tmp.path().join("demo");
        let outside = tmp.path().join("outside.py");
        write(&outside, "print('secret')");
        fs::create_dir_all(pack_root.join("blocks")).unwrap();
        std::os::unix::fs::symlink(&outside, pack_root.join("blocks/escape.py")).unwrap();

        let err = BlockExecutor::resolve_block_path(&pack_root, "demo", "escape.py").unwrap_err();
        assert!(matches!(err, BlockError::PathEscape { .. }));
    }
}
