// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-host
#![deny(unsafe_code)]
//!
//! Container supervision for Pack runtime execution. A Pack's Python blocks
//! never run on the host directly — they run inside a locked-down Docker
//! container spawned and supervised via `tokio::process::Command`, following
//! this codebase's existing convention of shelling out to external processes
//! rather than linking a container-engine client library.

pub mod retry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Default memory cap applied to `lib/*` container invocations, in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;

/// Fixed in-container path where the Pack directory is bind-mounted (read-only).
pub const PACK_MOUNT_PATH: &str = "/pack";
/// Fixed in-container path where pip-installed site-packages are bind-mounted.
pub const PIP_PACKAGES_MOUNT_PATH: &str = "/pip-packages";
/// Fixed in-container path for the writable per-Pack data directory.
pub const DATA_MOUNT_PATH: &str = "/data";
/// Fixed in-container path for the Egress broker's Unix domain socket.
pub const EGRESS_SOCKET_MOUNT_PATH: &str = "/run/rumi/egress.sock";
/// Fixed in-container path for the Capability broker's Unix domain socket.
pub const CAPABILITY_SOCKET_MOUNT_PATH: &str = "/run/rumi/capability.sock";

/// UID/GID the container process runs as — the conventional "nobody" id.
const CONTAINER_USER: &str = "65534:65534";

/// How long [`terminate_gracefully`] waits for voluntary exit before
/// escalating to `kill()`, on both timeout and cancellation.
const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Describes one container invocation for a Pack's block execution.
///
/// Constructed per-call by `BlockExecutor` and handed to [`ContainerRunner`],
/// which turns it into `docker run` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Pack this container is executing on behalf of.
    pub pack_id: String,
    /// Docker image reference to run.
    pub image: String,
    /// Host path to the Pack's root directory, bind-mounted read-only at
    /// [`PACK_MOUNT_PATH`].
    pub pack_root: PathBuf,
    /// Host path to pip-installed site-packages for this Pack, if any,
    /// bind-mounted read-only at [`PIP_PACKAGES_MOUNT_PATH`].
    pub pip_packages_dir: Option<PathBuf>,
    /// Host path to the Pack's writable data directory
    /// (`user_data/packs/<pack_id>/`), bind-mounted at [`DATA_MOUNT_PATH`].
    pub data_dir: Option<PathBuf>,
    /// Host path to this Pack's Egress broker UDS socket.
    pub egress_socket: Option<PathBuf>,
    /// Host path to this Pack's Capability broker UDS socket.
    pub capability_socket: Option<PathBuf>,
    /// Supplementary GID granting access to the Egress socket.
    pub egress_socket_gid: Option<u32>,
    /// Supplementary GID granting access to the Capability socket.
    pub capability_socket_gid: Option<u32>,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock timeout for the whole invocation.
    #[serde(with = "rumi_serde_duration::duration_millis")]
    pub timeout: Duration,
    /// Extra environment variables passed into the container (e.g. `PYTHONPATH`).
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Create a spec with defaults (256m memory, 30s timeout, no optional mounts).
    pub fn new(pack_id: impl Into<String>, image: impl Into<String>, pack_root: PathBuf) -> Self {
        Self {
            pack_id: pack_id.into(),
            image: image.into(),
            pack_root,
            pip_packages_dir: None,
            data_dir: None,
            egress_socket: None,
            capability_socket: None,
            egress_socket_gid: None,
            capability_socket_gid: None,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            timeout: Duration::from_secs(30),
            env: BTreeMap::new(),
        }
    }

    /// Build the full `docker run` argument list for this spec.
    ///
    /// Always includes `--rm`, `--network=none`, `--cap-drop=ALL`,
    /// `--read-only`, and a non-root `--user`.
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--network=none".to_string(),
            "--cap-drop=ALL".to_string(),
            "--read-only".to_string(),
            format!("--user={CONTAINER_USER}"),
            format!("--memory={}m", self.memory_limit_mb),
        ];

        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            self.pack_root.display(),
            PACK_MOUNT_PATH
        ));

        if let Some(dir) = &self.pip_packages_dir {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", dir.display(), PIP_PACKAGES_MOUNT_PATH));
            args.push("-e".to_string());
            args.push(format!("PYTHONPATH={PIP_PACKAGES_MOUNT_PATH}"));
        }

        if let Some(dir) = &self.data_dir {
            args.push("-v".to_string());
            args.push(format!("{}:{}", dir.display(), DATA_MOUNT_PATH));
        }

        if let Some(sock) = &self.egress_socket {
            args.push("-v".to_string());
            args.push(format!("{}:{}", sock.display(), EGRESS_SOCKET_MOUNT_PATH));
        }
        if let Some(sock) = &self.capability_socket {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                sock.display(),
                CAPABILITY_SOCKET_MOUNT_PATH
            ));
        }

        for gid in [self.egress_socket_gid, self.capability_socket_gid]
            .into_iter()
            .flatten()
        {
            args.push("--group-add".to_string());
            args.push(gid.to_string());
        }

        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }

        args.push(self.image.clone());
        args
    }
}

/// Fields accompanying a block invocation, mirroring the Flow's execution
/// context at the point the `python_file_call` step was dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecContext {
    pub flow_id: String,
    pub step_id: String,
    pub phase: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub owner_pack: String,
}

/// Errors from container process management.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn container: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write container stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to read container stdout: {0}")]
    Stdout(#[source] std::io::Error),

    #[error("container crashed (code={code:?}), stderr: {stderr}")]
    ContainerCrashed { code: Option<i32>, stderr: String },

    #[error("container exited with non-zero status {code:?}, stderr: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("container output was not a valid JSON document: {0}")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("container exited unexpectedly (code={code:?})")]
    Exited { code: Option<i32> },

    #[error("container invocation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("container invocation cancelled")]
    Cancelled,
}

/// Supervises a single `docker run` invocation for one block execution.
///
/// Created via [`ContainerRunner::spawn`], consumed via [`ContainerRunner::run`].
/// Not `Clone` — each runner owns exactly one child process.
#[derive(Debug)]
pub struct ContainerRunner {
    child: Child,
    pack_id: String,
    timeout: Duration,
}

impl ContainerRunner {
    /// Spawn `docker run` for the given spec. The container is started but
    /// has not yet received its input.
    pub async fn spawn(spec: ContainerSpec) -> Result<Self, HostError> {
        let mut cmd = Command::new("docker");
        cmd.args(spec.docker_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            target: "rumi.host.spawn",
            pack_id = %spec.pack_id,
            image = %spec.image,
            "spawning container"
        );

        let child = cmd.spawn().map_err(HostError::Spawn)?;

        Ok(Self {
            child,
            pack_id: spec.pack_id,
            timeout: spec.timeout,
        })
    }

    /// Write `input_data`/`exec_context` as a single JSON document to the
    /// container's stdin, then read a single JSON document from stdout.
    /// stderr is captured in full and surfaced on error.
    ///
    /// The whole exchange is bounded by the spec's `timeout`; on expiry the
    /// container is killed and [`HostError::Timeout`] is returned. `cancel`
    /// is observed for the same duration — if it fires first the container
    /// is killed and [`HostError::Cancelled`] is returned.
    pub async fn run(
        mut self,
        input_data: serde_json::Value,
        exec_context: ExecContext,
        cancel: rumi_core::CancellationToken,
    ) -> Result<serde_json::Value, HostError> {
        let payload = serde_json::json!({
            "input_data": input_data,
            "exec_context": exec_context,
        });
        let body = serde_json::to_vec(&payload).map_err(HostError::InvalidOutput)?;

        let pack_id = self.pack_id.clone();
        let timeout = self.timeout;

        let run = async {
            let mut stdin = self
                .child
                .stdin
                .take()
                .ok_or_else(|| HostError::Stdin(std::io::Error::other("stdin unavailable")))?;
            stdin.write_all(&body).await.map_err(HostError::Stdin)?;
            drop(stdin);

            let mut stdout = self
                .child
                .stdout
                .take()
                .ok_or_else(|| HostError::Stdout(std::io::Error::other("stdout unavailable")))?;
            let mut out_buf = Vec::new();
            stdout
                .read_to_end(&mut out_buf)
                .await
                .map_err(HostError::Stdout)?;

            let mut stderr_buf = String::new();
            if let Some(mut stderr) = self.child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_buf).await;
            }

            let status = self.child.wait().await.map_err(HostError::Stdout)?;

            if !status.success() {
                warn!(
                    target: "rumi.host.run",
                    pack_id = %pack_id,
                    code = ?status.code(),
                    "container exited with non-zero status"
                );
                return Err(HostError::NonZeroExit {
                    code: status.code(),
                    stderr: stderr_buf,
                });
            }

            serde_json::from_slice(&out_buf).map_err(HostError::InvalidOutput)
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, run) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        target: "rumi.host.run",
                        pack_id = %pack_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "container invocation timed out"
                    );
                    terminate_gracefully(&mut self.child, TERMINATION_GRACE_PERIOD).await;
                    Err(HostError::Timeout { duration: timeout })
                }
            },
            () = cancel.cancelled() => {
                warn!(
                    target: "rumi.host.run",
                    pack_id = %pack_id,
                    "container invocation cancelled"
                );
                terminate_gracefully(&mut self.child, TERMINATION_GRACE_PERIOD).await;
                Err(HostError::Cancelled)
            }
        }
    }
}

/// Escalate shutdown of a still-running container: wait up to `grace_period`
/// for voluntary exit, then `kill()` (`SIGKILL`) the `docker` client process.
///
/// `tokio::process::Child` does not expose `SIGTERM` directly, so graceful
/// shutdown relies on the container's own entrypoint honoring stdin closure;
/// this function is the hard backstop for cancellation and executor shutdown.
pub async fn terminate_gracefully(child: &mut Child, grace_period: Duration) {
    if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
