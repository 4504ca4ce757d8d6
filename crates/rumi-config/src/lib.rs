// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the rumi kernel.
//!
//! This crate provides [`RumiConfig`] — the top-level runtime settings from
//! SPEC_FULL.md §2.1/§6 — together with helpers for loading from an optional
//! TOML file, overlaying the recognised environment variables, and producing
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// Two configs could not be merged because of conflicting constraints.
    #[error("merge conflict: {reason}")]
    MergeConflict {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A deprecated field was used in the configuration.
    DeprecatedField {
        /// Name of the deprecated field.
        field: String,
        /// Suggested replacement, if any.
        suggestion: Option<String>,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A container memory limit is unusually large.
    LargeMemoryLimit {
        /// The configured limit, in megabytes.
        mb: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field, suggestion } => {
                write!(f, "deprecated field '{field}'")?;
                if let Some(s) = suggestion {
                    write!(f, " — use '{s}' instead")?;
                }
                Ok(())
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeMemoryLimit { mb } => {
                write!(f, "container memory limit is unusually large ({mb}MB)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Docker isolation requirement for block execution (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Containers are mandatory; a container start failure aborts the block.
    #[default]
    Strict,
    /// Execution may fall back to host Python if no container runtime is
    /// available. Every such fallback emits a `warning`-severity audit entry.
    Permissive,
}

/// Whether locally-authored Packs (not yet scanned from `ecosystem/`) are
/// auto-trusted or still require the normal approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocalPackMode {
    /// No special handling for local Packs.
    #[default]
    Off,
    /// Local Packs still require explicit approval like any other Pack.
    RequireApproval,
}

/// Top-level runtime configuration for the rumi kernel.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RumiConfig {
    /// Root of the persisted `user_data/` layout (§6).
    #[serde(default = "default_user_data_root")]
    pub user_data_root: String,

    /// Root under which `ecosystem/<pack_id>/` Packs are discovered.
    #[serde(default = "default_ecosystem_root")]
    pub ecosystem_root: String,

    /// Docker isolation requirement.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Local-Pack handling mode.
    #[serde(default)]
    pub local_pack_mode: LocalPackMode,

    /// Numeric GID attached to egress broker sockets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_socket_gid: Option<u32>,

    /// Numeric GID attached to capability broker sockets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_socket_gid: Option<u32>,

    /// Egress socket file mode, e.g. `"0660"`.
    #[serde(default = "default_socket_mode")]
    pub egress_socket_mode: String,

    /// Capability socket file mode, e.g. `"0660"`.
    #[serde(default = "default_socket_mode")]
    pub capability_socket_mode: String,

    /// Base directory for egress broker Unix domain sockets.
    #[serde(default = "default_egress_sock_dir")]
    pub egress_sock_dir: String,

    /// Base directory for capability broker Unix domain sockets.
    #[serde(default = "default_capability_sock_dir")]
    pub capability_sock_dir: String,

    /// Default memory cap, in megabytes, applied to `lib/*` container
    /// invocations (§4.4). Block-step containers may override this.
    #[serde(default = "default_memory_limit_mb")]
    pub default_memory_limit_mb: u64,

    /// Log level override passed to the `tracing-subscriber` `EnvFilter`
    /// when `RUST_LOG` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for RumiConfig {
    fn default() -> Self {
        Self {
            user_data_root: default_user_data_root(),
            ecosystem_root: default_ecosystem_root(),
            security_mode: SecurityMode::default(),
            local_pack_mode: LocalPackMode::default(),
            egress_socket_gid: None,
            capability_socket_gid: None,
            egress_socket_mode: default_socket_mode(),
            capability_socket_mode: default_socket_mode(),
            egress_sock_dir: default_egress_sock_dir(),
            capability_sock_dir: default_capability_sock_dir(),
            default_memory_limit_mb: default_memory_limit_mb(),
            log_level: Some("info".into()),
        }
    }
}

impl RumiConfig {
    /// Path to the HMAC signing key used for `NetworkGrant`s, rooted under
    /// `user_data_root` (`permissions/.secret_key`, never logged).
    pub fn hmac_key_path(&self) -> std::path::PathBuf {
        Path::new(&self.user_data_root).join("permissions/.secret_key")
    }

    /// Path to the audit log directory (`<user_data_root>/audit/`).
    pub fn audit_dir(&self) -> std::path::PathBuf {
        Path::new(&self.user_data_root).join("audit")
    }
}

fn default_user_data_root() -> String {
    "user_data".to_string()
}

fn default_ecosystem_root() -> String {
    "ecosystem".to_string()
}

fn default_socket_mode() -> String {
    "0660".to_string()
}

fn default_egress_sock_dir() -> String {
    "/run/rumi/egress/packs".to_string()
}

fn default_capability_sock_dir() -> String {
    "/run/rumi/capability/packs".to_string()
}

fn default_memory_limit_mb() -> u64 {
    256
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const LARGE_MEMORY_THRESHOLD_MB: u64 = 4096;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`RumiConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`RumiConfig::default()`].
///
/// Environment variable overrides (§6) are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<RumiConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => RumiConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`RumiConfig`].
pub fn parse_toml(content: &str) -> Result<RumiConfig, ConfigError> {
    toml::from_str::<RumiConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply the environment variable overrides recognised in §6:
/// `RUMI_SECURITY_MODE`, `RUMI_LOCAL_PACK_MODE`, `RUMI_EGRESS_SOCKET_GID`,
/// `RUMI_CAPABILITY_SOCKET_GID`, `RUMI_EGRESS_SOCKET_MODE`,
/// `RUMI_CAPABILITY_SOCKET_MODE`, `RUMI_EGRESS_SOCK_DIR`,
/// `RUMI_CAPABILITY_SOCK_DIR`.
pub fn apply_env_overrides(config: &mut RumiConfig) {
    if let Ok(val) = std::env::var("RUMI_SECURITY_MODE") {
        match val.as_str() {
            "strict" => config.security_mode = SecurityMode::Strict,
            "permissive" => config.security_mode = SecurityMode::Permissive,
            _ => {}
        }
    }
    if let Ok(val) = std::env::var("RUMI_LOCAL_PACK_MODE") {
        match val.as_str() {
            "off" => config.local_pack_mode = LocalPackMode::Off,
            "require_approval" => config.local_pack_mode = LocalPackMode::RequireApproval,
            _ => {}
        }
    }
    if let Ok(val) = std::env::var("RUMI_EGRESS_SOCKET_GID")
        && let Ok(gid) = val.parse()
    {
        config.egress_socket_gid = Some(gid);
    }
    if let Ok(val) = std::env::var("RUMI_CAPABILITY_SOCKET_GID")
        && let Ok(gid) = val.parse()
    {
        config.capability_socket_gid = Some(gid);
    }
    if let Ok(val) = std::env::var("RUMI_EGRESS_SOCKET_MODE") {
        config.egress_socket_mode = val;
    }
    if let Ok(val) = std::env::var("RUMI_CAPABILITY_SOCKET_MODE") {
        config.capability_socket_mode = val;
    }
    if let Ok(val) = std::env::var("RUMI_EGRESS_SOCK_DIR") {
        config.egress_sock_dir = val;
    }
    if let Ok(val) = std::env::var("RUMI_CAPABILITY_SOCK_DIR") {
        config.capability_sock_dir = val;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (empty roots, malformed socket modes) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &RumiConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.user_data_root.trim().is_empty() {
        errors.push("user_data_root must not be empty".into());
    }
    if config.ecosystem_root.trim().is_empty() {
        errors.push("ecosystem_root must not be empty".into());
    }

    for (field, mode) in [
        ("egress_socket_mode", &config.egress_socket_mode),
        ("capability_socket_mode", &config.capability_socket_mode),
    ] {
        if mode.len() != 4
            || !mode.starts_with('0')
            || !mode.chars().all(|c| c.is_ascii_digit())
            || u32::from_str_radix(mode, 8).is_err()
        {
            errors.push(format!("{field}: '{mode}' is not a valid octal file mode"));
        }
    }

    if config.default_memory_limit_mb == 0 {
        errors.push("default_memory_limit_mb must be greater than zero".into());
    } else if config.default_memory_limit_mb > LARGE_MEMORY_THRESHOLD_MB {
        warnings.push(ConfigWarning::LargeMemoryLimit {
            mb: config.default_memory_limit_mb,
        });
    }

    if config.egress_socket_gid.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "egress_socket_gid".into(),
            hint: "containers will need the socket's default ownership to connect".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. A string/u64 field in `overlay` takes precedence
/// over `base` only when it differs from [`RumiConfig::default()`] for that
/// field; enum and `Option` fields in `overlay` always win when set.
pub fn merge_configs(base: RumiConfig, overlay: RumiConfig) -> RumiConfig {
    let defaults = RumiConfig::default();
    RumiConfig {
        user_data_root: pick(overlay.user_data_root, base.user_data_root, &defaults.user_data_root),
        ecosystem_root: pick(overlay.ecosystem_root, base.ecosystem_root, &defaults.ecosystem_root),
        security_mode: overlay.security_mode,
        local_pack_mode: overlay.local_pack_mode,
        egress_socket_gid: overlay.egress_socket_gid.or(base.egress_socket_gid),
        capability_socket_gid: overlay.capability_socket_gid.or(base.capability_socket_gid),
        egress_socket_mode: pick(
            overlay.egress_socket_mode,
            base.egress_socket_mode,
            &defaults.egress_socket_mode,
        ),
        capability_socket_mode: pick(
            overlay.capability_socket_mode,
            base.capability_socket_mode,
            &defaults.capability_socket_mode,
        ),
        egress_sock_dir: pick(overlay.egress_sock_dir, base.egress_sock_dir, &defaults.egress_sock_dir),
        capability_sock_dir: pick(
            overlay.capability_sock_dir,
            base.capability_sock_dir,
            &defaults.capability_sock_dir,
        ),
        default_memory_limit_mb: if overlay.default_memory_limit_mb != defaults.default_memory_limit_mb {
            overlay.default_memory_limit_mb
        } else {
            base.default_memory_limit_mb
        },
        log_level: overlay.log_level.or(base.log_level),
    }
}

/// Returns `overlay` if it differs from the shared default, else `base`.
fn pick(overlay: String, base: String, default: &str) -> String {
    if overlay != default { overlay } else { base }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
