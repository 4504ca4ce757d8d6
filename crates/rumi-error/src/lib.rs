// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the rumi execution substrate.
//!
//! Every fallible operation across the workspace returns `Result<T, RumiError>`
//! (or a crate-local error that converts into one at the crate boundary).
//! A [`RumiError`] carries a stable, machine-readable [`ErrorKind`], a
//! human-readable message, an optional source error, and a redacted
//! `BTreeMap<String, String>` of diagnostic context — never secret values.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family an [`ErrorKind`] belongs to, used for grouping in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Pack approval-state gating.
    Approval,
    /// Manifest/hash integrity verification.
    Integrity,
    /// Flow/Modifier composition and execution.
    Flow,
    /// Block/container execution.
    Execution,
    /// Egress broker policy enforcement.
    Egress,
    /// Capability broker trust/grant dispatch.
    Capability,
    /// SharedDict token resolution.
    SharedDict,
    /// Configuration loading/validation.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approval => "approval",
            Self::Integrity => "integrity",
            Self::Flow => "flow",
            Self::Execution => "execution",
            Self::Egress => "egress",
            Self::Capability => "capability",
            Self::SharedDict => "shared_dict",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable, machine-readable error kind. Each variant serializes to a
/// `SCREAMING_SNAKE_CASE` string guaranteed not to change across patch
/// releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Pack is not in the `approved` state (or a manifest-verification
    /// re-check failed) at the moment code execution was attempted.
    NotApproved,
    /// Manifest hash of a Pack's file tree no longer matches the approved
    /// manifest.
    IntegrityMismatch,
    /// A resolved path escaped its intended root (symlink or `..` escape).
    PathEscape,
    /// Egress request denied by allowlist/IP/scheme policy.
    PolicyDenied,
    /// No valid, HMAC-verified NetworkGrant exists for the caller.
    GrantMissing,
    /// Capability handler is not present in the TrustStore allowlist.
    TrustMissing,
    /// SharedDict resolution would introduce a cycle.
    Cycle,
    /// SharedDict rule collides with an existing `(namespace, token)` value.
    Collision,
    /// SharedDict resolution exceeded the configured hop limit.
    HopLimit,
    /// Operation exceeded its configured wall-clock timeout.
    Timeout,
    /// Operation was cancelled before completion.
    Cancelled,
    /// No container runtime is available to execute a block.
    ContainerUnavailable,
    /// Input failed schema validation.
    SchemaInvalid,
    /// Flow/Modifier composition conflict (missing target, duplicate id).
    Conflict,
}

impl ErrorKind {
    /// Returns the broad [`ErrorCategory`] this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotApproved => ErrorCategory::Approval,
            Self::IntegrityMismatch => ErrorCategory::Integrity,
            Self::Conflict => ErrorCategory::Flow,
            Self::PathEscape | Self::Timeout | Self::Cancelled | Self::ContainerUnavailable => {
                ErrorCategory::Execution
            }
            Self::PolicyDenied | Self::GrantMissing => ErrorCategory::Egress,
            Self::TrustMissing => ErrorCategory::Capability,
            Self::Cycle | Self::Collision | Self::HopLimit => ErrorCategory::SharedDict,
            Self::SchemaInvalid => ErrorCategory::Config,
        }
    }

    /// Stable `&'static str` representation (e.g. `"NOT_APPROVED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApproved => "NOT_APPROVED",
            Self::IntegrityMismatch => "INTEGRITY_MISMATCH",
            Self::PathEscape => "PATH_ESCAPE",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::GrantMissing => "GRANT_MISSING",
            Self::TrustMissing => "TRUST_MISSING",
            Self::Cycle => "CYCLE",
            Self::Collision => "COLLISION",
            Self::HopLimit => "HOP_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ContainerUnavailable => "CONTAINER_UNAVAILABLE",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RumiError
// ---------------------------------------------------------------------------

/// Unified error type returned by every fallible public operation in the
/// workspace.
///
/// # Builder usage
///
/// ```
/// use rumi_error::{RumiError, ErrorKind};
///
/// let err = RumiError::new(ErrorKind::NotApproved, "pack is not approved")
///     .with_context("pack_id", "weather-pack")
///     .with_context("state", "pending");
/// ```
pub struct RumiError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Redacted structured context. Never contains secret values.
    pub context: BTreeMap<String, String>,
}

impl RumiError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.kind.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl fmt::Debug for RumiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RumiError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for RumiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            for (k, v) in &self.context {
                write!(f, " {k}={v}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RumiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support (for embedding in audit entries)
// ---------------------------------------------------------------------------

/// Serializable snapshot of a [`RumiError`] (without the opaque source),
/// suitable for embedding in an `AuditEntry`'s `details` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RumiErrorDto {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, String>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&RumiError> for RumiErrorDto {
    fn from(err: &RumiError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::NotApproved,
        ErrorKind::IntegrityMismatch,
        ErrorKind::PathEscape,
        ErrorKind::PolicyDenied,
        ErrorKind::GrantMissing,
        ErrorKind::TrustMissing,
        ErrorKind::Cycle,
        ErrorKind::Collision,
        ErrorKind::HopLimit,
        ErrorKind::Timeout,
        ErrorKind::Cancelled,
        ErrorKind::ContainerUnavailable,
        ErrorKind::SchemaInvalid,
        ErrorKind::Conflict,
    ];

    #[test]
    fn basic_construction() {
        let err = RumiError::new(ErrorKind::NotApproved, "pack not approved");
        assert_eq!(err.kind, ErrorKind::NotApproved);
        assert_eq!(err.message, "pack not approved");
        assert!(err.context.is_empty());
    }

    #[test]
    fn context_is_chainable_and_deterministic() {
        let err = RumiError::new(ErrorKind::IntegrityMismatch, "hash drift")
            .with_context("pack_id", "demo")
            .with_context("path", "blocks/main.py");
        let rendered = err.to_string();
        // BTreeMap orders keys, so output is stable regardless of insertion order.
        assert!(rendered.contains("path=blocks/main.py"));
        assert!(rendered.contains("pack_id=demo"));
        assert!(rendered.find("path=").unwrap() < rendered.find("pack_id=").unwrap());
    }

    #[test]
    fn source_chain_is_preserved() {
        let io_err = io::Error::other("disk full");
        let err = RumiError::new(ErrorKind::ContainerUnavailable, "spawn failed")
            .with_source(io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn every_kind_has_a_stable_string_and_category() {
        let mut seen = HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()), "duplicate code: {kind}");
            // category() must not panic for any kind.
            let _ = kind.category();
        }
        assert_eq!(seen.len(), ALL_KINDS.len());
    }

    #[test]
    fn category_groupings_match_spec() {
        assert_eq!(ErrorKind::NotApproved.category(), ErrorCategory::Approval);
        assert_eq!(
            ErrorKind::IntegrityMismatch.category(),
            ErrorCategory::Integrity
        );
        assert_eq!(ErrorKind::Conflict.category(), ErrorCategory::Flow);
        assert_eq!(ErrorKind::PolicyDenied.category(), ErrorCategory::Egress);
        assert_eq!(ErrorKind::GrantMissing.category(), ErrorCategory::Egress);
        assert_eq!(ErrorKind::TrustMissing.category(), ErrorCategory::Capability);
        assert_eq!(ErrorKind::Cycle.category(), ErrorCategory::SharedDict);
        assert_eq!(ErrorKind::Collision.category(), ErrorCategory::SharedDict);
        assert_eq!(ErrorKind::HopLimit.category(), ErrorCategory::SharedDict);
        assert_eq!(ErrorKind::SchemaInvalid.category(), ErrorCategory::Config);
        assert_eq!(ErrorKind::PathEscape.category(), ErrorCategory::Execution);
        assert_eq!(ErrorKind::Timeout.category(), ErrorCategory::Execution);
        assert_eq!(ErrorKind::Cancelled.category(), ErrorCategory::Execution);
        assert_eq!(
            ErrorKind::ContainerUnavailable.category(),
            ErrorCategory::Execution
        );
    }

    #[test]
    fn dto_round_trips_through_json() {
        let err = RumiError::new(ErrorKind::Cycle, "would form a cycle")
            .with_context("namespace", "billing");
        let dto = RumiErrorDto::from(&err);
        let json = serde_json::to_string(&dto).unwrap();
        let back: RumiErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
    }
}
