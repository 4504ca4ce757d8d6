// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Stable data model for the rumi execution substrate: Packs, Flows, Steps,
//! Modifiers, grants, and the audit record shape. This crate has no domain
//! concepts of its own — it is pure structure, shared by every other crate
//! in the workspace.

/// Shared candidate approval state machine types (capability handlers, pip).
pub mod candidate;
/// Cloneable cancellation signal shared by the FlowExecutor and BlockExecutor.
pub mod cancellation;
/// Hierarchical `parent__child` Pack id helpers.
pub mod hierarchy;
/// Deterministic Step/Modifier ordering.
pub mod ordering;

pub use cancellation::CancellationToken;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Pack
// ---------------------------------------------------------------------------

/// Approval-gated lifecycle state of a Pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackState {
    /// Discovered on disk but not yet scanned into `pending`.
    Installed,
    /// Awaiting operator approval.
    Pending,
    /// Approved; code execution is permitted while the manifest verifies.
    Approved,
    /// Was approved, but a manifest re-check found file drift.
    Modified,
    /// Rejected by the operator.
    Rejected,
    /// Excluded from further consideration (three-strike rule or explicit block).
    Blocked,
}

impl PackState {
    /// Returns `true` if code under a Pack in this state may execute.
    ///
    /// Only `Approved` authorizes execution; `Modified` requires re-approval
    /// even though the Pack was once approved.
    pub fn authorizes_execution(self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// A directory of user-contributed code and metadata subject to approval.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pack {
    /// Unique identifier; for hierarchical packs, of the form `parent__child`.
    pub pack_id: String,
    /// Opaque identity string asserted by the Pack author at apply-time.
    pub pack_identity: Option<String>,
    /// Absolute path to the Pack's root directory.
    pub root: String,
    /// Free-form metadata declared in `ecosystem.json`.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Current approval state.
    pub state: PackState,
    /// Map from relative path to sha256(file content), computed at last
    /// `approve`/`verify`. `None` before the first scan.
    pub manifest: Option<BTreeMap<String, String>>,
    /// When this Pack was first discovered.
    pub discovered_at: DateTime<Utc>,
    /// When this Pack was last approved, if ever.
    pub approved_at: Option<DateTime<Utc>>,
}

impl Pack {
    /// Returns `true` if this pack_id names a hierarchical child
    /// (`parent__child` form). See [`hierarchy`].
    pub fn is_hierarchical_child(&self) -> bool {
        hierarchy::parent_id(&self.pack_id).is_some()
    }
}

// ---------------------------------------------------------------------------
// Flow / Step / Modifier
// ---------------------------------------------------------------------------

/// A composed, executable graph of Steps.
///
/// The result of composing zero-or-more source YAML files plus
/// zero-or-more Modifiers (see [`Modifier`]).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Flow {
    /// Unique identifier after composition.
    pub flow_id: String,
    /// Ordered list of phase names; Steps reference these by name.
    pub phases: Vec<String>,
    /// Steps, in declaration order (not execution order — see [`ordering`]).
    pub steps: Vec<Step>,
    /// Declared input names, for documentation/validation.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared output names, for documentation/validation.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Flow-level defaults, e.g. `fail_soft`.
    #[serde(default)]
    pub defaults: FlowDefaults,
    /// Unrecognized top-level YAML fields, preserved for diagnostics.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Flow-level default behaviors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct FlowDefaults {
    /// When `true`, a step error is recorded to audit/diagnostics and
    /// execution continues rather than aborting the Flow.
    #[serde(default)]
    pub fail_soft: bool,
}

/// One node in a [`Flow`]'s execution graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Unique identifier within the Flow.
    pub id: String,
    /// Name of the phase this Step belongs to; must exist in `Flow::phases`.
    pub phase: String,
    /// Ordering priority within the phase. Lower runs first. Default 50.
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Discriminates dispatch behavior.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Input object; string leaves may contain `${ctx.*}`/`${inputs.*}`
    /// substitution patterns.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Context key that receives this Step's return value, if any.
    #[serde(default)]
    pub output: Option<String>,
    /// For `python_file_call`: the Pack that owns the block being called.
    #[serde(default)]
    pub owner_pack: Option<String>,
    /// For `python_file_call`: path to the block file, relative to the
    /// Pack's candidate subdirectories.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_priority() -> i64 {
    50
}

/// Discriminates how a [`Step`] is dispatched by the FlowExecutor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Call a registered kernel handler by name.
    Handler,
    /// Invoke a Python block file inside a Pack container.
    PythonFileCall,
    /// Assign a literal (post-substitution) value to `output`.
    Set,
    /// Evaluate a boolean expression and execute a nested step group.
    If,
}

/// A YAML rule that edits a [`Flow`] by injecting, replacing, or removing
/// Steps.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Modifier {
    /// Unique identifier for this Modifier.
    pub modifier_id: String,
    /// Flow this Modifier applies to.
    pub target_flow_id: String,
    /// Phase the Modifier's own step (if any) belongs to.
    pub phase: String,
    /// Ordering priority among Modifiers. Lower applies first.
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// What this Modifier does to the target Flow.
    pub action: ModifierAction,
    /// Step to locate for `inject_before`/`inject_after`/`replace`/`remove`.
    /// Not required for `append`.
    #[serde(default)]
    pub target_step_id: Option<String>,
    /// New Step contributed by this Modifier. Not required for `remove`.
    #[serde(default)]
    pub step: Option<Step>,
    /// Interfaces/capabilities this Modifier requires to be applied.
    /// Unmet requirements cause the Modifier to be silently skipped.
    #[serde(default)]
    pub requires: Option<RequiresSpec>,
    /// Indirection through SharedDict before resolving `target_flow_id`.
    #[serde(default)]
    pub resolve_target: Option<ResolveTarget>,
}

/// What a [`Modifier`] does to its target Flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModifierAction {
    /// Insert the Modifier's step immediately before `target_step_id`.
    InjectBefore,
    /// Insert the Modifier's step immediately after `target_step_id`.
    InjectAfter,
    /// Add the Modifier's step to the end of `phase`.
    Append,
    /// Substitute `target_step_id` with the Modifier's step.
    Replace,
    /// Delete `target_step_id` entirely.
    Remove,
}

/// Interfaces and/or capabilities a [`Modifier`] requires to be applied.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct RequiresSpec {
    /// Interface names that must be advertised in the InterfaceRegistry.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Capability permission ids that must be enabled (granted or trusted).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// SharedDict indirection applied to `target_flow_id` before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResolveTarget {
    /// Whether indirection is active.
    #[serde(default)]
    pub enabled: bool,
    /// SharedDict namespace to resolve under. Defaults to `"flow_id"`.
    #[serde(default = "default_resolve_namespace")]
    pub resolve_namespace: String,
}

fn default_resolve_namespace() -> String {
    "flow_id".to_string()
}

// ---------------------------------------------------------------------------
// Network / capability grants
// ---------------------------------------------------------------------------

/// An HMAC-signed grant of outbound network access for one Pack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NetworkGrant {
    /// Pack this grant applies to.
    pub pack_id: String,
    /// Whether the grant is currently active.
    pub enabled: bool,
    /// Allowed hostnames; exact match or a wildcard/suffix rule.
    pub allowed_domains: Vec<String>,
    /// Allowed destination ports.
    pub allowed_ports: Vec<u16>,
    /// When this grant was issued.
    pub granted_at: DateTime<Utc>,
    /// Operator identity that issued this grant.
    pub granted_by: String,
    /// HMAC-SHA256 over the canonicalized JSON of this struct minus this
    /// field, hex-encoded. Verified before every egress decision.
    pub hmac_signature: String,
}

/// A directory of Python code advertising one capability handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityCandidate {
    /// Owning Pack.
    pub pack_id: String,
    /// Slug naming this handler's subdirectory under
    /// `share/capability_handlers/`.
    pub slug: String,
    /// Identifier declared in `handler.json`.
    pub handler_id: String,
    /// Permission id this handler satisfies.
    pub permission_id: String,
    /// Entry-point file, relative to the candidate's slug directory.
    pub entrypoint: String,
    /// sha256 of `handler.py` at scan time.
    pub sha256: String,
    /// Approval state, shared with [`candidate::CandidateState`].
    pub state: candidate::CandidateState,
}

impl CapabilityCandidate {
    /// Stable identity: `"{pack_id}:{slug}:{handler_id}:{sha256}"`. File
    /// edits change the sha256 and thus mint a new identity (TOCTOU guard).
    pub fn candidate_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.pack_id, self.slug, self.handler_id, self.sha256
        )
    }
}

/// A requirements-lock entry awaiting pip-install approval.
///
/// Shares [`candidate::CandidateState`] and [`candidate::CandidateManager`]
/// with [`CapabilityCandidate`]; the actual wheel build/download is an
/// external collaborator (see [`candidate::PipInstallPlan`]).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipCandidate {
    /// Owning Pack.
    pub pack_id: String,
    /// Package name, e.g. `requests`.
    pub name: String,
    /// Pinned version, e.g. `2.31.0`.
    pub version: String,
    /// sha256 of the exact `requirements.lock` line this candidate came from.
    pub sha_of_lockfile_line: String,
    /// Whether source-distribution installs are permitted for this entry.
    #[serde(default)]
    pub allow_sdist: bool,
    /// Approval state.
    pub state: candidate::CandidateState,
}

impl PipCandidate {
    /// Stable identity: `"{pack_id}:pip:{name}:{sha_of_lockfile_line}"`.
    pub fn candidate_key(&self) -> String {
        format!(
            "{}:pip:{}:{}",
            self.pack_id, self.name, self.sha_of_lockfile_line
        )
    }
}

/// `handler_id -> {sha256}` allowlist. Only handler files matching both the
/// id and one of the trusted hashes may execute as capability handlers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct TrustEntry {
    /// Handler identifier.
    pub handler_id: String,
    /// Set of trusted sha256 hashes for this handler's source.
    pub trusted_sha256: Vec<String>,
}

impl TrustEntry {
    /// Returns `true` if `sha256` is a trusted hash for this handler.
    pub fn trusts(&self, sha256: &str) -> bool {
        self.trusted_sha256.iter().any(|h| h == sha256)
    }
}

/// A grant of one permission to one principal (typically a Pack's
/// `owner_pack` identity).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityGrant {
    /// Principal receiving the grant. Always a `pack_id`, never
    /// payload-asserted.
    pub principal_id: String,
    /// Permission id being granted.
    pub permission_id: String,
    /// When the grant was issued.
    pub granted_at: DateTime<Utc>,
    /// Operator identity that issued the grant.
    pub granted_by: String,
}

// ---------------------------------------------------------------------------
// SharedDict
// ---------------------------------------------------------------------------

/// One binding in the SharedDict: `(namespace, token) -> value`.
///
/// A given `(namespace, token)` pair may bind only one `value` for its
/// lifetime; re-proposing a different value is a collision.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SharedDictRule {
    /// Namespace this binding lives in.
    pub namespace: String,
    /// Token being bound.
    pub token: String,
    /// Bound value. May itself be a token in the same namespace, in which
    /// case resolution continues transitively.
    pub value: String,
    /// Free-form description of who/what proposed this binding.
    pub provenance: String,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Severity of an [`AuditEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine, expected event.
    Info,
    /// Noteworthy but non-fatal condition (e.g. permissive-mode fallback).
    Warning,
    /// Security-relevant event (integrity mismatch, principal override).
    Security,
    /// Operation failed.
    Error,
}

/// Category an [`AuditEntry`] belongs to, determining its log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Flow composition and step dispatch.
    FlowExecution,
    /// Pack/candidate approval-state transitions.
    Approval,
    /// EgressBroker decisions.
    Network,
    /// CapabilityBroker dispatch.
    Capability,
    /// Integrity or policy-circumvention events.
    Security,
    /// SharedDict proposals.
    SharedDict,
    /// Container lifecycle transitions.
    Container,
}

impl AuditCategory {
    /// The file-name stem used for this category's per-day log file.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::FlowExecution => "flow_execution",
            Self::Approval => "approval",
            Self::Network => "network",
            Self::Capability => "capability",
            Self::Security => "security",
            Self::SharedDict => "shared_dict",
            Self::Container => "container",
        }
    }
}

/// One append-only audit record.
///
/// Never contains secret values, grant HMAC secrets, or literal egress
/// payload bodies — only sizes and hashes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    /// When this event occurred. Drives the per-day log file name.
    pub ts: DateTime<Utc>,
    /// Category, determining which log file this entry is appended to.
    pub category: AuditCategory,
    /// Severity of this event.
    pub severity: AuditSeverity,
    /// Short machine-readable action name, e.g. `"verify"`, `"egress_attempt"`.
    pub action: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Pack this event relates to, if any.
    #[serde(default)]
    pub pack_id: Option<String>,
    /// Flow this event relates to, if any.
    #[serde(default)]
    pub flow_id: Option<String>,
    /// Step this event relates to, if any.
    #[serde(default)]
    pub step_id: Option<String>,
    /// Phase this event relates to, if any.
    #[serde(default)]
    pub phase: Option<String>,
    /// Free-form structured detail.
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Reason the action was rejected/denied, if applicable.
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_state_only_approved_authorizes_execution() {
        assert!(PackState::Approved.authorizes_execution());
        for state in [
            PackState::Installed,
            PackState::Pending,
            PackState::Modified,
            PackState::Rejected,
            PackState::Blocked,
        ] {
            assert!(!state.authorizes_execution(), "{state:?} should not authorize");
        }
    }

    #[test]
    fn capability_candidate_key_changes_with_hash() {
        let mut candidate = CapabilityCandidate {
            pack_id: "demo".into(),
            slug: "weather".into(),
            handler_id: "get_weather".into(),
            permission_id: "net.weather".into(),
            entrypoint: "handler.py".into(),
            sha256: "H1".into(),
            state: candidate::CandidateState::Candidate,
        };
        let key1 = candidate.candidate_key();
        candidate.sha256 = "H2".into();
        let key2 = candidate.candidate_key();
        assert_ne!(key1, key2, "edited handler.py must mint a new candidate_key");
    }

    #[test]
    fn pip_candidate_key_shape() {
        let candidate = PipCandidate {
            pack_id: "demo".into(),
            name: "requests".into(),
            version: "2.31.0".into(),
            sha_of_lockfile_line: "abc123".into(),
            allow_sdist: false,
            state: candidate::CandidateState::Candidate,
        };
        assert_eq!(candidate.candidate_key(), "demo:pip:requests:abc123");
    }

    #[test]
    fn trust_entry_trusts_only_known_hashes() {
        let entry = TrustEntry {
            handler_id: "get_weather".into(),
            trusted_sha256: vec!["H1".into(), "H2".into()],
        };
        assert!(entry.trusts("H1"));
        assert!(!entry.trusts("H3"));
    }

    #[test]
    fn audit_category_file_stems_are_stable() {
        assert_eq!(AuditCategory::FlowExecution.file_stem(), "flow_execution");
        assert_eq!(AuditCategory::SharedDict.file_stem(), "shared_dict");
    }
}
