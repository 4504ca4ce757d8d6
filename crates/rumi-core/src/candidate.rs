//! Shared approval-state shape for [`crate::CapabilityCandidate`] and
//! [`crate::PipCandidate`].
//!
//! The state machine itself (cooldown timers, strike counting, persistence)
//! lives in `rumi-candidate`; this module only defines the states and the
//! plan structures that cross the approval/install seam.

use serde::{Deserialize, Serialize};

/// Approval-state of a candidate (capability handler or pip requirement).
///
/// Identical in shape to [`crate::PackState`] but tracked independently per
/// `candidate_key`, since a single Pack may contribute many candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    /// Freshly discovered by a scan; not yet acted on.
    Candidate,
    /// Awaiting operator decision. Distinct from `Candidate` so a re-scan of
    /// an already-surfaced candidate doesn't look new.
    Pending,
    /// Approved and installed.
    Installed,
    /// Rejected by the operator. May be re-scanned after the cooldown.
    Rejected,
    /// Three rejects reached; excluded from scans until explicit `unblock`.
    Blocked,
}

impl CandidateState {
    /// Returns `true` if a candidate in this state is still eligible for
    /// approval (i.e. has not been installed or blocked).
    pub fn is_actionable(self) -> bool {
        matches!(self, Self::Candidate | Self::Pending | Self::Rejected)
    }
}

/// A Docker container invocation, described declaratively so the actual
/// `docker run` call can be constructed (and audited) by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference to run.
    pub image: String,
    /// Network mode: `"none"` or `"bridge"`.
    pub network: String,
    /// Whether `--cap-drop=ALL` is applied.
    pub drop_all_caps: bool,
    /// Arguments passed to the entrypoint.
    pub args: Vec<String>,
}

/// The two-container plan for installing one pip requirement: an
/// internet-reachable download stage followed by a fully offline install
/// stage. Carrying out the plan is an external collaborator's job (§1); this
/// crate only records what that collaborator should do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipInstallPlan {
    /// `--network=bridge --cap-drop=ALL` stage that fetches the wheel (or
    /// sdist, if `allow_sdist` is set).
    pub download: ContainerSpec,
    /// `--network=none` stage that installs the already-downloaded artifact.
    pub install: ContainerSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_non_terminal_states_are_actionable() {
        assert!(CandidateState::Candidate.is_actionable());
        assert!(CandidateState::Pending.is_actionable());
        assert!(CandidateState::Rejected.is_actionable());
        assert!(!CandidateState::Installed.is_actionable());
        assert!(!CandidateState::Blocked.is_actionable());
    }
}
