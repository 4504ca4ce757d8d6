// SPDX-License-Identifier: MIT OR Apache-2.0
//! Human-readable renderings of Kernel output, used when `--json` is absent.

use rumi_core::{CapabilityCandidate, NetworkGrant, Pack, PackState, PipCandidate};
use rumi_dict::ResolveResult;
use rumi_integrity::VerifyResult;

/// Render a single Pack row as `pack_id  state`.
pub fn pack_row(pack: &Pack) -> String {
    format!("{:<32} {:?}", pack.pack_id, pack.state)
}

/// Render a Pack's current state, or `<unknown>` if it was never seen.
pub fn pack_state(state: Option<PackState>) -> String {
    match state {
        Some(state) => format!("{state:?}"),
        None => "<unknown>".to_string(),
    }
}

/// Render a manifest re-verification result.
pub fn verify_result(result: VerifyResult) -> &'static str {
    match result {
        VerifyResult::Ok => "ok",
        VerifyResult::Modified => "modified (demoted to Modified)",
    }
}

/// Render a capability-handler candidate row.
pub fn capability_candidate_row(key: &str, candidate: &CapabilityCandidate, state: rumi_core::candidate::CandidateState) -> String {
    format!(
        "{:<40} {:<10} pack={} handler={} permission={}",
        key, format_args!("{state:?}"), candidate.pack_id, candidate.handler_id, candidate.permission_id
    )
}

/// Render a pip requirement candidate row.
pub fn pip_candidate_row(key: &str, candidate: &PipCandidate, state: rumi_core::candidate::CandidateState) -> String {
    format!(
        "{:<40} {:<10} {}=={}",
        key, format_args!("{state:?}"), candidate.name, candidate.version
    )
}

/// Render an issued network grant.
pub fn network_grant(grant: &NetworkGrant) -> String {
    format!(
        "pack={} enabled={} domains={:?} ports={:?} granted_by={} granted_at={}",
        grant.pack_id, grant.enabled, grant.allowed_domains, grant.allowed_ports, grant.granted_by, grant.granted_at
    )
}

/// Render a SharedDict resolution.
pub fn resolve_result(result: &ResolveResult) -> String {
    if result.hop_limit {
        format!("{} (hop limit reached)", result.value)
    } else {
        result.value.clone()
    }
}
