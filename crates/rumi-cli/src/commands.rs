// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subcommand implementations. Each function borrows the running
//! [`KernelCore`] and either prints a human-readable summary or, when
//! `json` is set, the raw `serde_json::Value` the Kernel handed back.

use anyhow::{bail, Result};
use rumi_core::CancellationToken;
use rumi_kernel::KernelCore;

use crate::format;
use crate::{AuditAction, CandidateAction, DictAction, FlowAction, GrantAction, PackAction};

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) async fn pack(kernel: &KernelCore, action: PackAction, json: bool) -> Result<()> {
    match action {
        PackAction::Scan => {
            let discovered = kernel.scan_packs().await?;
            if json {
                print_json(&discovered)?;
            } else {
                println!("discovered {} pack(s):", discovered.len());
                for pack_id in discovered {
                    println!("  {pack_id}");
                }
            }
        }
        PackAction::List => {
            let packs = kernel.list_packs().await;
            if json {
                print_json(&packs)?;
            } else {
                for pack in &packs {
                    println!("{}", format::pack_row(pack));
                }
            }
        }
        PackAction::Status { pack_id } => {
            let state = kernel.pack_status(&pack_id).await;
            if json {
                print_json(&state)?;
            } else {
                println!("{}", format::pack_state(state));
            }
        }
        PackAction::Approve { pack_id } => {
            kernel.approve_pack(&pack_id).await?;
            println!("approved {pack_id}");
        }
        PackAction::Reject { pack_id, reason } => {
            kernel.reject_pack(&pack_id, &reason).await?;
            println!("rejected {pack_id}");
        }
        PackAction::Verify { pack_id } => {
            let result = kernel.verify_pack(&pack_id).await?;
            println!("{}", format::verify_result(result));
        }
    }
    Ok(())
}

pub(crate) async fn capability(kernel: &KernelCore, action: CandidateAction, json: bool) -> Result<()> {
    match action {
        CandidateAction::Scan => {
            let discovered = kernel.scan_capability_candidates().await?;
            if json {
                print_json(&discovered)?;
            } else {
                println!("discovered {} capability candidate(s):", discovered.len());
                for key in discovered {
                    println!("  {key}");
                }
            }
        }
        CandidateAction::List => {
            let candidates = kernel.list_capability_candidates().await;
            if json {
                let rows: Vec<_> = candidates
                    .iter()
                    .map(|(key, candidate, state)| serde_json::json!({"key": key, "candidate": candidate, "state": state}))
                    .collect();
                print_json(&rows)?;
            } else {
                for (key, candidate, state) in &candidates {
                    println!("{}", format::capability_candidate_row(key, candidate, *state));
                }
            }
        }
        CandidateAction::Approve { key } => {
            kernel.approve_capability_candidate(&key).await?;
            println!("approved {key}");
        }
        CandidateAction::Reject { key, reason } => {
            kernel.reject_capability_candidate(&key, &reason).await?;
            println!("rejected {key}");
        }
        CandidateAction::Unblock { key } => {
            kernel.unblock_capability_candidate(&key).await?;
            println!("unblocked {key}");
        }
    }
    Ok(())
}

pub(crate) async fn pip(kernel: &KernelCore, action: CandidateAction, json: bool) -> Result<()> {
    match action {
        CandidateAction::Scan => {
            let discovered = kernel.scan_pip_candidates().await?;
            if json {
                print_json(&discovered)?;
            } else {
                println!("discovered {} pip candidate(s):", discovered.len());
                for key in discovered {
                    println!("  {key}");
                }
            }
        }
        CandidateAction::List => {
            let candidates = kernel.list_pip_candidates().await;
            if json {
                let rows: Vec<_> = candidates
                    .iter()
                    .map(|(key, candidate, state)| serde_json::json!({"key": key, "candidate": candidate, "state": state}))
                    .collect();
                print_json(&rows)?;
            } else {
                for (key, candidate, state) in &candidates {
                    println!("{}", format::pip_candidate_row(key, candidate, *state));
                }
            }
        }
        CandidateAction::Approve { key } => {
            kernel.approve_pip_candidate(&key).await?;
            println!("approved {key}");
        }
        CandidateAction::Reject { key, reason } => {
            kernel.reject_pip_candidate(&key, &reason).await?;
            println!("rejected {key}");
        }
        CandidateAction::Unblock { key } => {
            kernel.unblock_pip_candidate(&key).await?;
            println!("unblocked {key}");
        }
    }
    Ok(())
}

pub(crate) async fn grant(kernel: &KernelCore, action: GrantAction) -> Result<()> {
    match action {
        GrantAction::Network { pack_id, domains, ports, by } => {
            let grant = kernel.issue_network_grant(&pack_id, domains, ports, &by)?;
            println!("{}", format::network_grant(&grant));
        }
        GrantAction::RevokeNetwork { pack_id } => {
            kernel.invalidate_network_grant(&pack_id)?;
            println!("revoked network grant for {pack_id}");
        }
        GrantAction::Capability { principal_id, permission_id, by } => {
            kernel.grant_capability(&principal_id, &permission_id, &by)?;
            println!("granted {permission_id} to {principal_id}");
        }
    }
    Ok(())
}

pub(crate) async fn dict(kernel: &KernelCore, action: DictAction, json: bool) -> Result<()> {
    match action {
        DictAction::Propose { namespace, token, value, provenance } => {
            kernel.shared_dict_propose(&namespace, &token, &value, &provenance).await?;
            println!("proposed {namespace}.{token} = {value}");
        }
        DictAction::Resolve { namespace, token } => {
            let result = kernel.shared_dict_resolve(&namespace, &token).await?;
            if json {
                print_json(&serde_json::json!({"value": result.value, "hop_limit": result.hop_limit}))?;
            } else {
                println!("{}", format::resolve_result(&result));
            }
        }
        DictAction::Explain { namespace, token } => {
            let chain = kernel.shared_dict_explain(&namespace, &token).await;
            if json {
                print_json(&chain)?;
            } else {
                for step in chain {
                    println!("{step}");
                }
            }
        }
        DictAction::List { namespace } => {
            let rules = kernel.shared_dict_list(&namespace).await;
            if json {
                print_json(&rules)?;
            } else {
                for rule in rules {
                    println!("{rule:?}");
                }
            }
        }
        DictAction::Remove { namespace, token } => {
            kernel.shared_dict_remove(&namespace, &token).await?;
            println!("removed {namespace}.{token}");
        }
    }
    Ok(())
}

pub(crate) async fn flow(kernel: &KernelCore, action: FlowAction, json: bool, cancel: CancellationToken) -> Result<()> {
    match action {
        FlowAction::List => {
            let flows = kernel.list_flows().await;
            if json {
                print_json(&flows)?;
            } else {
                for flow_id in flows.keys() {
                    println!("{flow_id}");
                }
            }
        }
        FlowAction::Run { flow_id, input } => {
            let inputs: serde_json::Value = serde_json::from_str(&input)?;
            if !inputs.is_object() && !inputs.is_null() {
                bail!("--input must be a JSON object");
            }
            let outcome = kernel.run_flow(&flow_id, inputs, cancel).await?;
            if json {
                let failures: Vec<_> = outcome
                    .step_failures
                    .iter()
                    .map(|f| serde_json::json!({"step_id": f.step_id, "error": f.error}))
                    .collect();
                print_json(&serde_json::json!({"ctx": outcome.ctx, "step_failures": failures}))?;
            } else {
                println!("{}", serde_json::to_string_pretty(&outcome.ctx)?);
                for failure in &outcome.step_failures {
                    println!("step {} failed: {}", failure.step_id, failure.error);
                }
            }
        }
    }
    Ok(())
}

pub(crate) async fn audit(kernel: &KernelCore, action: AuditAction, json: bool) -> Result<()> {
    match action {
        AuditAction::Tail { limit } => {
            let entries = kernel.audit_tail(limit).await?;
            if json {
                print_json(&entries)?;
            } else {
                for entry in entries {
                    println!(
                        "{} {:<10} {:<8} {} success={}",
                        entry.ts,
                        format_args!("{:?}", entry.category),
                        format_args!("{:?}", entry.severity),
                        entry.action,
                        entry.success
                    );
                }
            }
        }
    }
    Ok(())
}
