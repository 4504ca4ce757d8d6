// SPDX-License-Identifier: MIT OR Apache-2.0
//! Flow/Modifier YAML parsing and composition (§4.1).
//!
//! Search-path precedence for Flows: `<flows_dir>/` (highest) >
//! `<user_data_root>/shared/flows/` > `<ecosystem_root>/<pack_id>/backend/flows/`
//! (lowest, one per Approved Pack). Modifiers are collected from
//! `<user_data_root>/shared/flows/modifiers/` and, per Approved Pack, from
//! `<ecosystem_root>/<pack_id>/flows/modifiers/` (see DESIGN.md for why this
//! path was chosen over the ambiguous spec wording).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rumi_audit::AuditLog;
use rumi_core::ordering::{sort_modifiers, sort_steps};
use rumi_core::{AuditCategory, AuditSeverity, Flow, Modifier, ModifierAction, PackState};
use rumi_dict::SharedDict;
use rumi_integrity::ApprovalStore;

const FLOW_SUFFIX: &str = ".flow.yaml";
const MODIFIER_SUFFIX: &str = ".modifier.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    FlowsDir,
    SharedUserData,
    Pack,
}

struct RawFlow {
    flow: Flow,
    precedence: Precedence,
    source: String,
}

struct RawModifier {
    modifier: Modifier,
    source: String,
}

fn validate_flow_schema(flow: &Flow) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for step in &flow.steps {
        if !seen.insert(step.id.clone()) {
            return Err(format!("duplicate step id `{}`", step.id));
        }
        if !flow.phases.contains(&step.phase) {
            return Err(format!("step `{}` references unknown phase `{}`", step.id, step.phase));
        }
    }
    Ok(())
}

fn requires_met(
    requires: &Option<rumi_core::RequiresSpec>,
    interfaces: &BTreeSet<String>,
    capabilities: &BTreeSet<String>,
) -> bool {
    let Some(spec) = requires else { return true };
    spec.interfaces.iter().all(|i| interfaces.contains(i))
        && spec.capabilities.iter().all(|c| capabilities.contains(c))
}

/// Read every file in `dir` whose name ends with `suffix`, in sorted order
/// for determinism. Missing directories and unreadable files are treated as
/// "nothing contributed here", not errors — absence is the common case for
/// most search-path roots.
fn read_suffixed_files(dir: &Path, suffix: &str) -> Vec<(PathBuf, String)> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !name.ends_with(suffix) {
            continue;
        }
        if let Ok(contents) = std::fs::read_to_string(&path) {
            out.push((path, contents));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Reads the on-disk grant/trust layout (§6) directly to build the global
/// capability set used by `requires.capabilities` evaluation (see DESIGN.md
/// for why this is a raw read rather than a `rumi-grant` dependency).
fn load_capability_set(user_data_root: &Path) -> BTreeSet<String> {
    let mut set = BTreeSet::new();

    let cap_dir = user_data_root.join("permissions/capabilities");
    if let Ok(entries) = std::fs::read_dir(&cap_dir) {
        for entry in entries.flatten() {
            if let Ok(contents) = std::fs::read_to_string(entry.path()) {
                if let Ok(grants) = serde_json::from_str::<Vec<rumi_core::CapabilityGrant>>(&contents) {
                    set.extend(grants.into_iter().map(|g| g.permission_id));
                }
            }
        }
    }

    let trust_path = user_data_root.join("capabilities/trust/trusted_handlers.json");
    if let Ok(contents) = std::fs::read_to_string(&trust_path) {
        if let Ok(entries) = serde_json::from_str::<BTreeMap<String, rumi_core::TrustEntry>>(&contents) {
            set.extend(entries.into_keys());
        }
    }

    set
}

/// Parses Flow/Modifier YAML across the search-path precedence, applies
/// Modifier composition, and yields the final executable Flow set.
pub struct FlowLoader<'a> {
    flows_dir: PathBuf,
    user_data_root: PathBuf,
    ecosystem_root: PathBuf,
    interfaces: BTreeSet<String>,
    approvals: &'a ApprovalStore,
    dict: &'a SharedDict,
    audit: &'a AuditLog,
}

impl<'a> FlowLoader<'a> {
    /// Build a loader over the three search-path roots.
    ///
    /// `interfaces` is the InterfaceRegistry: the set of interface names
    /// the running Kernel currently advertises, used to evaluate
    /// `requires.interfaces`.
    pub fn new(
        flows_dir: impl Into<PathBuf>,
        user_data_root: impl Into<PathBuf>,
        ecosystem_root: impl Into<PathBuf>,
        interfaces: BTreeSet<String>,
        approvals: &'a ApprovalStore,
        dict: &'a SharedDict,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            flows_dir: flows_dir.into(),
            user_data_root: user_data_root.into(),
            ecosystem_root: ecosystem_root.into(),
            interfaces,
            approvals,
            dict,
            audit,
        }
    }

    async fn diag(&self, action: &str, detail: impl Into<String>) {
        let mut entry = rumi_audit::new_entry(AuditCategory::FlowExecution, action);
        entry.severity = AuditSeverity::Warning;
        entry.success = false;
        entry.rejection_reason = Some(detail.into());
        let _ = self.audit.record(entry).await;
    }

    fn approved_pack_ids(&self) -> Vec<String> {
        self.approvals
            .all()
            .filter(|p| p.state == PackState::Approved)
            .map(|p| p.pack_id.clone())
            .collect()
    }

    async fn parse_flow_file(
        &self,
        path: &Path,
        contents: &str,
        precedence: Precedence,
        raw: &mut Vec<RawFlow>,
    ) {
        match serde_yaml::from_str::<Flow>(contents) {
            Ok(mut flow) => {
                if !flow.extra.is_empty() {
                    self.diag(
                        "flow_unknown_fields",
                        format!(
                            "{}: unrecognized top-level fields {:?} (preserved, not applied)",
                            path.display(),
                            flow.extra.keys().collect::<Vec<_>>()
                        ),
                    )
                    .await;
                }
                if let Err(reason) = validate_flow_schema(&flow) {
                    self.diag("flow_schema_invalid", format!("{}: {reason}", path.display())).await;
                    return;
                }
                sort_steps(&flow.phases, &mut flow.steps);
                raw.push(RawFlow { flow, precedence, source: path.display().to_string() });
            }
            Err(err) => {
                self.diag("flow_parse_error", format!("{}: {err}", path.display())).await;
            }
        }
    }

    async fn collect_flows(&self) -> Vec<RawFlow> {
        let mut raw = Vec::new();

        for (path, contents) in read_suffixed_files(&self.flows_dir, FLOW_SUFFIX) {
            self.parse_flow_file(&path, &contents, Precedence::FlowsDir, &mut raw).await;
        }

        let shared_dir = self.user_data_root.join("shared/flows");
        for (path, contents) in read_suffixed_files(&shared_dir, FLOW_SUFFIX) {
            self.parse_flow_file(&path, &contents, Precedence::SharedUserData, &mut raw).await;
        }

        for pack_id in self.approved_pack_ids() {
            let pack_dir = self.ecosystem_root.join(&pack_id).join("backend/flows");
            for (path, contents) in read_suffixed_files(&pack_dir, FLOW_SUFFIX) {
                self.parse_flow_file(&path, &contents, Precedence::Pack, &mut raw).await;
            }
        }

        raw
    }

    async fn dedupe_flows(&self, raw: Vec<RawFlow>) -> BTreeMap<String, Flow> {
        let mut by_id: BTreeMap<String, Vec<RawFlow>> = BTreeMap::new();
        for entry in raw {
            by_id.entry(entry.flow.flow_id.clone()).or_default().push(entry);
        }

        let mut out = BTreeMap::new();
        for (flow_id, mut group) in by_id {
            group.sort_by_key(|r| r.precedence);
            let top = group[0].precedence;
            let winner_count = group.iter().filter(|r| r.precedence == top).count();
            if winner_count > 1 {
                let sources: Vec<_> =
                    group.iter().filter(|r| r.precedence == top).map(|r| r.source.clone()).collect();
                self.diag(
                    "flow_conflict",
                    format!("duplicate flow_id `{flow_id}` at the same search-path precedence: {sources:?}"),
                )
                .await;
                continue;
            }
            out.insert(flow_id, group.into_iter().next().unwrap().flow);
        }
        out
    }

    async fn parse_modifier_file(&self, path: &Path, contents: &str, raw: &mut Vec<RawModifier>) {
        match serde_yaml::from_str::<Modifier>(contents) {
            Ok(modifier) => raw.push(RawModifier { modifier, source: path.display().to_string() }),
            Err(err) => self.diag("modifier_parse_error", format!("{}: {err}", path.display())).await,
        }
    }

    async fn collect_modifiers(&self) -> Vec<RawModifier> {
        let mut raw = Vec::new();

        let shared_dir = self.user_data_root.join("shared/flows/modifiers");
        for (path, contents) in read_suffixed_files(&shared_dir, MODIFIER_SUFFIX) {
            self.parse_modifier_file(&path, &contents, &mut raw).await;
        }

        for pack_id in self.approved_pack_ids() {
            let pack_dir = self.ecosystem_root.join(&pack_id).join("flows/modifiers");
            for (path, contents) in read_suffixed_files(&pack_dir, MODIFIER_SUFFIX) {
                self.parse_modifier_file(&path, &contents, &mut raw).await;
            }
        }

        raw
    }

    async fn apply_one(&self, flow: &mut Flow, modifier: Modifier) {
        let target_idx =
            modifier.target_step_id.as_ref().and_then(|id| flow.steps.iter().position(|s| &s.id == id));

        match modifier.action {
            ModifierAction::Append => {
                if let Some(step) = modifier.step {
                    flow.steps.push(step);
                } else {
                    self.diag(
                        "modifier_missing_step",
                        format!("modifier `{}` (append) carries no step", modifier.modifier_id),
                    )
                    .await;
                }
            }
            ModifierAction::InjectBefore => match (target_idx, modifier.step) {
                (Some(idx), Some(step)) => flow.steps.insert(idx, step),
                _ => {
                    self.diag(
                        "modifier_missing_target",
                        format!("modifier `{}` (inject_before): target step missing", modifier.modifier_id),
                    )
                    .await
                }
            },
            ModifierAction::InjectAfter => match (target_idx, modifier.step) {
                (Some(idx), Some(step)) => flow.steps.insert(idx + 1, step),
                _ => {
                    self.diag(
                        "modifier_missing_target",
                        format!("modifier `{}` (inject_after): target step missing", modifier.modifier_id),
                    )
                    .await
                }
            },
            ModifierAction::Replace => match (target_idx, modifier.step) {
                (Some(idx), Some(step)) => flow.steps[idx] = step,
                _ => {
                    self.diag(
                        "modifier_missing_target",
                        format!("modifier `{}` (replace): target step missing", modifier.modifier_id),
                    )
                    .await
                }
            },
            ModifierAction::Remove => match target_idx {
                Some(idx) => {
                    flow.steps.remove(idx);
                }
                None => {
                    self.diag(
                        "modifier_missing_target",
                        format!("modifier `{}` (remove): target step missing", modifier.modifier_id),
                    )
                    .await
                }
            },
        }
    }

    async fn apply_modifiers(&self, flows: &mut BTreeMap<String, Flow>, raw_modifiers: Vec<RawModifier>) {
        let capabilities = load_capability_set(&self.user_data_root);

        let mut by_target: BTreeMap<String, Vec<Modifier>> = BTreeMap::new();
        for RawModifier { mut modifier, source } in raw_modifiers {
            if let Some(resolve) = modifier.resolve_target.clone() {
                if resolve.enabled {
                    match self.dict.resolve(&resolve.resolve_namespace, &modifier.target_flow_id) {
                        Ok(result) => modifier.target_flow_id = result.value,
                        Err(err) => {
                            self.diag(
                                "modifier_resolve_target_failed",
                                format!(
                                    "{source}: could not resolve target `{}` under namespace `{}`: {err}",
                                    modifier.target_flow_id, resolve.resolve_namespace
                                ),
                            )
                            .await;
                        }
                    }
                }
            }
            by_target.entry(modifier.target_flow_id.clone()).or_default().push(modifier);
        }

        for (flow_id, mut modifiers) in by_target {
            let Some(flow) = flows.get_mut(&flow_id) else {
                self.diag("modifier_conflict", format!("target flow `{flow_id}` does not exist")).await;
                continue;
            };
            sort_modifiers(&flow.phases, &mut modifiers);

            for modifier in modifiers {
                if !requires_met(&modifier.requires, &self.interfaces, &capabilities) {
                    self.diag(
                        "modifier_skipped_requires",
                        format!("modifier `{}`: requires unmet", modifier.modifier_id),
                    )
                    .await;
                    continue;
                }
                self.apply_one(flow, modifier).await;
            }
        }

        let mut invalid = Vec::new();
        for (flow_id, flow) in flows.iter_mut() {
            match validate_flow_schema(flow) {
                Ok(()) => sort_steps(&flow.phases, &mut flow.steps),
                Err(reason) => invalid.push((flow_id.clone(), reason)),
            }
        }
        for (flow_id, reason) in invalid {
            self.diag("flow_dropped_post_composition", format!("{flow_id}: {reason}")).await;
            flows.remove(&flow_id);
        }
    }

    /// Parse and compose every Flow reachable across the search paths,
    /// keyed by `flow_id`. Invalid individual files/Flows are dropped with a
    /// diagnostic rather than failing the whole load.
    pub async fn load_all(&self) -> BTreeMap<String, Flow> {
        let raw_flows = self.collect_flows().await;
        let mut flows = self.dedupe_flows(raw_flows).await;
        let raw_modifiers = self.collect_modifiers().await;
        self.apply_modifiers(&mut flows, raw_modifiers).await;
        flows
    }

    /// Load and compose every Flow, then return the one named `flow_id`.
    pub async fn load_one(&self, flow_id: &str) -> Result<Flow, crate::FlowError> {
        let mut flows = self.load_all().await;
        flows.remove(flow_id).ok_or_else(|| crate::FlowError::UnknownFlow(flow_id.to_string()))
    }
}
