//! Integration tests for the data-model invariants rumi-core exposes to the
//! rest of the workspace: ordering, hierarchy, and candidate identity.

use rumi_core::{hierarchy, ordering, Step, StepType};

fn step(id: &str, phase: &str, priority: i64) -> Step {
    Step {
        id: id.to_string(),
        phase: phase.to_string(),
        priority,
        step_type: StepType::Set,
        input: serde_json::Value::Null,
        output: None,
        owner_pack: None,
        file: None,
    }
}

#[test]
fn composed_flow_orders_across_phases_and_priorities() {
    let phases = vec!["prepare".to_string(), "generate".to_string(), "finalize".to_string()];
    let mut steps = vec![
        step("finish", "finalize", 50),
        step("late-prepare", "prepare", 90),
        step("early-prepare", "prepare", 10),
        step("gen", "generate", 50),
    ];
    ordering::sort_steps(&phases, &mut steps);
    let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["early-prepare", "late-prepare", "gen", "finish"]);
}

#[test]
fn hierarchical_child_allowlist_is_bounded_by_every_ancestor() {
    assert_eq!(hierarchy::parent_id("acme__billing"), Some("acme"));
    assert_eq!(hierarchy::ancestors("acme__billing__invoices").len(), 2);

    let child_ports = vec![80u16, 443, 8443];
    let parent_ports = vec![443u16];
    let effective = hierarchy::intersect_allowlist(&child_ports, &[parent_ports]);
    assert_eq!(effective, vec![443]);
}

#[test]
fn root_level_pack_id_has_empty_ancestor_chain() {
    assert!(hierarchy::ancestors("standalone-pack").is_empty());
}
