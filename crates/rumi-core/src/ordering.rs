//! Deterministic total ordering for [`crate::Step`]s and [`crate::Modifier`]s
//! (§4.2, §3: `(phase_index, priority asc, id asc)`).

use crate::{Modifier, Step};

/// Sort key for a [`Step`]: `(phase_index_in_phases, priority, id)`.
///
/// A phase name absent from the Flow's `phases` list sorts after every known
/// phase (index `usize::MAX`); this only arises transiently during
/// validation, since a final composed Flow must reference only known phases.
pub fn step_sort_key(phases: &[String], step: &Step) -> (usize, i64, String) {
    let phase_index = phases
        .iter()
        .position(|p| p == &step.phase)
        .unwrap_or(usize::MAX);
    (phase_index, step.priority, step.id.clone())
}

/// Sort a Flow's steps in place into total execution order.
pub fn sort_steps(phases: &[String], steps: &mut [Step]) {
    steps.sort_by(|a, b| step_sort_key(phases, a).cmp(&step_sort_key(phases, b)));
}

/// Sort key for a [`Modifier`]: `(phase_index_in_phases, priority, modifier_id)`.
pub fn modifier_sort_key(phases: &[String], modifier: &Modifier) -> (usize, i64, String) {
    let phase_index = phases
        .iter()
        .position(|p| p == &modifier.phase)
        .unwrap_or(usize::MAX);
    (phase_index, modifier.priority, modifier.modifier_id.clone())
}

/// Sort Modifiers in place into deterministic apply order.
pub fn sort_modifiers(phases: &[String], modifiers: &mut [Modifier]) {
    modifiers.sort_by(|a, b| modifier_sort_key(phases, a).cmp(&modifier_sort_key(phases, b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepType;

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
    fn sorts_by_phase_then_priority_then_id() {
        let phases = vec!["prepare".to_string(), "generate".to_string()];
        let mut steps = vec![
            step("b", "generate", 50),
            step("z", "prepare", 10),
            step("a", "prepare", 10),
        ];
        sort_steps(&phases, &mut steps);
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "z", "b"]);
    }

    #[test]
    fn modifier_inject_after_scenario_from_spec() {
        // Flow F has steps [a(prepare,10), b(generate,50)]; Modifier injects
        // m(prepare,20) after a. Composed order must be a, m, b.
        let phases = vec!["prepare".to_string(), "generate".to_string()];
        let mut steps = vec![
            step("a", "prepare", 10),
            step("m", "prepare", 20),
            step("b", "generate", 50),
        ];
        sort_steps(&phases, &mut steps);
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m", "b"]);
    }
}
