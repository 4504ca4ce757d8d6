//! Property: Flow execution order is a pure function of (phases, steps) —
//! sorting the same input twice, or sorting a shuffled copy, always yields
//! the same result (§8).

use proptest::prelude::*;
use rumi_core::{ordering, Step, StepType};

fn arb_step(id: String, phase: String, priority: i64) -> Step {
    Step {
        id,
        phase,
        priority,
        step_type: StepType::Set,
        input: serde_json::Value::Null,
        output: None,
        owner_pack: None,
        file: None,
    }
}

proptest! {
    #[test]
    fn sort_is_deterministic_and_order_independent_of_input_order(
        seed in proptest::collection::vec((0..3usize, -5i64..5i64, 0..8u32), 1..20)
    ) {
        let phases = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut steps: Vec<Step> = seed
            .iter()
            .enumerate()
            .map(|(i, (phase_idx, priority, _))| {
                arb_step(format!("s{i}"), phases[*phase_idx].clone(), *priority)
            })
            .collect();

        let mut first = steps.clone();
        ordering::sort_steps(&phases, &mut first);

        // Reverse the input and sort again; result must be identical.
        steps.reverse();
        let mut second = steps;
        ordering::sort_steps(&phases, &mut second);

        let first_ids: Vec<&str> = first.iter().map(|s| s.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|s| s.id.as_str()).collect();
        prop_assert_eq!(first_ids, second_ids);
    }
}
