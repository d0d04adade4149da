//! Chain compilation.
//!
//! Once at startup, every task gets an ordered list of the transforms
//! and outputs whose routing filters admit it. Transforms run in
//! descending priority (ties keep declaration order); outputs keep
//! declaration order. Compiled chains never change while the process
//! lives.

use crate::config::model::{ModuleConfig, TaskConfig};

/// Compiled routing for one task: indices into the flow's module lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChain {
    pub input_index: usize,
    pub task_index: usize,
    /// Indices into the declaration-ordered transform list, already in
    /// execution order.
    pub transforms: Vec<usize>,
    /// Indices into the declaration-ordered output list.
    pub outputs: Vec<usize>,
}

/// Execution order for transforms: stable sort by descending priority,
/// so negative priorities run last and ties keep declaration order.
pub fn transform_order(transforms: &[ModuleConfig]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..transforms.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(transforms[i].priority));
    order
}

/// Compile the chain for one task.
pub fn compile(
    input_index: usize,
    task_index: usize,
    task: &TaskConfig,
    input_name: &str,
    transforms: &[ModuleConfig],
    order: &[usize],
    outputs: &[ModuleConfig],
    disable_outputs: bool,
) -> TaskChain {
    let admits = |module: &ModuleConfig| {
        module.enabled && module.filters.admits(&task.name, input_name)
    };

    let transforms: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| admits(&transforms[i]))
        .collect();

    let outputs: Vec<usize> = if disable_outputs {
        Vec::new()
    } else {
        (0..outputs.len()).filter(|&i| admits(&outputs[i])).collect()
    };

    TaskChain {
        input_index,
        task_index,
        transforms,
        outputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Filters;
    use serde_json::json;

    fn module(name: &str, priority: i64) -> ModuleConfig {
        serde_json::from_value(json!({
            "type": "noop",
            "name": name,
            "enabled": true,
            "priority": priority,
        }))
        .unwrap()
    }

    fn task(name: &str) -> TaskConfig {
        serde_json::from_value(json!({
            "name": name,
            "cron": "* * * * *",
            "enabled": true,
            "result": {"metrics": ["metric"], "attributes": null},
            "max_retries": 0,
            "retry_delay": 0,
            "modifiers": {"time_modulus": 0, "time_offset": 0},
        }))
        .unwrap()
    }

    #[test]
    fn priority_sorts_descending_with_stable_ties() {
        let transforms = vec![
            module("a", 0),
            module("b", 10),
            module("c", 0),
            module("d", -5),
        ];
        assert_eq!(transform_order(&transforms), vec![1, 0, 2, 3]);
    }

    #[test]
    fn negative_priorities_sort_last() {
        let transforms = vec![module("low", -256), module("mid", 0), module("high", 256)];
        assert_eq!(transform_order(&transforms), vec![2, 1, 0]);
    }

    #[test]
    fn chain_respects_filters_and_order() {
        let mut only_db = module("only_db", 0);
        only_db.filters = Filters {
            include_tasks: Some(vec!["db_*".to_string()]),
            ..Default::default()
        };
        let transforms = vec![module("always", 1), only_db];
        let order = transform_order(&transforms);

        let outputs = vec![module("sink_a", 0), module("sink_b", 0)];

        let chain = compile(
            0,
            0,
            &task("db_rows"),
            "pg",
            &transforms,
            &order,
            &outputs,
            false,
        );
        assert_eq!(chain.transforms, vec![0, 1]);
        assert_eq!(chain.outputs, vec![0, 1]);

        let chain = compile(
            0,
            1,
            &task("http_latency"),
            "pg",
            &transforms,
            &order,
            &outputs,
            false,
        );
        assert_eq!(chain.transforms, vec![0]);
    }

    #[test]
    fn disabled_modules_are_dropped() {
        let mut off = module("off", 100);
        off.enabled = false;
        let transforms = vec![off, module("on", 0)];
        let order = transform_order(&transforms);

        let chain = compile(0, 0, &task("t"), "in", &transforms, &order, &[], false);
        assert_eq!(chain.transforms, vec![1]);
    }

    #[test]
    fn disable_outputs_empties_output_chain() {
        let outputs = vec![module("sink", 0)];
        let chain = compile(0, 0, &task("t"), "in", &[], &[], &outputs, true);
        assert!(chain.outputs.is_empty());
    }

    #[test]
    fn zero_matching_outputs_is_a_valid_chain() {
        let mut picky = module("picky", 0);
        picky.filters = Filters {
            include_tasks: Some(vec!["nothing_matches_*".to_string()]),
            ..Default::default()
        };
        let outputs = vec![picky];
        let chain = compile(0, 0, &task("t"), "in", &[], &[], &outputs, false);
        assert!(chain.outputs.is_empty());
    }

    #[test]
    fn exclude_filters_admit_non_matches() {
        let mut not_legacy = module("not_legacy", 0);
        not_legacy.filters = Filters {
            exclude_inputs: Some(vec!["legacy*".to_string()]),
            ..Default::default()
        };
        let outputs = vec![not_legacy];

        let chain = compile(0, 0, &task("t"), "pg", &[], &[], &outputs, false);
        assert_eq!(chain.outputs, vec![0]);

        let chain = compile(0, 0, &task("t"), "legacy_db", &[], &[], &outputs, false);
        assert!(chain.outputs.is_empty());
    }
}
