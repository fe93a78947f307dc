//! Step dependency resolution for the parallel prefix.
//!
//! Explicit `depends_on` ids from planning elaboration win. Without them a step
//! depends on every earlier step that writes a file it reads, and steps that emit
//! output or talk to the user depend on everything before them.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::{ActionKind, Plan, StepKind};

/// Dependencies of the item at 0-based `idx`, as step ids of earlier items.
pub fn resolve_dependencies(plan: &Plan, idx: usize) -> Vec<String> {
    let Some(item) = plan.items.get(idx) else {
        return Vec::new();
    };
    match &item.depends_on {
        Some(ids) => {
            let earlier: BTreeSet<&str> = plan.items[..idx].iter().map(|i| i.id.as_str()).collect();
            let mut out: Vec<String> = Vec::new();
            for id in ids {
                if earlier.contains(id.as_str()) && !out.contains(id) {
                    out.push(id.clone());
                }
            }
            out
        }
        None => infer_dependencies(plan, idx),
    }
}

/// Heuristic dependencies from allow-lists and declared reads/writes.
pub fn infer_dependencies(plan: &Plan, idx: usize) -> Vec<String> {
    let Some(item) = plan.items.get(idx) else {
        return Vec::new();
    };
    let earlier = &plan.items[..idx];
    let gathers_everything = item.kind != StepKind::Action
        || item.allows(ActionKind::TaskOutput)
        || item.allows(ActionKind::UserPrompt);
    if gathers_everything {
        return earlier.iter().map(|i| i.id.clone()).collect();
    }
    earlier
        .iter()
        .filter(|other| other.writes.iter().any(|w| item.reads.contains(w)))
        .map(|other| other.id.clone())
        .collect()
}

/// Dependency graph over 1-based step orders for the given orders.
pub fn dependency_orders(plan: &Plan, orders: &BTreeSet<u32>) -> BTreeMap<u32, Vec<u32>> {
    let mut graph = BTreeMap::new();
    for &order in orders {
        let Some(idx) = usize::try_from(order).ok().and_then(|o| o.checked_sub(1)) else {
            continue;
        };
        let deps: Vec<u32> = resolve_dependencies(plan, idx)
            .iter()
            .filter_map(|id| plan.order_of(id))
            .collect();
        graph.insert(order, deps);
    }
    graph
}

/// Pending orders whose dependencies have all settled, in ascending order.
///
/// A dependency outside the scheduled window counts as satisfied when its plan
/// item is settled (done or skipped).
pub fn ready_orders(
    plan: &Plan,
    graph: &BTreeMap<u32, Vec<u32>>,
    pending: &BTreeSet<u32>,
    completed: &BTreeSet<u32>,
) -> Vec<u32> {
    pending
        .iter()
        .copied()
        .filter(|order| {
            graph.get(order).is_none_or(|deps| {
                deps.iter().all(|dep| {
                    completed.contains(dep)
                        || (!graph.contains_key(dep)
                            && plan.item(*dep).is_some_and(|i| i.status.is_settled()))
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, plan_of};

    #[test]
    fn explicit_dependencies_win_and_ignore_later_or_unknown_ids() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("c")]);
        plan.items[1].depends_on = Some(vec!["c".to_string(), "zz".to_string()]);
        plan.items[2].depends_on = Some(vec!["a".to_string(), "a".to_string()]);
        assert!(resolve_dependencies(&plan, 1).is_empty());
        assert_eq!(resolve_dependencies(&plan, 2), vec!["a"]);
    }

    #[test]
    fn reader_depends_on_writer() {
        let mut plan = plan_of(vec![item("fetch"), item("other"), item("parse")]);
        plan.items[0].writes = vec!["page.html".to_string()];
        plan.items[2].reads = vec!["page.html".to_string()];
        assert_eq!(infer_dependencies(&plan, 2), vec!["fetch"]);
        assert!(infer_dependencies(&plan, 1).is_empty());
    }

    #[test]
    fn output_steps_depend_on_everything_before() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("summary")]);
        plan.items[2].allow = vec![ActionKind::TaskOutput];
        assert_eq!(infer_dependencies(&plan, 2), vec!["a", "b"]);
    }

    #[test]
    fn ready_orders_respect_completed_and_settled_outside_window() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("c")]);
        plan.items[1].depends_on = Some(vec!["a".to_string()]);
        plan.items[2].depends_on = Some(vec!["b".to_string()]);
        plan.items[0].status = crate::core::types::ItemStatus::Skipped;

        let window: BTreeSet<u32> = [2, 3].into_iter().collect();
        let graph = dependency_orders(&plan, &window);
        let completed = BTreeSet::new();
        assert_eq!(ready_orders(&plan, &graph, &window, &completed), vec![2]);

        let pending: BTreeSet<u32> = [3].into_iter().collect();
        let completed: BTreeSet<u32> = [2].into_iter().collect();
        assert_eq!(ready_orders(&plan, &graph, &pending, &completed), vec![3]);
    }
}
