//! Plan mutation by reflection: splice remedial steps after a failed step.

use crate::core::dependencies::resolve_dependencies;
use crate::core::types::{ItemStatus, Plan, PlanItem, StepRecord, StepStatus};

/// Build the items to insert for one reflection round.
///
/// `proposed` are the strategists' remedial steps. When the failed step may be
/// retried verbatim, the last of `max_fix_steps` slots is reserved for that retry.
/// Returns an empty list when no remedial step was proposed.
pub fn build_fix_items(
    proposed: Vec<PlanItem>,
    failed: &PlanItem,
    round: u32,
    max_fix_steps: usize,
) -> Vec<PlanItem> {
    if proposed.is_empty() || max_fix_steps == 0 {
        return Vec::new();
    }
    let reserve_retry = failed.is_retryable_verbatim() && max_fix_steps >= 2;
    let remedial_slots = if reserve_retry {
        max_fix_steps - 1
    } else {
        max_fix_steps
    };

    let mut out: Vec<PlanItem> = proposed
        .into_iter()
        .take(remedial_slots)
        .enumerate()
        .map(|(n, mut item)| {
            item.id = format!("{}-fix{}-r{}", failed.id, n + 1, round);
            item.status = ItemStatus::Pending;
            item
        })
        .collect();

    if reserve_retry {
        let mut retry = failed.clone();
        retry.id = format!("{}-retry-r{}", failed.id, round);
        retry.status = ItemStatus::Pending;
        out.push(retry);
    }
    out
}

/// Insert `fix` immediately after the 0-based `failed_idx`.
///
/// Items beyond the splice keep their status. The inserted steps form a chain
/// starting from the failed step's own dependencies, and explicit dependents of
/// the failed step are rewired to the last inserted step.
pub fn splice_after(plan: &mut Plan, failed_idx: usize, mut fix: Vec<PlanItem>) {
    if fix.is_empty() || failed_idx >= plan.items.len() {
        return;
    }
    let failed_id = plan.items[failed_idx].id.clone();
    let base_deps = resolve_dependencies(plan, failed_idx);

    let mut prev: Option<String> = None;
    for item in &mut fix {
        item.depends_on = Some(match &prev {
            Some(id) => vec![id.clone()],
            None => base_deps.clone(),
        });
        prev = Some(item.id.clone());
    }
    let last_id = prev.unwrap_or_default();

    for later in plan.items.iter_mut().skip(failed_idx + 1) {
        let Some(deps) = later.depends_on.as_mut() else {
            continue;
        };
        if deps.contains(&failed_id) && !deps.contains(&last_id) {
            deps.push(last_id.clone());
        }
    }

    let tail = plan.items.split_off(failed_idx + 1);
    plan.items.extend(fix);
    plan.items.extend(tail);
}

/// Ledger writes that bring the step ledger in line with a (spliced) plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerRealignment {
    /// `(from, to)` row moves, highest target first so no row lands on one that
    /// has not moved yet.
    pub moves: Vec<(u32, u32)>,
    /// Orders (after the moves) of failed rows whose plan item reflection skipped.
    pub skipped: Vec<u32>,
}

impl LedgerRealignment {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.skipped.is_empty()
    }
}

/// Compute where each ledger row belongs in `plan`, matching rows to items by
/// step id.
///
/// Targets come from ids rather than a shift width, so applying the result
/// and computing it again yields nothing to do. Rows whose id is not in the
/// plan stay where they are.
pub fn realign_ledger(plan: &Plan, rows: &[StepRecord]) -> LedgerRealignment {
    let mut out = LedgerRealignment::default();
    for row in rows {
        let in_place = plan
            .item(row.step_order)
            .is_some_and(|item| item.id == row.step_id);
        let target = if in_place {
            Some(row.step_order)
        } else {
            plan.order_of(&row.step_id)
        };
        let Some(target) = target else {
            continue;
        };
        if target != row.step_order {
            out.moves.push((row.step_order, target));
        }
        let item_skipped = plan
            .item(target)
            .is_some_and(|item| item.status == ItemStatus::Skipped);
        if item_skipped && row.status == StepStatus::Failed {
            out.skipped.push(target);
        }
    }
    out.moves.sort_by_key(|(_, to)| std::cmp::Reverse(*to));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ActionKind;
    use crate::test_support::{item, plan_of, step_record};

    fn content(items: &[PlanItem]) -> Vec<(String, String, Vec<ActionKind>)> {
        items
            .iter()
            .map(|i| (i.title.clone(), i.brief.clone(), i.allow.clone()))
            .collect()
    }

    #[test]
    fn splice_law_holds() {
        let old = plan_of(vec![item("a"), item("b"), item("c"), item("d"), item("e")]);
        let fix = vec![item("x"), item("y")];
        let mut new = old.clone();
        splice_after(&mut new, 2, fix.clone());

        assert_eq!(new.len(), old.len() + fix.len());
        let mut expected = old.items[..3].to_vec();
        expected.extend(fix);
        expected.extend(old.items[3..].to_vec());
        assert_eq!(content(&new.items), content(&expected));
    }

    #[test]
    fn later_items_keep_status_and_dependents_wait_for_fix_chain() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("c")]);
        plan.items[2].status = ItemStatus::Done;
        plan.items[1].depends_on = Some(vec!["a".to_string()]);
        plan.items[2].depends_on = Some(vec!["b".to_string()]);

        splice_after(&mut plan, 1, vec![item("f1"), item("f2")]);

        let ids: Vec<&str> = plan.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "f1", "f2", "c"]);
        assert_eq!(plan.items[4].status, ItemStatus::Done);
        assert_eq!(plan.items[2].depends_on, Some(vec!["a".to_string()]));
        assert_eq!(plan.items[3].depends_on, Some(vec!["f1".to_string()]));
        assert_eq!(
            plan.items[4].depends_on,
            Some(vec!["b".to_string(), "f2".to_string()])
        );
    }

    #[test]
    fn retry_slot_reserved_for_plain_steps() {
        let failed = item("s3");
        let proposed = vec![item("p1"), item("p2"), item("p3")];
        let fix = build_fix_items(proposed, &failed, 1, 3);
        let ids: Vec<&str> = fix.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["s3-fix1-r1", "s3-fix2-r1", "s3-retry-r1"]);
        assert_eq!(fix[2].title, failed.title);
        assert_eq!(fix[2].allow, failed.allow);
    }

    #[test]
    fn no_retry_slot_for_output_or_prompt_steps() {
        let mut failed = item("s3");
        failed.allow = vec![ActionKind::LlmCall, ActionKind::TaskOutput];
        let fix = build_fix_items(vec![item("p1"), item("p2")], &failed, 2, 3);
        assert_eq!(fix.len(), 2);
        assert!(fix.iter().all(|i| !i.id.contains("retry")));
    }

    #[test]
    fn nothing_proposed_means_nothing_inserted() {
        assert!(build_fix_items(Vec::new(), &item("s1"), 1, 3).is_empty());
    }

    fn row(order: u32, id: &str, status: StepStatus) -> StepRecord {
        let mut row = step_record(order, status, None);
        row.step_id = id.to_string();
        row
    }

    #[test]
    fn realign_follows_ids_and_flips_the_skipped_failure() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("c"), item("d")]);
        plan.items[1].status = ItemStatus::Skipped;
        splice_after(&mut plan, 1, vec![item("f1"), item("f2")]);
        let rows = vec![
            row(1, "a", StepStatus::Done),
            row(2, "b", StepStatus::Failed),
            row(3, "c", StepStatus::Done),
            row(4, "d", StepStatus::Done),
        ];

        let got = realign_ledger(&plan, &rows);
        assert_eq!(got.moves, vec![(4, 6), (3, 5)]);
        assert_eq!(got.skipped, vec![2]);
    }

    #[test]
    fn realign_of_a_partly_moved_ledger_finishes_the_move() {
        let mut plan = plan_of(vec![item("a"), item("b"), item("c"), item("d")]);
        splice_after(&mut plan, 1, vec![item("f1"), item("f2")]);
        // "d" already moved, "c" not yet.
        let rows = vec![
            row(1, "a", StepStatus::Done),
            row(2, "b", StepStatus::Skipped),
            row(3, "c", StepStatus::Done),
            row(6, "d", StepStatus::Done),
        ];
        assert_eq!(realign_ledger(&plan, &rows).moves, vec![(3, 5)]);

        let done = vec![
            row(1, "a", StepStatus::Done),
            row(2, "b", StepStatus::Skipped),
            row(5, "c", StepStatus::Done),
            row(6, "d", StepStatus::Done),
        ];
        assert!(realign_ledger(&plan, &done).is_empty());
    }
}
