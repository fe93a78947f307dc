//! Failure-triggered plan mutation for think mode.

use anyhow::Result;
use futures::future::join_all;
use tracing::{info, warn};

use crate::agents::ReflectionRequest;
use crate::agents::planning::{ProposedStep, parse_fix_proposal};
use crate::core::splice::{build_fix_items, splice_after};
use crate::core::types::{DebugLevel, ItemStatus, RunStatus};
use crate::core::vote::majority_vote;
use crate::engine::{ActiveRun, Engine};
use crate::events::EventSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReflectOutcome {
    /// Remedial steps were spliced in; resume at this 1-based order.
    Spliced { resume_at: u32, inserted: u32 },
    /// The failure is terminal.
    GaveUp(String),
}

/// Ask the reflection strategists for remedial steps and splice them in after
/// the failed step.
pub(crate) async fn reflect(
    engine: &Engine,
    run: &mut ActiveRun,
    failed_order: u32,
    error: &str,
    events: &EventSink,
) -> Result<ReflectOutcome> {
    let rounds = run.state.envelope.reflection.rounds;
    if rounds >= engine.cfg.max_reflection_rounds {
        return Ok(ReflectOutcome::GaveUp(format!(
            "reflection ceiling reached after {rounds} rounds"
        )));
    }
    if engine.agents.reflectors.is_empty() {
        return Ok(ReflectOutcome::GaveUp("no reflection strategist configured".to_string()));
    }
    let Some(failed) = run.plan.item(failed_order).cloned() else {
        return Ok(ReflectOutcome::GaveUp(format!("step#{failed_order} missing from plan")));
    };
    let round = rounds + 1;

    let completed: Vec<u32> = run
        .plan
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.status == ItemStatus::Done)
        .filter_map(|(idx, _)| u32::try_from(idx + 1).ok())
        .collect();
    let req = ReflectionRequest {
        instruction: run.instruction.clone(),
        failed: failed.clone(),
        failed_order,
        error: error.to_string(),
        observations: run.recent_observations(engine.cfg.observation_window),
        completed,
        round,
    };

    let replies = join_all(
        engine
            .agents
            .reflectors
            .iter()
            .map(|reflector| reflector.propose_fix(&req)),
    )
    .await;
    let mut proposals: Vec<Vec<ProposedStep>> = Vec::new();
    for (reflector, reply) in engine.agents.reflectors.iter().zip(replies) {
        match reply.and_then(|raw| parse_fix_proposal(&raw)) {
            Ok(fix) => proposals.push(fix.steps),
            Err(err) => {
                let msg = format!("reflector {} rejected: {err:#}", reflector.label());
                warn!(run_id = %run.key.run_id, "{msg}");
                engine
                    .store
                    .debug(&run.key, Some(failed_order), DebugLevel::Warn, msg)
                    .await;
            }
        }
    }
    let winner = majority_vote(&proposals)
        .map(|vote| vote.winner)
        .unwrap_or_default();

    let proposed = winner
        .into_iter()
        .enumerate()
        .map(|(n, step)| step.into_item(format!("{}-fix{}-r{round}", failed.id, n + 1)))
        .collect();
    let room = engine.cfg.max_plan_steps.saturating_sub(run.plan.len());
    let fix = build_fix_items(proposed, &failed, round, engine.cfg.max_fix_steps.min(room));
    if fix.is_empty() {
        return Ok(ReflectOutcome::GaveUp(
            "reflection produced no remedial steps".to_string(),
        ));
    }

    // The spliced plan is made durable before the ledger moves; a resume
    // realigns the ledger to whatever plan it finds.
    let inserted = u32::try_from(fix.len()).unwrap_or(u32::MAX);
    let failed_idx = usize::try_from(failed_order - 1).unwrap_or(usize::MAX);
    let mut next = run.clone();
    splice_after(&mut next.plan, failed_idx, fix);
    if let Some(item) = next.plan.item_mut(failed_order) {
        item.status = ItemStatus::Skipped;
    }
    let counters = &mut next.state.envelope.reflection;
    counters.rounds = round;
    counters.inserted_steps += inserted;
    counters.last_failed_order = Some(failed_order);
    next.state.envelope.step_order = failed_order + 1;
    next.observe(format!(
        "reflection round {round}: inserted {inserted} steps after step#{failed_order}"
    ));
    if let Err(err) = engine
        .try_checkpoint(&next, Some(RunStatus::Running), false)
        .await
    {
        warn!(run_id = %run.key.run_id, error = %err, "spliced plan not saved");
        return Ok(ReflectOutcome::GaveUp(format!("spliced plan not saved: {err}")));
    }
    *run = next;
    engine.store.realign_steps(&run.key, &run.plan).await?;

    info!(run_id = %run.key.run_id, round, inserted, failed_order, "plan spliced");
    run.emit_plan(events);
    run.delta(
        events,
        format!("reflection round {round}: {inserted} remedial steps after step#{failed_order}"),
    );
    Ok(ReflectOutcome::Spliced {
        resume_at: failed_order + 1,
        inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionKind, RunMode};
    use crate::io::config::EngineConfig;
    use crate::test_support::{EngineHarness, ScriptedReflector, active_run, item, plan_of};
    use serde_json::json;
    use std::sync::Arc;

    fn fix_reply(titles: &[&str]) -> serde_json::Value {
        let steps: Vec<_> = titles
            .iter()
            .map(|t| json!({"title": t, "brief": "", "allow": ["http_request"]}))
            .collect();
        json!({ "steps": steps })
    }

    #[tokio::test]
    async fn ceiling_stops_reflection() {
        let harness = EngineHarness::new(|agents| {
            agents.with_reflector(Arc::new(ScriptedReflector::replying(fix_reply(&["x"]))))
        });
        let mut run = active_run(RunMode::Think, plan_of(vec![item("a")]));
        run.state.envelope.reflection.rounds = 2;
        let got = reflect(&harness.engine, &mut run, 1, "boom", &harness.events)
            .await
            .expect("reflect");
        assert!(matches!(got, ReflectOutcome::GaveUp(reason) if reason.contains("ceiling")));
    }

    #[tokio::test]
    async fn majority_proposal_is_spliced_with_retry_slot() {
        let harness = EngineHarness::new(|agents| {
            agents
                .with_reflector(Arc::new(ScriptedReflector::replying(fix_reply(&["mirror"]))))
                .with_reflector(Arc::new(ScriptedReflector::replying(fix_reply(&["other"]))))
                .with_reflector(Arc::new(ScriptedReflector::replying(fix_reply(&["mirror"]))))
        });
        let mut plan = plan_of(vec![item("a"), item("b"), item("c")]);
        plan.items[1].allow = vec![ActionKind::HttpRequest];
        plan.items[1].status = ItemStatus::Failed;
        let mut run = harness.insert_active(RunMode::Think, plan).await;

        let got = reflect(&harness.engine, &mut run, 2, "timeout", &harness.events)
            .await
            .expect("reflect");
        assert_eq!(
            got,
            ReflectOutcome::Spliced {
                resume_at: 3,
                inserted: 2
            }
        );
        let titles: Vec<&str> = run.plan.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b", "mirror", "b", "c"]);
        assert_eq!(run.plan.items[1].status, ItemStatus::Skipped);
        assert_eq!(run.state.envelope.reflection.rounds, 1);
        assert_eq!(run.state.envelope.step_order, 3);
    }

    #[tokio::test]
    async fn invalid_replies_count_as_no_proposal() {
        let harness = EngineHarness::new(|agents| {
            agents.with_reflector(Arc::new(ScriptedReflector::replying(json!({"oops": true}))))
        });
        let mut run = harness
            .insert_active(RunMode::Think, plan_of(vec![item("a")]))
            .await;
        let got = reflect(&harness.engine, &mut run, 1, "boom", &harness.events)
            .await
            .expect("reflect");
        assert_eq!(
            got,
            ReflectOutcome::GaveUp("reflection produced no remedial steps".to_string())
        );
    }

    #[tokio::test]
    async fn tight_plan_room_keeps_the_retry_slot() {
        let mut cfg = EngineConfig::default();
        cfg.retry.base_delay_ms = 1;
        cfg.max_plan_steps = 4;
        let harness = EngineHarness::with_config(cfg, |agents| {
            agents.with_reflector(Arc::new(ScriptedReflector::replying(fix_reply(&[
                "mirror", "check-dns",
            ]))))
        });
        let mut plan = plan_of(vec![item("a"), item("b")]);
        plan.items[1].allow = vec![ActionKind::HttpRequest];
        plan.items[1].status = ItemStatus::Failed;
        let mut run = harness.insert_active(RunMode::Think, plan).await;

        let got = reflect(&harness.engine, &mut run, 2, "timeout", &harness.events)
            .await
            .expect("reflect");
        assert_eq!(
            got,
            ReflectOutcome::Spliced {
                resume_at: 3,
                inserted: 2
            }
        );
        let ids: Vec<&str> = run.plan.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "b-fix1-r1", "b-retry-r1"]);
    }
}
