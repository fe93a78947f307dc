//! Resume-point decision from persisted state and the step ledger.

use crate::core::types::{Plan, ResumeEnvelope, StepRecord, StepStatus};

/// Ledger row a resumed run continues from.
///
/// The lowest row that is not done or skipped when one exists, else the highest
/// settled row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastActiveStep {
    pub order: u32,
    pub status: StepStatus,
}

/// Inputs to [`decide_resume_point`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeInputs {
    /// Step order recorded by the paused marker, if the run is suspended.
    pub paused_step_order: Option<u32>,
    /// `AgentState` step order; only consulted when the ledger is empty.
    pub state_step_order: Option<u32>,
    /// Highest ledger order with status done (or skipped).
    pub last_done_step: Option<u32>,
    pub last_active_step: Option<LastActiveStep>,
    /// Lowest plan item that is unsettled and has no done or skipped ledger row.
    pub first_open_item: Option<u32>,
    pub plan_total_steps: u32,
    pub pending_planning: bool,
}

impl ResumeInputs {
    /// Gather the inputs from a run's envelope, its plan and its step ledger.
    pub fn collect(envelope: &ResumeEnvelope, plan: &Plan, steps: &[StepRecord]) -> Self {
        let last_done_step = steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.step_order)
            .max();
        // Parallel branches settle out of order, so an open row below a finished
        // one is where the run actually stands.
        let open = steps
            .iter()
            .filter(|s| !matches!(s.status, StepStatus::Done | StepStatus::Skipped))
            .min_by_key(|s| s.step_order);
        let last_active_step = open
            .or_else(|| steps.iter().max_by_key(|s| s.step_order))
            .map(|s| LastActiveStep {
                order: s.step_order,
                status: s.status,
            });
        let first_open_item = plan
            .items
            .iter()
            .zip(1u32..)
            .find(|(item, order)| {
                let finished_row = steps.iter().any(|s| {
                    s.step_order == *order
                        && s.step_id == item.id
                        && matches!(s.status, StepStatus::Done | StepStatus::Skipped)
                });
                !item.status.is_settled() && !finished_row
            })
            .map(|(_, order)| order);
        Self {
            paused_step_order: envelope.paused.as_ref().map(|p| p.step_order),
            state_step_order: Some(envelope.step_order),
            last_done_step,
            last_active_step,
            first_open_item,
            plan_total_steps: plan.total_steps(),
            pending_planning: envelope.pending_planning,
        }
    }
}

/// Where a resumed run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeDecision {
    /// 1-based order of the next step to execute.
    pub resume_step_order: u32,
    /// The plan is fully consumed; go straight to finalization.
    pub skip_execution: bool,
}

/// Decide the resume point.
///
/// Precedence: an explicit paused order, then the ledger row picked by
/// [`ResumeInputs::collect`] (done/skipped resume after it, anything else
/// resumes at it), then the last done
/// step plus one. An overrun of the plan is kept only when no re-planning is pending,
/// in which case it signals `skip_execution`.
pub fn decide_resume_point(inputs: &ResumeInputs) -> ResumeDecision {
    let candidate = if let Some(paused) = inputs.paused_step_order {
        paused
    } else if let Some(active) = inputs.last_active_step {
        match active.status {
            StepStatus::Done | StepStatus::Skipped => active.order.saturating_add(1),
            StepStatus::Running | StepStatus::Failed | StepStatus::Waiting => active.order,
            // A stopped run's reset row: not yet attempted.
            StepStatus::Planned => active.order,
        }
    } else if let Some(done) = inputs.last_done_step {
        done.saturating_add(1)
    } else {
        inputs.state_step_order.unwrap_or(1)
    };

    let mut resume_step_order = candidate.max(1);
    let total = inputs.plan_total_steps;
    if inputs.paused_step_order.is_none()
        && total > 0
        && resume_step_order > total
        && let Some(open) = inputs.first_open_item
    {
        resume_step_order = open;
    }
    let overrun = total > 0 && resume_step_order > total;
    if overrun && inputs.pending_planning {
        resume_step_order = total;
    }

    ResumeDecision {
        resume_step_order,
        skip_execution: total > 0 && resume_step_order > total && !inputs.pending_planning,
    }
}
