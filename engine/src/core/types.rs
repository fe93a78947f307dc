//! Shared deterministic types for the run orchestration core.
//!
//! These types define stable contracts between core components and the persisted
//! records. They must not depend on external state or I/O.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current `AgentState` schema version written by this crate.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a logical unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Waiting,
    Done,
    Failed,
    Stopped,
}

/// Lifecycle of one execution attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Waiting,
    Done,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Done, failed and stopped stamp a completion time; waiting does not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }

    /// Running or waiting runs count against the one-active-run-per-task invariant.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl From<RunStatus> for TaskStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => TaskStatus::Running,
            RunStatus::Waiting => TaskStatus::Waiting,
            RunStatus::Done => TaskStatus::Done,
            RunStatus::Failed => TaskStatus::Failed,
            RunStatus::Stopped => TaskStatus::Stopped,
        }
    }
}

/// Execution mode of a run: single-planner sequential or multi-planner parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Do,
    Think,
}

/// Ledger status of one attempted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Planned,
    Running,
    Done,
    Failed,
    Skipped,
    Waiting,
}

/// Status of a plan item as shown to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
    Waiting,
}

impl ItemStatus {
    /// Items that count as finished for dependency scheduling.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

/// Action types a step may be permitted to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    LlmCall,
    ToolCall,
    ShellCommand,
    FileRead,
    FileWrite,
    HttpRequest,
    MemoryWrite,
    /// Produces the run's human-readable output.
    TaskOutput,
    /// Suspends the run to ask the user a question.
    UserPrompt,
    #[serde(other)]
    Other,
}

impl ActionKind {
    /// Terminal or user-interaction actions are never retried verbatim by reflection.
    pub fn is_terminal_or_interactive(self) -> bool {
        matches!(self, Self::TaskOutput | Self::UserPrompt)
    }
}

/// Semantic kind of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Action,
    Feedback,
    KnowledgeSufficiency,
}

/// One ordered step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Stable identifier; survives renumbering by reflection splices.
    pub id: String,
    pub title: String,
    pub brief: String,
    pub allow: Vec<ActionKind>,
    #[serde(default)]
    pub kind: StepKind,
    /// Files this step reads (relative to the run workdir).
    #[serde(default)]
    pub reads: Vec<String>,
    /// Files this step writes (relative to the run workdir).
    #[serde(default)]
    pub writes: Vec<String>,
    /// Explicit dependencies by step id, when planning elaboration provided them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl PlanItem {
    pub fn allows(&self, action: ActionKind) -> bool {
        self.allow.contains(&action)
    }

    /// True when the only permitted action is asking the user.
    pub fn is_input_only(&self) -> bool {
        !self.allow.is_empty() && self.allow.iter().all(|a| *a == ActionKind::UserPrompt)
    }

    /// True when the allow-list has no terminal or user-interaction action.
    pub fn is_retryable_verbatim(&self) -> bool {
        !self.allow.iter().any(|a| a.is_terminal_or_interactive())
    }
}

/// Ordered step specs produced by planning and mutated only by reflection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub items: Vec<PlanItem>,
    /// Paths the run promises to produce (relative to the run workdir).
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Plan length as a 1-based step order ceiling.
    pub fn total_steps(&self) -> u32 {
        u32::try_from(self.items.len()).unwrap_or(u32::MAX)
    }

    /// Item at a 1-based step order.
    pub fn item(&self, order: u32) -> Option<&PlanItem> {
        let idx = usize::try_from(order).ok()?.checked_sub(1)?;
        self.items.get(idx)
    }

    pub fn item_mut(&mut self, order: u32) -> Option<&mut PlanItem> {
        let idx = usize::try_from(order).ok()?.checked_sub(1)?;
        self.items.get_mut(idx)
    }

    pub fn order_of(&self, id: &str) -> Option<u32> {
        self.items
            .iter()
            .position(|item| item.id == id)
            .and_then(|idx| u32::try_from(idx + 1).ok())
    }

    /// The mandatory sequential tail: a last step that asks for confirmation.
    pub fn confirmation_tail(&self) -> Option<u32> {
        let last = self.items.last()?;
        if last.kind == StepKind::Feedback || last.is_input_only() {
            return Some(self.total_steps());
        }
        None
    }

    /// Declared plan artifacts followed by every step's declared writes, deduplicated.
    pub fn declared_artifacts(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let writes = self.items.iter().flat_map(|item| item.writes.iter());
        for path in self.artifacts.iter().chain(writes) {
            if !out.contains(path) {
                out.push(path.clone());
            }
        }
        out
    }
}

/// Why a run suspended for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    #[default]
    NeedInput,
    ConfirmSatisfaction,
}

/// Marker persisted while a run waits for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedMarker {
    pub step_order: u32,
    pub step_id: String,
    pub question: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub reason: SuspendReason,
}

/// Reflection bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionCounters {
    pub rounds: u32,
    #[serde(default)]
    pub inserted_steps: u32,
    #[serde(default)]
    pub last_failed_order: Option<u32>,
}

/// Resumption envelope shared by every mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeEnvelope {
    /// Next 1-based step order to execute.
    pub step_order: u32,
    #[serde(default)]
    pub paused: Option<PausedMarker>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub reflection: ReflectionCounters,
    /// Planning has not produced a persisted plan yet.
    #[serde(default)]
    pub pending_planning: bool,
    /// Reason recorded by the last suspension, kept after the marker is cleared.
    #[serde(default)]
    pub suspend_reason: Option<SuspendReason>,
}

impl Default for ResumeEnvelope {
    fn default() -> Self {
        Self {
            step_order: 1,
            paused: None,
            context: BTreeMap::new(),
            observations: Vec::new(),
            reflection: ReflectionCounters::default(),
            pending_planning: false,
            suspend_reason: None,
        }
    }
}

/// Mode-specific state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModeState {
    Do {},
    Think {
        /// Vote tally per planner proposal (first-seen order).
        #[serde(default)]
        planner_votes: Vec<u32>,
        /// Step id -> executor label.
        #[serde(default)]
        executor_assignments: BTreeMap<String, String>,
    },
}

impl ModeState {
    pub fn for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Do => Self::Do {},
            RunMode::Think => Self::Think {
                planner_votes: Vec::new(),
                executor_assignments: BTreeMap::new(),
            },
        }
    }
}

/// Resumption state owned and written exclusively by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub schema_version: u32,
    #[serde(flatten)]
    pub envelope: ResumeEnvelope,
    pub mode: ModeState,
}

impl AgentState {
    pub fn new(mode: RunMode) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            envelope: ResumeEnvelope::default(),
            mode: ModeState::for_mode(mode),
        }
    }

    /// Load a persisted state blob, upgrading older schema versions.
    ///
    /// Version 0 blobs predate `schema_version` and `mode`; they are upgraded by
    /// filling the mode from the run's recorded mode.
    pub fn load(value: Value, mode: RunMode) -> Result<Self, serde_json::Error> {
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if version == 0 {
            let envelope: ResumeEnvelope = serde_json::from_value(value)?;
            return Ok(Self {
                schema_version: STATE_SCHEMA_VERSION,
                envelope,
                mode: ModeState::for_mode(mode),
            });
        }
        serde_json::from_value(value)
    }
}

/// Composite key of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub task_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub task_id: String,
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    /// Free-text instruction the run executes.
    pub instruction: String,
    pub workdir: PathBuf,
    #[serde(default)]
    pub plan: Option<Plan>,
    pub state: AgentState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn key(&self) -> RunKey {
        RunKey {
            task_id: self.task_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

/// Durable ledger row for one attempted step order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_id: String,
    pub run_id: String,
    pub step_order: u32,
    pub step_id: String,
    pub title: String,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    UserAnswer,
    FailureSummary,
}

impl OutputKind {
    /// Outputs that count as the run's human-readable result.
    pub fn is_human_readable(self) -> bool {
        matches!(self, Self::Text | Self::FailureSummary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub task_id: String,
    pub run_id: String,
    pub kind: OutputKind,
    #[serde(default)]
    pub step_order: Option<u32>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Info,
    Warn,
    Error,
}

/// Diagnostic entry recorded alongside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub run_id: String,
    #[serde(default)]
    pub step_order: Option<u32>,
    pub level: DebugLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub task_id: String,
    pub run_id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, allow: Vec<ActionKind>) -> PlanItem {
        PlanItem {
            id: id.to_string(),
            title: id.to_string(),
            brief: String::new(),
            allow,
            kind: StepKind::Action,
            reads: Vec::new(),
            writes: Vec::new(),
            depends_on: None,
            status: ItemStatus::Pending,
        }
    }

    #[test]
    fn confirmation_tail_requires_input_only_or_feedback_last_step() {
        let mut plan = Plan {
            items: vec![
                item("a", vec![ActionKind::ToolCall]),
                item("b", vec![ActionKind::UserPrompt]),
            ],
            artifacts: Vec::new(),
        };
        assert_eq!(plan.confirmation_tail(), Some(2));

        plan.items[1].allow.push(ActionKind::TaskOutput);
        assert_eq!(plan.confirmation_tail(), None);

        plan.items[1].kind = StepKind::Feedback;
        assert_eq!(plan.confirmation_tail(), Some(2));
    }

    #[test]
    fn declared_artifacts_merges_plan_and_step_writes() {
        let mut a = item("a", vec![ActionKind::FileWrite]);
        a.writes = vec!["out/report.md".to_string(), "data.csv".to_string()];
        let plan = Plan {
            items: vec![a],
            artifacts: vec!["data.csv".to_string()],
        };
        assert_eq!(plan.declared_artifacts(), vec!["data.csv", "out/report.md"]);
    }

    #[test]
    fn legacy_state_without_version_is_upgraded() {
        let legacy = json!({
            "step_order": 3,
            "observations": ["fetched page"],
        });
        let state = AgentState::load(legacy, RunMode::Think).expect("load");
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.envelope.step_order, 3);
        assert!(matches!(state.mode, ModeState::Think { .. }));
    }

    #[test]
    fn current_state_round_trips_through_load() {
        let mut state = AgentState::new(RunMode::Do);
        state.envelope.paused = Some(PausedMarker {
            step_order: 2,
            step_id: "s2".to_string(),
            question: "continue?".to_string(),
            choices: vec!["yes".to_string(), "no".to_string()],
            reason: SuspendReason::NeedInput,
        });
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["mode"]["kind"], "do");
        let loaded = AgentState::load(value, RunMode::Think).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn unknown_action_kind_deserializes_as_other() {
        let kind: ActionKind = serde_json::from_value(json!("browser_click")).expect("parse");
        assert_eq!(kind, ActionKind::Other);
    }
}
