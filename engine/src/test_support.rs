//! Test-only builders, in-memory collaborators and an engine harness.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::agents::{
    ClassifyRequest, Classifier, Collaborators, Evaluator, PlanRequest, Planner, Postprocessor,
    ReflectionRequest, Reflector, StepContext, StepExecutor, StepOutput,
};
use crate::core::types::{
    ActionKind, DebugEntry, DebugLevel, ItemStatus, MemoryRecord, OutputRecord, Plan,
    PlanItem, RunKey, RunMode, RunRecord, RunStatus, StepKind, StepRecord, StepStatus,
    TaskRecord, TaskStatus,
};
#[cfg(test)]
use crate::engine::ActiveRun;
use crate::engine::{Engine, new_run_record};
use crate::events::{EventSink, RunEvent};
use crate::io::config::EngineConfig;
use crate::io::postprocess::PostprocessJob;
use crate::io::repository::{RepoError, RepoResult, Repository};

/// A pending action step whose title equals its id.
pub fn item(id: &str) -> PlanItem {
    PlanItem {
        id: id.to_string(),
        title: id.to_string(),
        brief: String::new(),
        allow: vec![ActionKind::LlmCall],
        kind: StepKind::Action,
        reads: Vec::new(),
        writes: Vec::new(),
        depends_on: None,
        status: ItemStatus::Pending,
    }
}

pub fn plan_of(items: Vec<PlanItem>) -> Plan {
    Plan {
        items,
        artifacts: Vec::new(),
    }
}

/// Ledger row for run `t1`/`r1` with step id `s{order}`.
pub fn step_record(order: u32, status: StepStatus, error: Option<&str>) -> StepRecord {
    let now = Utc::now();
    StepRecord {
        task_id: "t1".to_string(),
        run_id: "r1".to_string(),
        step_order: order,
        step_id: format!("s{order}"),
        title: format!("step {order}"),
        status,
        result: None,
        error: error.map(str::to_string),
        attempts: 1,
        started_at: Some(now),
        finished_at: None,
        updated_at: now,
    }
}

pub fn debug_entry(step_order: Option<u32>, level: DebugLevel, message: &str) -> DebugEntry {
    DebugEntry {
        run_id: "r1".to_string(),
        step_order,
        level,
        message: message.to_string(),
        created_at: Utc::now(),
    }
}

pub fn task_record(task_id: &str) -> TaskRecord {
    let now = Utc::now();
    TaskRecord {
        task_id: task_id.to_string(),
        title: format!("{task_id} title"),
        status: TaskStatus::Running,
        created_at: now,
        updated_at: now,
        finished_at: None,
    }
}

/// A running do-mode run with no plan yet.
pub fn run_record(task_id: &str, run_id: &str) -> RunRecord {
    let key = RunKey {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
    };
    new_run_record(&key, RunMode::Do, "test instruction", std::env::temp_dir())
}

/// An in-memory run for `t1`/`r1` that was never persisted.
#[cfg(test)]
pub(crate) fn active_run(mode: RunMode, plan: Plan) -> ActiveRun {
    let mut record = run_record("t1", "r1");
    record.mode = mode;
    record.state = crate::core::types::AgentState::new(mode);
    record.plan = Some(plan);
    ActiveRun::from_record(record)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Default)]
struct MemoryTables {
    tasks: BTreeMap<String, TaskRecord>,
    runs: BTreeMap<(String, String), RunRecord>,
    steps: BTreeMap<(String, String, u32), StepRecord>,
    outputs: Vec<OutputRecord>,
    debug: Vec<(String, DebugEntry)>,
    memory: Vec<MemoryRecord>,
    failing_run_updates: u32,
    failing_step_moves: u32,
}

/// Repository kept entirely in memory, with injectable outages.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<MemoryTables>,
}

impl MemoryRepository {
    /// Make the next `n` calls to `update_run` fail as unavailable.
    pub fn fail_next_run_updates(&self, n: u32) {
        lock(&self.tables).failing_run_updates = n;
    }

    /// Make the next `n` calls to `move_step` fail as unavailable.
    pub fn fail_next_step_moves(&self, n: u32) {
        lock(&self.tables).failing_step_moves = n;
    }

    pub fn memory_count(&self) -> usize {
        lock(&self.tables).memory.len()
    }
}

impl Repository for MemoryRepository {
    fn insert_task(&self, task: &TaskRecord) -> RepoResult<()> {
        lock(&self.tables)
            .tasks
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> RepoResult<Option<TaskRecord>> {
        Ok(lock(&self.tables).tasks.get(task_id).cloned())
    }

    fn update_task(&self, task: &TaskRecord) -> RepoResult<()> {
        let mut tables = lock(&self.tables);
        match tables.tasks.get_mut(&task.task_id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("task {}", task.task_id))),
        }
    }

    fn insert_run(&self, run: &RunRecord) -> RepoResult<()> {
        lock(&self.tables)
            .runs
            .insert((run.task_id.clone(), run.run_id.clone()), run.clone());
        Ok(())
    }

    fn get_run(&self, task_id: &str, run_id: &str) -> RepoResult<Option<RunRecord>> {
        Ok(lock(&self.tables)
            .runs
            .get(&(task_id.to_string(), run_id.to_string()))
            .cloned())
    }

    fn update_run(&self, run: &RunRecord) -> RepoResult<()> {
        let mut tables = lock(&self.tables);
        if tables.failing_run_updates > 0 {
            tables.failing_run_updates -= 1;
            return Err(RepoError::Unavailable("injected outage".to_string()));
        }
        match tables
            .runs
            .get_mut(&(run.task_id.clone(), run.run_id.clone()))
        {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("run {}", run.run_id))),
        }
    }

    fn list_runs(&self, task_id: &str) -> RepoResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = lock(&self.tables)
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    fn get_step(&self, task_id: &str, run_id: &str, order: u32) -> RepoResult<Option<StepRecord>> {
        Ok(lock(&self.tables)
            .steps
            .get(&(task_id.to_string(), run_id.to_string(), order))
            .cloned())
    }

    fn upsert_step(&self, step: &StepRecord) -> RepoResult<()> {
        lock(&self.tables).steps.insert(
            (step.task_id.clone(), step.run_id.clone(), step.step_order),
            step.clone(),
        );
        Ok(())
    }

    fn list_steps(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<StepRecord>> {
        Ok(lock(&self.tables)
            .steps
            .values()
            .filter(|s| s.task_id == task_id && s.run_id == run_id)
            .cloned()
            .collect())
    }

    fn move_step(&self, task_id: &str, run_id: &str, from: u32, to: u32) -> RepoResult<()> {
        if from == to {
            return Ok(());
        }
        let mut tables = lock(&self.tables);
        if tables.failing_step_moves > 0 {
            tables.failing_step_moves -= 1;
            return Err(RepoError::Unavailable("injected outage".to_string()));
        }
        let key = (task_id.to_string(), run_id.to_string(), from);
        let Some(mut step) = tables.steps.remove(&key) else {
            return Ok(());
        };
        step.step_order = to;
        tables
            .steps
            .insert((task_id.to_string(), run_id.to_string(), to), step);
        Ok(())
    }

    fn append_output(&self, output: &OutputRecord) -> RepoResult<()> {
        lock(&self.tables).outputs.push(output.clone());
        Ok(())
    }

    fn list_outputs(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<OutputRecord>> {
        Ok(lock(&self.tables)
            .outputs
            .iter()
            .filter(|o| o.task_id == task_id && o.run_id == run_id)
            .cloned()
            .collect())
    }

    fn append_debug(&self, task_id: &str, entry: &DebugEntry) -> RepoResult<()> {
        lock(&self.tables)
            .debug
            .push((task_id.to_string(), entry.clone()));
        Ok(())
    }

    fn list_debug(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<DebugEntry>> {
        Ok(lock(&self.tables)
            .debug
            .iter()
            .filter(|(task, entry)| task == task_id && entry.run_id == run_id)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn find_memory(&self, task_id: &str, run_id: &str) -> RepoResult<Option<MemoryRecord>> {
        Ok(lock(&self.tables)
            .memory
            .iter()
            .find(|m| m.task_id == task_id && m.run_id == run_id)
            .cloned())
    }

    fn insert_memory(&self, memory: &MemoryRecord) -> RepoResult<()> {
        lock(&self.tables).memory.push(memory.clone());
        Ok(())
    }
}

/// Classifier returning a fixed reply or a fixed error.
pub struct ScriptedClassifier {
    reply: Result<String, String>,
    last: Mutex<Option<ClassifyRequest>>,
}

impl ScriptedClassifier {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            last: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            last: Mutex::new(None),
        }
    }

    pub fn last_request(&self) -> Option<ClassifyRequest> {
        lock(&self.last).clone()
    }
}

impl Classifier for ScriptedClassifier {
    fn classify(&self, req: &ClassifyRequest) -> Result<String> {
        *lock(&self.last) = Some(req.clone());
        self.reply.clone().map_err(|msg| anyhow!(msg))
    }
}

/// Planner returning a fixed JSON proposal.
pub struct ScriptedPlanner {
    label: String,
    reply: Result<Value, String>,
}

impl ScriptedPlanner {
    pub fn replying(value: Value) -> Self {
        Self {
            label: "scripted".to_string(),
            reply: Ok(value),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            label: "scripted".to_string(),
            reply: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    fn label(&self) -> &str {
        &self.label
    }

    async fn plan(&self, _req: &PlanRequest) -> Result<Value> {
        self.reply.clone().map_err(|msg| anyhow!(msg))
    }
}

/// Plan JSON with one step per `(title, action)` pair.
pub fn plan_reply(steps: &[(&str, &str)]) -> Value {
    let items: Vec<Value> = steps
        .iter()
        .map(|(title, action)| json!({"title": title, "brief": "", "allow": [action]}))
        .collect();
    json!({ "items": items })
}

/// Reflector returning a fixed JSON fix proposal.
pub struct ScriptedReflector {
    reply: Value,
    calls: Mutex<Vec<u32>>,
}

impl ScriptedReflector {
    pub fn replying(value: Value) -> Self {
        Self {
            reply: value,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Failed orders this reflector was asked about.
    pub fn calls(&self) -> Vec<u32> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Reflector for ScriptedReflector {
    fn label(&self) -> &str {
        "scripted"
    }

    async fn propose_fix(&self, req: &ReflectionRequest) -> Result<Value> {
        lock(&self.calls).push(req.failed_order);
        Ok(self.reply.clone())
    }
}

/// Executor with per-step-title scripted replies.
///
/// Unscripted steps succeed, and steps allowed to produce task output return
/// `"{title} result"` as output text.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Result<StepOutput, String>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn reply(&self, title: &str, output: StepOutput) {
        lock(&self.scripts)
            .entry(title.to_string())
            .or_default()
            .push_back(Ok(output));
    }

    /// Make the next execution of `title` raise.
    pub fn raise(&self, title: &str, message: &str) {
        lock(&self.scripts)
            .entry(title.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Titles executed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: &PlanItem, ctx: &StepContext) -> Result<StepOutput> {
        lock(&self.calls).push(step.title.clone());
        let scripted = lock(&self.scripts)
            .get_mut(&step.title)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => {
                let mut output = StepOutput::ok(
                    json!({"title": step.title, "order": ctx.order}),
                    format!("{} ok", step.title),
                );
                if step.allows(ActionKind::TaskOutput) {
                    output.output_text = Some(format!("{} result", step.title));
                }
                Ok(output)
            }
        }
    }
}

/// Evaluator returning a fixed verdict.
pub struct ScriptedEvaluator {
    verdict: String,
}

impl ScriptedEvaluator {
    pub fn replying(verdict: &str) -> Self {
        Self {
            verdict: verdict.to_string(),
        }
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn review(&self, _key: &RunKey, _answer: Option<&str>) -> Result<String> {
        Ok(self.verdict.clone())
    }
}

/// Postprocessor that records the run ids it handled.
#[derive(Default)]
pub struct RecordingPostprocessor {
    runs: Mutex<Vec<String>>,
}

impl RecordingPostprocessor {
    pub fn runs(&self) -> Vec<String> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl Postprocessor for RecordingPostprocessor {
    async fn postprocess(&self, job: &PostprocessJob) -> Result<()> {
        lock(&self.runs).push(job.key.run_id.clone());
        Ok(())
    }
}

/// Engine over an in-memory repository with fast retries and a captured event stream.
///
/// Must be built inside a tokio runtime.
pub struct EngineHarness {
    pub engine: Engine,
    pub events: EventSink,
    pub repo: Arc<MemoryRepository>,
    pub executor: Arc<ScriptedExecutor>,
    pub workdir: TempDir,
    received: Mutex<UnboundedReceiver<RunEvent>>,
}

impl EngineHarness {
    /// Harness with a [`ScriptedExecutor`]; `configure` adds the other collaborators.
    pub fn new(configure: impl FnOnce(Collaborators) -> Collaborators) -> Self {
        let mut cfg = EngineConfig::default();
        cfg.retry.base_delay_ms = 1;
        cfg.ledger.conflict_delay_ms = 1;
        Self::with_config(cfg, configure)
    }

    pub fn with_config(
        cfg: EngineConfig,
        configure: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let repo = Arc::new(MemoryRepository::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let agents = configure(Collaborators::new(executor.clone()));
        let engine = match Engine::new(cfg, repo.clone(), agents) {
            Ok(engine) => engine,
            Err(err) => panic!("engine: {err:#}"),
        };
        let (events, received) = EventSink::channel();
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir: {err}"),
        };
        Self {
            engine,
            events,
            repo,
            executor,
            workdir,
            received: Mutex::new(received),
        }
    }

    /// Persist task `t1` and run `r1` holding `plan`, and return its working copy.
    #[cfg(test)]
    pub(crate) async fn insert_active(&self, mode: RunMode, plan: Plan) -> ActiveRun {
        let key = RunKey {
            task_id: "t1".to_string(),
            run_id: "r1".to_string(),
        };
        let mut record = new_run_record(&key, mode, "test instruction", self.workdir.path().to_path_buf());
        record.plan = Some(plan);
        record.state.envelope.pending_planning = false;
        let repo = self.repo.as_ref();
        if let Err(err) = repo
            .insert_task(&task_record("t1"))
            .and_then(|()| repo.insert_run(&record))
        {
            panic!("seed run: {err}");
        }
        ActiveRun::from_record(record)
    }

    pub fn run_record(&self, key: &RunKey) -> RunRecord {
        match self.repo.get_run(&key.task_id, &key.run_id) {
            Ok(Some(run)) => run,
            Ok(None) => panic!("run {} missing", key.run_id),
            Err(err) => panic!("get run: {err}"),
        }
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.repo
            .get_task(task_id)
            .ok()
            .flatten()
            .map(|task| task.status)
    }

    pub fn outputs(&self, key: &RunKey) -> Vec<OutputRecord> {
        self.repo
            .list_outputs(&key.task_id, &key.run_id)
            .unwrap_or_default()
    }

    pub fn steps(&self, key: &RunKey) -> Vec<StepRecord> {
        self.repo
            .list_steps(&key.task_id, &key.run_id)
            .unwrap_or_default()
    }

    pub fn step(&self, key: &RunKey, order: u32) -> Option<StepRecord> {
        self.repo
            .get_step(&key.task_id, &key.run_id, order)
            .ok()
            .flatten()
    }

    /// Events emitted since the last drain.
    pub fn drain_events(&self) -> Vec<RunEvent> {
        let mut rx = lock(&self.received);
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn status_of(&self, key: &RunKey) -> RunStatus {
        self.run_record(key).status
    }
}
