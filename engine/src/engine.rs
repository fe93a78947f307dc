//! Shared engine handle and the in-memory view of one active run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::agents::Collaborators;
use crate::core::types::{
    AgentState, DebugLevel, Plan, RunKey, RunMode, RunRecord, RunStatus, TaskStatus,
};
use crate::events::{EventSink, RunEvent};
use crate::io::artifacts::{ArtifactChecker, FsArtifactChecker};
use crate::io::checkpoint::Checkpoint;
use crate::io::config::EngineConfig;
use crate::io::postprocess::PostprocessPool;
use crate::io::repository::Repository;
use crate::io::retry::RetrySink;
use crate::io::store::Store;
use crate::router::{RouteDecision, route};

/// Orchestration engine: configuration, persistence and collaborators.
///
/// Entry drivers live in [`crate::start`]. An engine must be built inside a
/// tokio runtime because it starts the postprocessing workers.
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) store: Store,
    pub(crate) agents: Collaborators,
    pub(crate) artifacts: Arc<dyn ArtifactChecker>,
    pub(crate) postprocess: PostprocessPool,
    checkpoint_sink: RetrySink,
}

impl Engine {
    pub fn new(cfg: EngineConfig, repo: Arc<dyn Repository>, agents: Collaborators) -> Result<Self> {
        cfg.validate()?;
        let store = Store::new(repo, &cfg);
        let postprocess = PostprocessPool::start(&cfg.postprocess, agents.postprocessor.clone());
        Ok(Self {
            cfg,
            store,
            agents,
            artifacts: Arc::new(FsArtifactChecker),
            postprocess,
            checkpoint_sink: Arc::new(|attempt: u32, err: &str| {
                warn!(attempt, error = err, "checkpoint attempt failed");
            }),
        })
    }

    pub fn with_artifact_checker(mut self, checker: Arc<dyn ArtifactChecker>) -> Self {
        self.artifacts = checker;
        self
    }

    /// Classify a message into a conversation mode. Synchronous.
    pub fn route(&self, message: &str) -> RouteDecision {
        route(message, self.agents.classifier.as_deref(), &self.cfg.router)
    }

    /// Stop background workers and wait for detached work.
    pub async fn shutdown(&self) {
        self.postprocess.shutdown().await;
    }

    /// Checkpoint the active run; failures degrade to a warning and a debug entry.
    pub(crate) async fn checkpoint(&self, run: &ActiveRun, status: Option<RunStatus>, clear_finished_at: bool) {
        if let Err(err) = self.try_checkpoint(run, status, clear_finished_at).await {
            self.store
                .debug(&run.key, None, DebugLevel::Warn, format!("checkpoint failed: {err}"))
                .await;
        }
    }

    /// Checkpoint the active run and report whether it was written.
    pub(crate) async fn try_checkpoint(
        &self,
        run: &ActiveRun,
        status: Option<RunStatus>,
        clear_finished_at: bool,
    ) -> Result<(), String> {
        let mut cp = Checkpoint::new(run.key.clone(), run.state.clone()).with_plan(run.plan.clone());
        cp.status = status;
        cp.clear_finished_at = clear_finished_at;
        cp.warnings = run.warnings.clone();
        self.store.persist(cp, Some(&self.checkpoint_sink)).await
    }

    /// Mirror a run status onto its task, logging failures.
    pub(crate) async fn mirror_task(&self, key: &RunKey, status: RunStatus) {
        if let Err(err) = self
            .store
            .mirror_task_status(&key.task_id, TaskStatus::from(status))
            .await
        {
            warn!(run_id = %key.run_id, error = %format!("{err:#}"), "task status mirror failed");
        }
    }
}

/// In-memory working copy of a run while a driver owns it.
#[derive(Debug, Clone)]
pub(crate) struct ActiveRun {
    pub key: RunKey,
    pub mode: RunMode,
    pub instruction: String,
    pub workdir: PathBuf,
    pub plan: Plan,
    pub state: AgentState,
    pub warnings: Vec<String>,
}

impl ActiveRun {
    pub fn from_record(run: RunRecord) -> Self {
        Self {
            key: run.key(),
            mode: run.mode,
            instruction: run.instruction,
            workdir: run.workdir,
            plan: run.plan.unwrap_or_default(),
            state: run.state,
            warnings: run.warnings,
        }
    }

    pub fn emit_plan(&self, events: &EventSink) {
        events.emit(RunEvent::Plan {
            run_id: self.key.run_id.clone(),
            items: self.plan.items.clone(),
        });
    }

    pub fn delta(&self, events: &EventSink, text: impl Into<String>) {
        events.emit(RunEvent::Delta {
            run_id: self.key.run_id.clone(),
            text: text.into(),
        });
    }

    pub fn observe(&mut self, note: String) {
        self.state.envelope.observations.push(note);
    }

    /// The last `window` observations.
    pub fn recent_observations(&self, window: usize) -> Vec<String> {
        let all = &self.state.envelope.observations;
        all[all.len().saturating_sub(window)..].to_vec()
    }
}

/// Fresh run record for a new attempt.
pub(crate) fn new_run_record(
    key: &RunKey,
    mode: RunMode,
    instruction: &str,
    workdir: PathBuf,
) -> RunRecord {
    let now = Utc::now();
    let mut state = AgentState::new(mode);
    state.envelope.pending_planning = true;
    RunRecord {
        task_id: key.task_id.clone(),
        run_id: key.run_id.clone(),
        mode,
        status: RunStatus::Running,
        instruction: instruction.to_string(),
        workdir,
        plan: None,
        state,
        error: None,
        warnings: Vec::new(),
        created_at: now,
        updated_at: now,
        finished_at: None,
    }
}
