//! Async facade over a blocking [`Repository`] with the shared retry policy.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::splice::{LedgerRealignment, realign_ledger};
use crate::core::types::{
    DebugEntry, DebugLevel, MemoryRecord, OutputKind, OutputRecord, Plan, RunKey, RunRecord,
    StepRecord, StepStatus, TaskRecord, TaskStatus,
};
use crate::io::config::EngineConfig;
use crate::io::repository::{RepoResult, Repository};
use crate::io::retry::{RetryPolicy, RetrySink};

/// Every hot-path persistence call goes through here.
#[derive(Clone)]
pub struct Store {
    repo: Arc<dyn Repository>,
    retry: RetryPolicy,
    ledger: RetryPolicy,
    sink: RetrySink,
}

impl Store {
    pub fn new(repo: Arc<dyn Repository>, cfg: &EngineConfig) -> Self {
        Self {
            repo,
            retry: RetryPolicy::storage(&cfg.retry),
            ledger: RetryPolicy::conflicts(&cfg.ledger),
            sink: Arc::new(|attempt: u32, err: &str| {
                debug!(attempt, error = err, "repository attempt failed");
            }),
        }
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run a repository operation on the blocking pool under the storage retry policy.
    pub async fn call<T, F>(&self, label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Repository) -> RepoResult<T> + Send + Sync + 'static,
    {
        self.call_with(&self.retry, label, op).await
    }

    /// Like [`Store::call`], but only write conflicts are retried.
    pub async fn call_on_conflict<T, F>(&self, label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Repository) -> RepoResult<T> + Send + Sync + 'static,
    {
        self.call_with(&self.ledger, label, op).await
    }

    async fn call_with<T, F>(&self, policy: &RetryPolicy, label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Repository) -> RepoResult<T> + Send + Sync + 'static,
    {
        let repo = Arc::clone(&self.repo);
        policy
            .run_async(move || op(repo.as_ref()), Some(&self.sink))
            .await
            .context(label)
    }

    pub async fn insert_task(&self, task: TaskRecord) -> Result<()> {
        self.call("insert task", move |repo| repo.insert_task(&task))
            .await
    }

    pub async fn insert_run(&self, run: RunRecord) -> Result<()> {
        self.call("insert run", move |repo| repo.insert_run(&run)).await
    }

    pub async fn get_run(&self, key: &RunKey) -> Result<Option<RunRecord>> {
        let key = key.clone();
        self.call("load run", move |repo| repo.get_run(&key.task_id, &key.run_id))
            .await
    }

    /// Load a run that must exist.
    pub async fn require_run(&self, key: &RunKey) -> Result<RunRecord> {
        self.get_run(key)
            .await?
            .with_context(|| format!("run {} not found", key.run_id))
    }

    pub async fn update_run(&self, run: RunRecord) -> Result<()> {
        self.call("update run", move |repo| repo.update_run(&run)).await
    }

    /// Mirror a status onto the task row; terminal statuses stamp completion once.
    pub async fn mirror_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let task_id = task_id.to_string();
        self.call("mirror task status", move |repo| {
            let Some(mut task) = repo.get_task(&task_id)? else {
                return Ok(());
            };
            let now = Utc::now();
            task.status = status;
            task.updated_at = now;
            match status {
                TaskStatus::Done | TaskStatus::Failed | TaskStatus::Stopped => {
                    task.finished_at.get_or_insert(now);
                }
                _ => task.finished_at = None,
            }
            repo.update_task(&task)
        })
        .await
    }

    pub async fn get_step(&self, key: &RunKey, order: u32) -> Result<Option<StepRecord>> {
        let key = key.clone();
        self.call("load step", move |repo| {
            repo.get_step(&key.task_id, &key.run_id, order)
        })
        .await
    }

    pub async fn upsert_step(&self, step: StepRecord) -> Result<()> {
        self.call("write step", move |repo| repo.upsert_step(&step))
            .await
    }

    pub async fn list_steps(&self, key: &RunKey) -> Result<Vec<StepRecord>> {
        let key = key.clone();
        self.call("list steps", move |repo| {
            repo.list_steps(&key.task_id, &key.run_id)
        })
        .await
    }

    /// Bring the ledger in line with `plan`: move rows to their item's order and
    /// mark failed rows of skipped items skipped. Safe to repeat.
    pub async fn realign_steps(&self, key: &RunKey, plan: &Plan) -> Result<LedgerRealignment> {
        let key = key.clone();
        let plan = plan.clone();
        self.call("realign ledger", move |repo| {
            let rows = repo.list_steps(&key.task_id, &key.run_id)?;
            let realignment = realign_ledger(&plan, &rows);
            for &(from, to) in &realignment.moves {
                repo.move_step(&key.task_id, &key.run_id, from, to)?;
            }
            for &order in &realignment.skipped {
                if let Some(mut row) = repo.get_step(&key.task_id, &key.run_id, order)? {
                    row.status = StepStatus::Skipped;
                    row.updated_at = Utc::now();
                    repo.upsert_step(&row)?;
                }
            }
            Ok(realignment)
        })
        .await
    }

    pub async fn append_output(
        &self,
        key: &RunKey,
        kind: OutputKind,
        step_order: Option<u32>,
        content: String,
    ) -> Result<()> {
        let record = OutputRecord {
            task_id: key.task_id.clone(),
            run_id: key.run_id.clone(),
            kind,
            step_order,
            content,
            created_at: Utc::now(),
        };
        self.call("append output", move |repo| repo.append_output(&record))
            .await
    }

    pub async fn list_outputs(&self, key: &RunKey) -> Result<Vec<OutputRecord>> {
        let key = key.clone();
        self.call("list outputs", move |repo| {
            repo.list_outputs(&key.task_id, &key.run_id)
        })
        .await
    }

    /// Record a diagnostic; failures are logged and swallowed.
    pub async fn debug(&self, key: &RunKey, step_order: Option<u32>, level: DebugLevel, msg: String) {
        let entry = DebugEntry {
            run_id: key.run_id.clone(),
            step_order,
            level,
            message: msg,
            created_at: Utc::now(),
        };
        let task_id = key.task_id.clone();
        if let Err(err) = self
            .call("append debug entry", move |repo| {
                repo.append_debug(&task_id, &entry)
            })
            .await
        {
            warn!(run_id = %key.run_id, error = %format!("{err:#}"), "debug entry dropped");
        }
    }

    pub async fn list_debug(&self, key: &RunKey) -> Result<Vec<DebugEntry>> {
        let key = key.clone();
        self.call("list debug entries", move |repo| {
            repo.list_debug(&key.task_id, &key.run_id)
        })
        .await
    }

    /// Insert a memory summary unless this run already has one. Returns whether it wrote.
    pub async fn insert_memory_once(&self, memory: MemoryRecord) -> Result<bool> {
        self.call("write memory", move |repo| {
            if repo.find_memory(&memory.task_id, &memory.run_id)?.is_some() {
                return Ok(false);
            }
            repo.insert_memory(&memory)?;
            Ok(true)
        })
        .await
    }
}
