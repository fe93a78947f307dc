//! Retryable durable snapshot of run status, plan and state.
//!
//! A checkpoint never raises: exhausting the retry policy yields the terminal
//! error text so callers can degrade it to a warning.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::types::{AgentState, Plan, RunKey, RunRecord, RunStatus};
use crate::io::repository::{RepoError, Repository};
use crate::io::retry::{RetryPolicy, RetrySink};
use crate::io::store::Store;

/// What one checkpoint writes.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub key: RunKey,
    pub state: AgentState,
    pub plan: Option<Plan>,
    pub status: Option<RunStatus>,
    /// Explicitly null the completion time (resuming a stopped or failed run).
    pub clear_finished_at: bool,
    /// Recorded run error; a checkpoint that sets status running clears it.
    pub error: Option<String>,
    /// Full warning list; left alone when empty.
    pub warnings: Vec<String>,
}

impl Checkpoint {
    pub fn new(key: RunKey, state: AgentState) -> Self {
        Self {
            key,
            state,
            plan: None,
            status: None,
            clear_finished_at: false,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn clearing_finished_at(mut self) -> Self {
        self.clear_finished_at = true;
        self
    }

    /// Apply onto a loaded run record.
    pub fn apply(&self, run: &mut RunRecord, now: DateTime<Utc>) {
        run.state = self.state.clone();
        if let Some(plan) = &self.plan {
            run.plan = Some(plan.clone());
        }
        if let Some(status) = self.status {
            run.status = status;
            if status == RunStatus::Running {
                run.error = None;
            }
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        if !self.warnings.is_empty() {
            run.warnings = self.warnings.clone();
        }
        if self.clear_finished_at {
            run.finished_at = None;
        } else if run.status.is_terminal() {
            run.finished_at.get_or_insert(now);
        }
        run.updated_at = now;
    }
}

fn write_once(repo: &dyn Repository, cp: &Checkpoint) -> Result<(), RepoError> {
    let mut run = repo
        .get_run(&cp.key.task_id, &cp.key.run_id)?
        .ok_or_else(|| RepoError::NotFound(format!("run {}", cp.key.run_id)))?;
    cp.apply(&mut run, Utc::now());
    repo.update_run(&run)
}

/// Blocking checkpoint on the current thread.
pub fn persist_blocking(
    repo: &dyn Repository,
    policy: &RetryPolicy,
    cp: &Checkpoint,
    sink: Option<&RetrySink>,
) -> Result<(), String> {
    match policy.run_blocking(|| write_once(repo, cp), sink) {
        Ok(()) => {
            debug!(run_id = %cp.key.run_id, status = ?cp.status, "checkpoint written");
            Ok(())
        }
        Err(err) => {
            warn!(run_id = %cp.key.run_id, error = %err, "checkpoint failed");
            Err(err.to_string())
        }
    }
}

impl Store {
    /// Checkpoint with each attempt dispatched to the blocking pool.
    pub async fn persist(&self, cp: Checkpoint, sink: Option<&RetrySink>) -> Result<(), String> {
        let repo = std::sync::Arc::clone(self.repo());
        let run_id = cp.key.run_id.clone();
        let status = cp.status;
        let outcome = self
            .retry_policy()
            .run_async(move || write_once(repo.as_ref(), &cp), sink)
            .await;
        match outcome {
            Ok(()) => {
                debug!(run_id = %run_id, ?status, "checkpoint written");
                Ok(())
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "checkpoint failed");
                Err(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunMode;
    use crate::io::config::EngineConfig;
    use crate::test_support::{MemoryRepository, run_record};
    use std::sync::Arc;
    use std::sync::Mutex;

    fn store_with(repo: Arc<MemoryRepository>) -> Store {
        let mut cfg = EngineConfig::default();
        cfg.retry.base_delay_ms = 1;
        Store::new(repo, &cfg)
    }

    #[tokio::test]
    async fn terminal_status_stamps_finished_at_once() {
        let repo = Arc::new(MemoryRepository::default());
        let run = run_record("t1", "r1");
        repo.insert_run(&run).expect("insert");
        let store = store_with(Arc::clone(&repo));

        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do)).with_status(RunStatus::Done);
        store.persist(cp.clone(), None).await.expect("persist");
        let first = repo.get_run("t1", "r1").expect("get").expect("run").finished_at;
        assert!(first.is_some());

        store.persist(cp, None).await.expect("persist again");
        let second = repo.get_run("t1", "r1").expect("get").expect("run").finished_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn waiting_leaves_finished_at_unset_and_clear_nulls_it() {
        let repo = Arc::new(MemoryRepository::default());
        let mut run = run_record("t1", "r1");
        run.status = RunStatus::Stopped;
        run.finished_at = Some(Utc::now());
        repo.insert_run(&run).expect("insert");
        let store = store_with(Arc::clone(&repo));

        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do))
            .with_status(RunStatus::Running)
            .clearing_finished_at();
        store.persist(cp, None).await.expect("persist");
        let loaded = repo.get_run("t1", "r1").expect("get").expect("run");
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.finished_at.is_none());

        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do)).with_status(RunStatus::Waiting);
        store.persist(cp, None).await.expect("persist");
        let loaded = repo.get_run("t1", "r1").expect("get").expect("run");
        assert!(loaded.finished_at.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_reported_to_the_sink() {
        let repo = Arc::new(MemoryRepository::default());
        let run = run_record("t1", "r1");
        repo.insert_run(&run).expect("insert");
        repo.fail_next_run_updates(2);
        let store = store_with(Arc::clone(&repo));
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);
        let sink: RetrySink = Arc::new(move |attempt: u32, _err: &str| {
            seen.lock().expect("lock").push(attempt);
        });

        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do));
        store.persist(cp, Some(&sink)).await.expect("persist");
        assert_eq!(*attempts.lock().expect("lock"), vec![1, 2]);
    }

    #[tokio::test]
    async fn exhausted_retries_return_error_text_instead_of_raising() {
        let repo = Arc::new(MemoryRepository::default());
        let run = run_record("t1", "r1");
        repo.insert_run(&run).expect("insert");
        repo.fail_next_run_updates(10);
        let store = store_with(Arc::clone(&repo));

        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do));
        let err = store.persist(cp, None).await.expect_err("exhausted");
        assert!(err.contains("unavailable"));
    }

    #[test]
    fn blocking_variant_shares_the_policy() {
        let repo = MemoryRepository::default();
        let run = run_record("t1", "r1");
        repo.insert_run(&run).expect("insert");
        repo.fail_next_run_updates(1);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            retryable: RepoError::is_retryable,
        };
        let cp = Checkpoint::new(run.key(), AgentState::new(RunMode::Do)).with_status(RunStatus::Failed);
        persist_blocking(&repo, &policy, &cp, None).expect("persist");
        assert_eq!(
            repo.get_run("t1", "r1").expect("get").expect("run").status,
            RunStatus::Failed
        );
    }
}
