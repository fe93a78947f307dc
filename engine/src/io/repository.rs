//! Persistence repository for tasks, runs, the step ledger and run outputs.
//!
//! The [`Repository`] trait is blocking and assumes last-writer-wins semantics;
//! callers in async code reach it through [`crate::io::store::Store`], which
//! dispatches every call to the blocking pool under one retry policy.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::types::{
    DebugEntry, MemoryRecord, OutputRecord, RunRecord, StepRecord, TaskRecord,
};

/// Errors surfaced by a repository backend.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("write conflict on {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RepoError {
    /// Transient errors worth retrying locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Unavailable(_) | Self::Io { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Run/step/output CRUD keyed by task and run (and step order for the ledger).
pub trait Repository: Send + Sync {
    fn insert_task(&self, task: &TaskRecord) -> RepoResult<()>;
    fn get_task(&self, task_id: &str) -> RepoResult<Option<TaskRecord>>;
    fn update_task(&self, task: &TaskRecord) -> RepoResult<()>;

    fn insert_run(&self, run: &RunRecord) -> RepoResult<()>;
    fn get_run(&self, task_id: &str, run_id: &str) -> RepoResult<Option<RunRecord>>;
    fn update_run(&self, run: &RunRecord) -> RepoResult<()>;
    fn list_runs(&self, task_id: &str) -> RepoResult<Vec<RunRecord>>;

    fn get_step(&self, task_id: &str, run_id: &str, order: u32) -> RepoResult<Option<StepRecord>>;
    fn upsert_step(&self, step: &StepRecord) -> RepoResult<()>;
    /// Ledger rows ordered by step order.
    fn list_steps(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<StepRecord>>;
    /// Move the row at `from` to `to`. A missing `from` row is a no-op.
    fn move_step(&self, task_id: &str, run_id: &str, from: u32, to: u32) -> RepoResult<()>;

    fn append_output(&self, output: &OutputRecord) -> RepoResult<()>;
    fn list_outputs(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<OutputRecord>>;

    fn append_debug(&self, task_id: &str, entry: &DebugEntry) -> RepoResult<()>;
    fn list_debug(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<DebugEntry>>;

    fn find_memory(&self, task_id: &str, run_id: &str) -> RepoResult<Option<MemoryRecord>>;
    fn insert_memory(&self, memory: &MemoryRecord) -> RepoResult<()>;

    /// The running or waiting run of a task, if any.
    fn active_run(&self, task_id: &str) -> RepoResult<Option<RunRecord>> {
        Ok(self
            .list_runs(task_id)?
            .into_iter()
            .find(|run| run.status.is_active()))
    }
}

/// JSON documents under a root directory.
///
/// Layout: `<root>/tasks/<task>/task.json`, `.../runs/<run>/run.json`,
/// `.../runs/<run>/steps/<order>.json`, `outputs.jsonl`, `debug.jsonl`, `memory.json`.
pub struct FileRepository {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl FileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_lock: Mutex::new(()),
        }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    fn run_dir(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.task_dir(task_id).join("runs").join(run_id)
    }

    fn step_path(&self, task_id: &str, run_id: &str, order: u32) -> PathBuf {
        self.run_dir(task_id, run_id)
            .join("steps")
            .join(format!("{order:05}.json"))
    }

    fn append_jsonl<T: Serialize>(&self, path: &Path, value: &T) -> RepoResult<()> {
        let line = serde_json::to_string(value).map_err(|source| RepoError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        // Appends from one process are serialized so lines never interleave.
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| RepoError::Conflict(path.display().to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| io_err(path, source))?;
        writeln!(file, "{line}").map_err(|source| io_err(path, source))
    }
}

impl Repository for FileRepository {
    fn insert_task(&self, task: &TaskRecord) -> RepoResult<()> {
        write_json(&self.task_dir(&task.task_id).join("task.json"), task)
    }

    fn get_task(&self, task_id: &str) -> RepoResult<Option<TaskRecord>> {
        read_json(&self.task_dir(task_id).join("task.json"))
    }

    fn update_task(&self, task: &TaskRecord) -> RepoResult<()> {
        write_json(&self.task_dir(&task.task_id).join("task.json"), task)
    }

    fn insert_run(&self, run: &RunRecord) -> RepoResult<()> {
        write_json(&self.run_dir(&run.task_id, &run.run_id).join("run.json"), run)
    }

    fn get_run(&self, task_id: &str, run_id: &str) -> RepoResult<Option<RunRecord>> {
        read_json(&self.run_dir(task_id, run_id).join("run.json"))
    }

    fn update_run(&self, run: &RunRecord) -> RepoResult<()> {
        write_json(&self.run_dir(&run.task_id, &run.run_id).join("run.json"), run)
    }

    fn list_runs(&self, task_id: &str) -> RepoResult<Vec<RunRecord>> {
        let dir = self.task_dir(task_id).join("runs");
        let mut runs = Vec::new();
        for entry in list_dir(&dir)? {
            if let Some(run) = read_json::<RunRecord>(&entry.join("run.json"))? {
                runs.push(run);
            }
        }
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    fn get_step(&self, task_id: &str, run_id: &str, order: u32) -> RepoResult<Option<StepRecord>> {
        read_json(&self.step_path(task_id, run_id, order))
    }

    fn upsert_step(&self, step: &StepRecord) -> RepoResult<()> {
        write_json(
            &self.step_path(&step.task_id, &step.run_id, step.step_order),
            step,
        )
    }

    fn list_steps(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<StepRecord>> {
        let dir = self.run_dir(task_id, run_id).join("steps");
        let mut steps = Vec::new();
        for path in list_dir(&dir)? {
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(step) = read_json::<StepRecord>(&path)?
            {
                steps.push(step);
            }
        }
        steps.sort_by_key(|step| step.step_order);
        Ok(steps)
    }

    fn move_step(&self, task_id: &str, run_id: &str, from: u32, to: u32) -> RepoResult<()> {
        if from == to {
            return Ok(());
        }
        let old = self.step_path(task_id, run_id, from);
        let Some(mut step) = read_json::<StepRecord>(&old)? else {
            return Ok(());
        };
        step.step_order = to;
        write_json(&self.step_path(task_id, run_id, to), &step)?;
        fs::remove_file(&old).map_err(|source| io_err(&old, source))?;
        debug!(run_id, from, to, "moved ledger row");
        Ok(())
    }

    fn append_output(&self, output: &OutputRecord) -> RepoResult<()> {
        let path = self
            .run_dir(&output.task_id, &output.run_id)
            .join("outputs.jsonl");
        self.append_jsonl(&path, output)
    }

    fn list_outputs(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<OutputRecord>> {
        read_jsonl(&self.run_dir(task_id, run_id).join("outputs.jsonl"))
    }

    fn append_debug(&self, task_id: &str, entry: &DebugEntry) -> RepoResult<()> {
        let path = self.run_dir(task_id, &entry.run_id).join("debug.jsonl");
        self.append_jsonl(&path, entry)
    }

    fn list_debug(&self, task_id: &str, run_id: &str) -> RepoResult<Vec<DebugEntry>> {
        read_jsonl(&self.run_dir(task_id, run_id).join("debug.jsonl"))
    }

    fn find_memory(&self, task_id: &str, run_id: &str) -> RepoResult<Option<MemoryRecord>> {
        read_json(&self.run_dir(task_id, run_id).join("memory.json"))
    }

    fn insert_memory(&self, memory: &MemoryRecord) -> RepoResult<()> {
        write_json(
            &self
                .run_dir(&memory.task_id, &memory.run_id)
                .join("memory.json"),
            memory,
        )
    }
}

fn io_err(path: &Path, source: std::io::Error) -> RepoError {
    RepoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn list_dir(dir: &Path) -> RepoResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(|source| io_err(dir, source))? {
        let entry = entry.map_err(|source| io_err(dir, source))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> RepoResult<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_err(path, source)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| RepoError::Serialize {
            path: path.to_path_buf(),
            source,
        })
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> RepoResult<Vec<T>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_err(path, source)),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| io_err(path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|source| RepoError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        out.push(value);
    }
    Ok(out)
}

/// Atomically write pretty JSON (temp file + rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> RepoResult<()> {
    let mut buf = serde_json::to_string_pretty(value).map_err(|source| RepoError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    buf.push('\n');
    let parent = path
        .parent()
        .ok_or_else(|| RepoError::NotFound(format!("parent of {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).map_err(|source| io_err(&tmp_path, source))?;
    fs::rename(&tmp_path, path).map_err(|source| io_err(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutputKind, RunStatus, StepStatus};
    use crate::test_support::{run_record, step_record, task_record};
    use chrono::Utc;

    #[test]
    fn task_and_run_round_trip_and_active_lookup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = FileRepository::new(temp.path());
        let task = task_record("t1");
        repo.insert_task(&task).expect("insert task");
        let mut run = run_record("t1", "r1");
        repo.insert_run(&run).expect("insert run");

        assert_eq!(repo.get_task("t1").expect("get"), Some(task));
        assert_eq!(repo.get_run("t1", "r1").expect("get").as_ref(), Some(&run));
        assert!(repo.active_run("t1").expect("active").is_some());

        run.status = RunStatus::Done;
        repo.update_run(&run).expect("update");
        assert!(repo.active_run("t1").expect("active").is_none());
        assert!(repo.get_run("t1", "missing").expect("get").is_none());
    }

    #[test]
    fn move_step_relocates_a_row_and_tolerates_a_repeat() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = FileRepository::new(temp.path());
        for order in 1..=3 {
            repo.upsert_step(&step_record(order, StepStatus::Done, None))
                .expect("upsert");
        }

        repo.move_step("t1", "r1", 3, 5).expect("move");
        repo.move_step("t1", "r1", 3, 5).expect("repeat");

        let steps = repo.list_steps("t1", "r1").expect("list");
        let orders: Vec<(u32, String)> = steps
            .iter()
            .map(|s| (s.step_order, s.step_id.clone()))
            .collect();
        assert_eq!(
            orders,
            vec![
                (1, "s1".to_string()),
                (2, "s2".to_string()),
                (5, "s3".to_string()),
            ]
        );
    }

    #[test]
    fn outputs_append_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = FileRepository::new(temp.path());
        for content in ["first", "second"] {
            repo.append_output(&OutputRecord {
                task_id: "t1".to_string(),
                run_id: "r1".to_string(),
                kind: OutputKind::Text,
                step_order: None,
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .expect("append");
        }
        let outputs = repo.list_outputs("t1", "r1").expect("list");
        let contents: Vec<&str> = outputs.iter().map(|o| o.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn io_errors_are_retryable_but_not_found_is_not() {
        let io = RepoError::Io {
            path: PathBuf::from("x"),
            source: std::io::Error::other("disk"),
        };
        assert!(io.is_retryable());
        assert!(RepoError::Conflict("step".to_string()).is_retryable());
        assert!(!RepoError::NotFound("run".to_string()).is_retryable());
    }
}
