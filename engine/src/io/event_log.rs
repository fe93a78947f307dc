//! Per-session event log with monotonic sequence ids, for reconnect and replay.
//!
//! Sessions live in memory; with a directory configured each session is also
//! appended to `<dir>/<session>.jsonl` and reloaded on first use.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::RunEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: RunEvent,
}

pub struct EventLog {
    dir: Option<PathBuf>,
    sessions: Mutex<HashMap<String, Vec<LoggedEvent>>>,
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, session: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{session}.jsonl")))
    }

    /// Record an event and return its sequence id (starting at 1).
    pub fn record(&self, session: &str, event: &RunEvent) -> Result<u64> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        let entries = self.load_into(&mut sessions, session)?;
        let seq = entries.last().map_or(1, |last| last.seq + 1);
        let logged = LoggedEvent {
            seq,
            recorded_at: Utc::now(),
            event: event.clone(),
        };
        if let Some(path) = self.session_path(session) {
            append_line(&path, &logged)?;
        }
        entries.push(logged);
        Ok(seq)
    }

    /// Events of `session` with a sequence id greater than `after_seq`.
    pub fn replay(&self, session: &str, after_seq: u64) -> Result<Vec<LoggedEvent>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        let entries = self.load_into(&mut sessions, session)?;
        Ok(entries
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect())
    }

    fn load_into<'a>(
        &self,
        sessions: &'a mut HashMap<String, Vec<LoggedEvent>>,
        session: &str,
    ) -> Result<&'a mut Vec<LoggedEvent>> {
        if !sessions.contains_key(session) {
            let loaded = match self.session_path(session) {
                Some(path) => read_session(&path)?,
                None => Vec::new(),
            };
            sessions.insert(session.to_string(), loaded);
        }
        sessions
            .get_mut(session)
            .ok_or_else(|| anyhow!("session {session} missing after load"))
    }
}

fn read_session(path: &Path) -> Result<Vec<LoggedEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| format!("parse event in {}", path.display()))
        })
        .collect()
}

fn append_line(path: &Path, logged: &LoggedEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let line = serde_json::to_string(logged).context("serialize event")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))
}
