//! Engine configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Reflection rounds allowed per run before a failure becomes terminal.
    pub max_reflection_rounds: u32,

    /// Upper bound on steps inserted by one reflection round (retry slot included).
    pub max_fix_steps: usize,

    /// Upper bound on plan length, for planning output and reflection growth.
    pub max_plan_steps: usize,

    /// Recent observations handed to reflection strategists.
    pub observation_window: usize,

    /// Truncate error text in failure summaries and error events beyond this many chars.
    pub error_excerpt_chars: usize,

    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub postprocess: PostprocessConfig,
    pub router: RouterConfig,
}

/// Checkpoint and repository retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `n * base_delay_ms`.
    pub base_delay_ms: u64,
}

/// Retry-on-conflict for ledger writes made while answering a paused step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub conflict_attempts: u32,
    pub conflict_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostprocessConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// Output budget for the classifier call.
    pub max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reflection_rounds: 2,
            max_fix_steps: 3,
            max_plan_steps: 20,
            observation_window: 8,
            error_excerpt_chars: 200,
            retry: RetryConfig::default(),
            ledger: LedgerConfig::default(),
            postprocess: PostprocessConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            conflict_attempts: 3,
            conflict_delay_ms: 50,
        }
    }
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 64,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl LedgerConfig {
    pub fn conflict_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_delay_ms)
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_fix_steps == 0 {
            return Err(anyhow!("max_fix_steps must be > 0"));
        }
        if self.max_plan_steps == 0 {
            return Err(anyhow!("max_plan_steps must be > 0"));
        }
        if self.error_excerpt_chars == 0 {
            return Err(anyhow!("error_excerpt_chars must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.ledger.conflict_attempts == 0 {
            return Err(anyhow!("ledger.conflict_attempts must be > 0"));
        }
        if self.postprocess.workers == 0 || self.postprocess.queue_capacity == 0 {
            return Err(anyhow!(
                "postprocess.workers and postprocess.queue_capacity must be > 0"
            ));
        }
        if self.router.max_output_tokens == 0 {
            return Err(anyhow!("router.max_output_tokens must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn to_toml(cfg: &EngineConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    write_atomic(path, &to_toml(cfg)?)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
