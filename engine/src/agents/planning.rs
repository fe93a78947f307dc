//! Output contracts of the planning and reflection strategists.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ActionKind, ItemStatus, Plan, PlanItem, StepKind};

pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
pub const FIX_STEPS_SCHEMA: &str = include_str!("../../schemas/fix_steps.schema.json");

/// One step as a strategist proposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub brief: String,
    pub allow: Vec<ActionKind>,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl ProposedStep {
    pub fn into_item(self, fallback_id: String) -> PlanItem {
        PlanItem {
            id: self.id.unwrap_or(fallback_id),
            title: self.title,
            brief: self.brief,
            allow: self.allow,
            kind: self.kind,
            reads: self.reads,
            writes: self.writes,
            depends_on: self.depends_on,
            status: ItemStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProposal {
    pub items: Vec<ProposedStep>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl PlanProposal {
    /// Build a plan capped at `max_steps`, giving every step a unique id.
    pub fn into_plan(self, max_steps: usize) -> Plan {
        let mut seen = HashSet::new();
        let items = self
            .items
            .into_iter()
            .take(max_steps)
            .enumerate()
            .map(|(idx, step)| {
                let mut item = step.into_item(format!("s{}", idx + 1));
                if !seen.insert(item.id.clone()) {
                    item.id = format!("{}-{}", item.id, idx + 1);
                    seen.insert(item.id.clone());
                }
                item
            })
            .collect();
        Plan {
            items,
            artifacts: self.artifacts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    pub steps: Vec<ProposedStep>,
}

pub fn parse_plan_proposal(raw: &Value) -> Result<PlanProposal> {
    validate_schema(raw, PLAN_SCHEMA).context("planner output")?;
    serde_json::from_value(raw.clone()).context("decode planner output")
}

pub fn parse_fix_proposal(raw: &Value) -> Result<FixProposal> {
    validate_schema(raw, FIX_STEPS_SCHEMA).context("reflection output")?;
    serde_json::from_value(raw.clone()).context("decode reflection output")
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_raw: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile json schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
