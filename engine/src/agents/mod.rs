//! Collaborator seams consumed by the orchestration core.
//!
//! Concrete action executors, model-backed strategists and the evaluator live
//! outside this crate. The engine only depends on these traits and on the
//! output contracts in [`planning`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{PlanItem, RunKey, RunMode};
use crate::io::postprocess::PostprocessJob;

pub mod planning;

/// What the executor sees of the run when performing one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub key: RunKey,
    /// 1-based order of the step in the current plan.
    pub order: u32,
    pub instruction: String,
    pub workdir: PathBuf,
    pub context: BTreeMap<String, Value>,
    pub observations: Vec<String>,
}

/// A step asking the user something before it can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    pub question: String,
    /// Explicit choices; empty lets the engine infer defaults.
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub result: Value,
    pub observation: String,
    pub error: Option<String>,
    pub input_request: Option<InputRequest>,
    /// Human-readable text for steps allowed to produce the run's output.
    pub output_text: Option<String>,
}

impl StepOutput {
    pub fn ok(result: Value, observation: impl Into<String>) -> Self {
        Self {
            result,
            observation: observation.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            observation: format!("error: {error}"),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn ask(question: impl Into<String>, choices: Vec<String>) -> Self {
        Self {
            input_request: Some(InputRequest {
                question: question.into(),
                choices,
            }),
            ..Self::default()
        }
    }
}

/// Performs one step. Must be safe to call again for the same step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &PlanItem, ctx: &StepContext) -> Result<StepOutput>;
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub instruction: String,
    pub mode: RunMode,
    pub hints: Vec<String>,
    pub max_steps: usize,
}

/// One planning strategist; returns raw JSON matching `plan.schema.json`.
#[async_trait]
pub trait Planner: Send + Sync {
    fn label(&self) -> &str;
    async fn plan(&self, req: &PlanRequest) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct ReflectionRequest {
    pub instruction: String,
    pub failed: PlanItem,
    pub failed_order: u32,
    pub error: String,
    pub observations: Vec<String>,
    pub completed: Vec<u32>,
    pub round: u32,
}

/// One reflection strategist; returns raw JSON matching `fix_steps.schema.json`.
#[async_trait]
pub trait Reflector: Send + Sync {
    fn label(&self) -> &str;
    async fn propose_fix(&self, req: &ReflectionRequest) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    pub message: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Model-backed mode classifier. Returns the raw response text.
pub trait Classifier: Send + Sync {
    fn classify(&self, req: &ClassifyRequest) -> Result<String>;
}

/// Supplies context hints to planning.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, instruction: &str) -> Result<Vec<String>>;
}

/// Review pass run after the user confirms satisfaction.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn review(&self, key: &RunKey, answer: Option<&str>) -> Result<String>;
}

#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn postprocess(&self, job: &PostprocessJob) -> Result<()>;
}

/// Every collaborator a run needs; optional ones degrade gracefully.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn StepExecutor>,
    pub planners: Vec<Arc<dyn Planner>>,
    pub reflectors: Vec<Arc<dyn Reflector>>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub retriever: Option<Arc<dyn ContextRetriever>>,
    pub evaluator: Option<Arc<dyn Evaluator>>,
    pub postprocessor: Option<Arc<dyn Postprocessor>>,
}

impl Collaborators {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            planners: Vec::new(),
            reflectors: Vec::new(),
            classifier: None,
            retriever: None,
            evaluator: None,
            postprocessor: None,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planners.push(planner);
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflectors.push(reflector);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = Some(postprocessor);
        self
    }
}
