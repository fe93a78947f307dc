//! Default answer choices and suspend reasons for input requests.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{StepKind, SuspendReason};

static CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(是否|确认|可以吗|好吗|对吗|满意|同意|继续吗|\(y/n\)|\by/n\b|\bconfirm\b|\bproceed\b|\bsatisf|\bis (this|that|it) (ok|okay|correct|fine)\b|\b(shall|should) (i|we) continue\b)",
    )
    .expect("valid confirmation regex")
});

static SATISFACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(满意|satisf)").expect("valid satisfaction regex"));

static CJK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Han}").expect("valid han regex"));

/// Choices offered with a question.
///
/// Explicit payload choices win. Otherwise a yes/no pair is offered when the
/// question reads like a confirmation or the step is a feedback or knowledge
/// sufficiency check; the pair follows the question's script. Open questions get
/// no default.
pub fn default_choices(question: &str, explicit: &[String], kind: StepKind) -> Vec<String> {
    let explicit: Vec<String> = explicit
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }
    let yes_no = matches!(kind, StepKind::Feedback | StepKind::KnowledgeSufficiency)
        || CONFIRMATION.is_match(question);
    if !yes_no {
        return Vec::new();
    }
    if CJK.is_match(question) {
        vec!["是".to_string(), "否".to_string()]
    } else {
        vec!["yes".to_string(), "no".to_string()]
    }
}

/// Classify why a step suspended.
pub fn suspend_reason(question: &str, kind: StepKind) -> SuspendReason {
    if kind == StepKind::Feedback || SATISFACTION.is_match(question) {
        SuspendReason::ConfirmSatisfaction
    } else {
        SuspendReason::NeedInput
    }
}
