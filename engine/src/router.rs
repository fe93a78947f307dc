//! Classify a free-text message into chat, do or think.
//!
//! The classifier is asked first. Any failure, empty answer or out-of-enum mode
//! falls back to [`classify_heuristic`], and the reason records why the primary
//! path was abandoned.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::{ClassifyRequest, Classifier};
use crate::core::classifier::{Mode, classify_heuristic};
use crate::core::sanitize::sanitize_error;
use crate::io::config::RouterConfig;

/// Confidence reported when the classifier gives a mode but no score.
const CLASSIFIER_DEFAULT_CONFIDENCE: f32 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub mode: Mode,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Deserialize)]
struct ClassifierReply {
    mode: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reason: Option<String>,
}

pub fn route(message: &str, classifier: Option<&dyn Classifier>, cfg: &RouterConfig) -> RouteDecision {
    let abandoned = match classifier {
        None => "no classifier configured".to_string(),
        Some(classifier) => {
            let req = ClassifyRequest {
                message: message.to_string(),
                temperature: 0.0,
                max_output_tokens: cfg.max_output_tokens,
            };
            match classifier.classify(&req) {
                Ok(raw) => match parse_reply(&raw) {
                    Ok(decision) => {
                        debug!(mode = ?decision.mode, "classifier routed message");
                        return decision;
                    }
                    Err(why) => why,
                },
                Err(err) => {
                    let why = format!("classifier failed: {}", sanitize_error(&format!("{err:#}"), 120));
                    warn!(reason = %why, "falling back to heuristic routing");
                    why
                }
            }
        }
    };

    let heuristic = classify_heuristic(message);
    RouteDecision {
        mode: heuristic.mode,
        confidence: heuristic.confidence,
        reason: format!("{abandoned}; {}", heuristic.rule),
    }
}

/// Accepts `{"mode": .., "confidence": .., "reason": ..}` or a bare mode word.
fn parse_reply(raw: &str) -> Result<RouteDecision, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("classifier returned empty response".to_string());
    }

    let (mode_raw, confidence, reason) = if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|err| format!("classifier returned invalid json: {err}"))?;
        let reply: ClassifierReply = serde_json::from_value(value)
            .map_err(|err| format!("classifier returned unexpected shape: {err}"))?;
        (reply.mode, reply.confidence, reply.reason)
    } else {
        let word = trimmed.trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
        (word.to_string(), None, None)
    };

    let Some(mode) = Mode::parse(&mode_raw) else {
        return Err(format!("classifier returned out-of-enum mode '{mode_raw}'"));
    };
    let confidence = confidence
        .filter(|c| c.is_finite())
        .map_or(CLASSIFIER_DEFAULT_CONFIDENCE, |c| c.clamp(0.0, 1.0));
    let reason = match reason {
        Some(r) if !r.trim().is_empty() => format!("classifier: {}", r.trim()),
        _ => "classifier".to_string(),
    };
    Ok(RouteDecision {
        mode,
        confidence,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedClassifier;

    fn cfg() -> RouterConfig {
        RouterConfig::default()
    }

    #[test]
    fn classifier_outage_never_downgrades_external_task_to_chat() {
        let classifier = ScriptedClassifier::failing("connection refused");
        let got = route("请抓取 https://example.com 的最新价格", Some(&classifier), &cfg());
        assert_eq!(got.mode, Mode::Do);
        assert!((got.confidence - 0.62).abs() < f32::EPSILON);
        assert!(got.reason.contains("heuristic:url_or_external_task"));
        assert!(got.reason.starts_with("classifier failed"));
    }

    #[test]
    fn classifier_request_uses_zero_temperature_and_budget() {
        let classifier = ScriptedClassifier::replying("think");
        let got = route("compare two designs", Some(&classifier), &cfg());
        assert_eq!(got.mode, Mode::Think);
        let req = classifier.last_request().expect("request");
        assert_eq!(req.temperature, 0.0);
        assert_eq!(req.max_output_tokens, 64);
    }

    #[test]
    fn json_reply_carries_confidence_and_reason() {
        let classifier =
            ScriptedClassifier::replying(r#"{"mode":"do","confidence":0.93,"reason":"needs fetching"}"#);
        let got = route("get me the price", Some(&classifier), &cfg());
        assert_eq!(got.mode, Mode::Do);
        assert!((got.confidence - 0.93).abs() < f32::EPSILON);
        assert_eq!(got.reason, "classifier: needs fetching");
    }

    #[test]
    fn empty_and_out_of_enum_replies_fall_back() {
        let empty = ScriptedClassifier::replying("   ");
        let got = route("hello", Some(&empty), &cfg());
        assert_eq!(got.mode, Mode::Chat);
        assert_eq!(got.reason, "classifier returned empty response; heuristic:default_chat");

        let odd = ScriptedClassifier::replying("plan");
        let got = route("design an api gateway", Some(&odd), &cfg());
        assert!(got.reason.contains("out-of-enum mode 'plan'"));
        assert_eq!(got.mode, Mode::Do);
    }

    #[test]
    fn no_classifier_uses_heuristic_with_reason() {
        let got = route("帮我设计一个缓存架构", None, &cfg());
        assert_eq!(got.mode, Mode::Think);
        assert_eq!(got.reason, "no classifier configured; heuristic:design_or_analysis");
    }
}
