//! Human-readable text for failed runs that produced no output.

use crate::core::types::{DebugEntry, DebugLevel, StepRecord, StepStatus};

/// Synthesize a failure report from the ledger and matching debug entries.
///
/// Lists every failed step as `step#<order>` with a truncated error, then any
/// warn/error debug entries tied to those steps or to the run as a whole.
pub fn synthesize_failure_output(
    run_error: Option<&str>,
    steps: &[StepRecord],
    debug: &[DebugEntry],
    excerpt_chars: usize,
) -> String {
    let mut failed: Vec<&StepRecord> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .collect();
    failed.sort_by_key(|s| s.step_order);

    let mut buf = String::from("Run failed.\n");
    if let Some(err) = run_error {
        buf.push_str(&format!("reason: {}\n", truncate_chars(err, excerpt_chars)));
    }
    if failed.is_empty() {
        buf.push_str("\nno step recorded a failure.\n");
    } else {
        buf.push_str("\nfailed steps:\n");
        for step in &failed {
            let err = step.error.as_deref().unwrap_or("unknown error");
            buf.push_str(&format!(
                "- step#{} {}: {}\n",
                step.step_order,
                step.title,
                truncate_chars(err, excerpt_chars)
            ));
        }
    }

    let related: Vec<&DebugEntry> = debug
        .iter()
        .filter(|d| matches!(d.level, DebugLevel::Warn | DebugLevel::Error))
        .filter(|d| match d.step_order {
            Some(order) => failed.iter().any(|s| s.step_order == order),
            None => true,
        })
        .collect();
    if !related.is_empty() {
        buf.push_str("\ndiagnostics:\n");
        for entry in related {
            let prefix = entry
                .step_order
                .map(|o| format!("step#{o} "))
                .unwrap_or_default();
            buf.push_str(&format!(
                "- {prefix}{}\n",
                truncate_chars(&entry.message, excerpt_chars)
            ));
        }
    }
    buf
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{debug_entry, step_record};

    #[test]
    fn lists_failed_steps_with_errors() {
        let steps = vec![
            step_record(1, StepStatus::Done, None),
            step_record(2, StepStatus::Failed, Some("boom")),
        ];
        let text = synthesize_failure_output(None, &steps, &[], 200);
        assert!(text.contains("step#2"));
        assert!(text.contains("boom"));
        assert!(!text.contains("step#1"));
    }

    #[test]
    fn includes_only_matching_diagnostics() {
        let steps = vec![step_record(2, StepStatus::Failed, Some("boom"))];
        let debug = vec![
            debug_entry(Some(2), DebugLevel::Error, "executor raised"),
            debug_entry(Some(1), DebugLevel::Error, "unrelated step"),
            debug_entry(None, DebugLevel::Warn, "checkpoint retry exhausted"),
            debug_entry(Some(2), DebugLevel::Info, "noise"),
        ];
        let text = synthesize_failure_output(Some("step failed"), &steps, &debug, 200);
        assert!(text.contains("step#2 executor raised"));
        assert!(text.contains("checkpoint retry exhausted"));
        assert!(!text.contains("unrelated step"));
        assert!(!text.contains("noise"));
    }

    #[test]
    fn truncates_long_errors_on_char_boundaries() {
        assert_eq!(truncate_chars("错误错误错误", 2), "错误…");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
