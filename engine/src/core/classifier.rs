//! Deterministic fallback classification of free text into a run mode.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Conversation mode chosen for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Chat,
    Do,
    Think,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "do" => Some(Self::Do),
            "think" => Some(Self::Think),
            _ => None,
        }
    }
}

/// Heuristic verdict: mode, confidence and the rule that fired.
#[derive(Debug, Clone, PartialEq)]
pub struct Heuristic {
    pub mode: Mode,
    pub confidence: f32,
    pub rule: &'static str,
}

pub const RULE_EXTERNAL_TASK: &str = "heuristic:url_or_external_task";
pub const RULE_DESIGN: &str = "heuristic:design_or_analysis";
pub const RULE_DEFAULT_CHAT: &str = "heuristic:default_chat";

static URL_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://|\bwww\.|\b[a-z0-9-]+\.(com|org|net|io|cn|dev|ai)\b)")
        .expect("valid url regex")
});

static TASK_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bfetch|\bcrawl|\bscrape|\bsearch|\bdownload|\bprice|\bweather|\bapi\b|\bstock|抓取|爬取|爬虫|搜索|查询|下载|价格|天气|股价|接口)",
    )
    .expect("valid task regex")
});

static DESIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bdesign|\banaly[sz]|\barchitect|\bcompare|\bevaluat|\btrade-?offs?\b|\bstrategy|\broadmap|设计|分析|架构|方案|对比|评估|规划|调研)",
    )
    .expect("valid design regex")
});

/// Classify without a model: external tasks first, then design work, else chat.
pub fn classify_heuristic(message: &str) -> Heuristic {
    if URL_LIKE.is_match(message) || TASK_ACTION.is_match(message) {
        return Heuristic {
            mode: Mode::Do,
            confidence: 0.62,
            rule: RULE_EXTERNAL_TASK,
        };
    }
    if DESIGN.is_match(message) {
        return Heuristic {
            mode: Mode::Think,
            confidence: 0.58,
            rule: RULE_DESIGN,
        };
    }
    Heuristic {
        mode: Mode::Chat,
        confidence: 0.40,
        rule: RULE_DEFAULT_CHAT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_external_task() {
        let h = classify_heuristic("请抓取 https://example.com 的最新价格");
        assert_eq!(h.mode, Mode::Do);
        assert_eq!(h.rule, RULE_EXTERNAL_TASK);
        assert!((h.confidence - 0.62).abs() < f32::EPSILON);
    }

    #[test]
    fn task_keywords_without_url_are_external_task() {
        assert_eq!(classify_heuristic("what's the weather in Oslo").mode, Mode::Do);
        assert_eq!(classify_heuristic("查询一下明天的天气").mode, Mode::Do);
    }

    #[test]
    fn design_keywords_are_think() {
        let h = classify_heuristic("帮我设计一个缓存架构");
        assert_eq!(h.mode, Mode::Think);
        assert_eq!(h.rule, RULE_DESIGN);
    }

    #[test]
    fn everything_else_is_chat() {
        let h = classify_heuristic("hello there");
        assert_eq!(h.mode, Mode::Chat);
        assert!((h.confidence - 0.40).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_rejects_out_of_enum_modes() {
        assert_eq!(Mode::parse(" Think "), Some(Mode::Think));
        assert_eq!(Mode::parse("plan"), None);
    }
}
