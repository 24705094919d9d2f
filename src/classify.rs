//! Request complexity classification.
//!
//! Simple requests go straight to the provider; standard and complex ones
//! run through the tool loop.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::task::word_regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Standard,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Standard => "standard",
            Complexity::Complex => "complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CHAT_SOURCES: &[&str] = &[
    "chat", "discord", "telegram", "slack", "whatsapp", "line", "matrix", "teams", "signal",
    "gchat", "imessage",
];

const COMPLEX_SOURCES: &[&str] = &["cron", "workflow", "agent-comm"];

const KEYWORDS_EN: &[&str] = &[
    "code", "implement", "build", "debug", "refactor", "deploy", "api", "database", "sql",
    "function", "algorithm", "compile", "test", "migration", "schema", "endpoint",
    "infrastructure", "architecture", "pipeline", "optimize", "benchmark", "profiling",
    "concurrency", "mutex", "authentication", "authorization", "encryption",
];

/// Matched as plain substrings; CJK text has no word boundaries.
const KEYWORDS_JA: &[&str] = &[
    "コード", "実装", "デバッグ", "リファクタ", "デプロイ", "データベース", "アルゴリズム",
    "コンパイル", "テスト", "マイグレーション", "スキーマ", "エンドポイント", "インフラ",
    "アーキテクチャ", "パイプライン", "最適化", "ベンチマーク", "プロファイリング",
    "並行処理", "認証", "暗号化", "関数", "設計",
];

static KEYWORD_RES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| KEYWORDS_EN.iter().map(|kw| word_regex(&[kw])).collect());

fn count_keywords(prompt: &str) -> usize {
    KEYWORD_RES.iter().filter(|re| re.is_match(prompt)).count()
        + KEYWORDS_JA.iter().filter(|kw| prompt.contains(*kw)).count()
}

fn has_keyword(prompt: &str) -> bool {
    KEYWORD_RES.iter().any(|re| re.is_match(prompt))
        || KEYWORDS_JA.iter().any(|kw| prompt.contains(kw))
}

/// Classify a prompt by its wording and where it came from.
pub fn classify_complexity(prompt: &str, source: &str) -> Complexity {
    let source = source.trim().to_lowercase();
    let len = prompt.chars().count();

    if COMPLEX_SOURCES.contains(&source.as_str()) || len > 2000 {
        return Complexity::Complex;
    }

    if source == "taskboard" {
        return if len < 100 {
            Complexity::Simple
        } else if count_keywords(prompt) >= 3 {
            Complexity::Complex
        } else {
            Complexity::Standard
        };
    }

    if has_keyword(prompt) {
        return Complexity::Complex;
    }
    if len < 100 && CHAT_SOURCES.contains(&source.as_str()) {
        return Complexity::Simple;
    }
    Complexity::Standard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_sources_and_length() {
        assert_eq!(classify_complexity("hi", "cron"), Complexity::Complex);
        assert_eq!(classify_complexity("hi", " Workflow "), Complexity::Complex);
        assert_eq!(classify_complexity(&"a ".repeat(1001), "chat"), Complexity::Complex);
    }

    #[test]
    fn test_keywords() {
        assert_eq!(classify_complexity("please debug this", "chat"), Complexity::Complex);
        assert_eq!(classify_complexity("APIを実装して", "chat"), Complexity::Complex);
        // Whole words only: "testing" is not "test"
        assert_eq!(classify_complexity("testing the mic", "chat"), Complexity::Simple);
    }

    #[test]
    fn test_chat_vs_standard() {
        assert_eq!(classify_complexity("good morning!", "telegram"), Complexity::Simple);
        assert_eq!(classify_complexity("good morning!", "http"), Complexity::Standard);
        assert_eq!(classify_complexity(&"hello ".repeat(20), "slack"), Complexity::Standard);
    }

    #[test]
    fn test_taskboard() {
        assert_eq!(classify_complexity("write the code", "taskboard"), Complexity::Simple);
        let few = format!("{} code and test", "please look at this ".repeat(5));
        assert_eq!(classify_complexity(&few, "taskboard"), Complexity::Standard);
        let many = format!("{} code, test, deploy", "please look at this ".repeat(5));
        assert_eq!(classify_complexity(&many, "taskboard"), Complexity::Complex);
    }
}
