use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCORE_THRESHOLD: f64 = 7.0;

/// Feedback phrases that force another optimization round regardless of score.
pub const NEGATIVE_FEEDBACK_KEYWORDS: &[&str] = &[
    "不够",
    "缺乏",
    "问题",
    "改进",
    "调整",
    "insufficient",
    "lacking",
    "problem",
    "needs improvement",
    "needs adjustment",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub iteration: u32,
    pub score: f64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    pub feedback: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub needs_optimization: bool,
    pub created_at: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn new(
        iteration: u32,
        score: f64,
        dimensions: BTreeMap<String, f64>,
        feedback: impl Into<String>,
        suggestions: Vec<String>,
        threshold: f64,
    ) -> Self {
        let feedback = feedback.into();
        let score = score.clamp(0.0, 10.0);
        Self {
            iteration,
            score,
            needs_optimization: needs_optimization_with(threshold, score, &feedback),
            dimensions,
            feedback,
            suggestions,
            created_at: Utc::now(),
        }
    }
}

pub fn needs_optimization(score: f64, feedback: &str) -> bool {
    needs_optimization_with(DEFAULT_SCORE_THRESHOLD, score, feedback)
}

/// Coarse heuristic: low score, or any negative phrase in the feedback.
pub fn needs_optimization_with(threshold: f64, score: f64, feedback: &str) -> bool {
    if score < threshold {
        return true;
    }
    let lowered = feedback.to_lowercase();
    NEGATIVE_FEEDBACK_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_score_needs_optimization() {
        assert!(needs_optimization(6.9, "looks great"));
        assert!(!needs_optimization(7.0, "looks great"));
        assert!(!needs_optimization(9.5, ""));
    }

    #[test]
    fn negative_keywords_override_high_score() {
        assert!(needs_optimization(9.0, "整体不错，但对比度不够"));
        assert!(needs_optimization(9.0, "Color contrast is LACKING on the CTA"));
        assert!(needs_optimization(8.0, "Layout needs adjustment near the logo"));
        assert!(!needs_optimization(8.0, "优化得很好"));
    }

    #[test]
    fn verdict_clamps_score_and_derives_flag() {
        let verdict = ValidationVerdict::new(
            2,
            42.0,
            BTreeMap::new(),
            "strong layout",
            Vec::new(),
            DEFAULT_SCORE_THRESHOLD,
        );
        assert_eq!(verdict.score, 10.0);
        assert!(!verdict.needs_optimization);

        let strict = ValidationVerdict::new(0, 8.0, BTreeMap::new(), "", Vec::new(), 8.5);
        assert!(strict.needs_optimization);
    }
}
