use std::collections::BTreeMap;

use banner_contracts::verdict::ValidationVerdict;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::extract::{Grammar, JsonGrammar};

/// Builds a verdict from a vision model reply.
///
/// JSON first (`score`/`total_score`/`overall_score`, `dimensions`,
/// `feedback`, `suggestions`), then loose textual scores. A total on the
/// five-dimension 50-point scale is divided by 5. A reply with no usable
/// score becomes score 0 with the raw reply as feedback.
pub fn parse_verdict(reply: &str, iteration: u32, threshold: f64) -> ValidationVerdict {
    if let Some(parsed) = JsonGrammar::object().parse(reply) {
        if let Some(verdict) = verdict_from_json(&parsed, iteration, threshold) {
            return verdict;
        }
    }
    if let Some(score) = score_from_text(reply) {
        return ValidationVerdict::new(
            iteration,
            score,
            BTreeMap::new(),
            reply.trim(),
            Vec::new(),
            threshold,
        );
    }
    warn!(event = "verdict_unparseable", iteration);
    ValidationVerdict::new(
        iteration,
        0.0,
        BTreeMap::new(),
        reply.trim(),
        Vec::new(),
        threshold,
    )
}

fn verdict_from_json(parsed: &Value, iteration: u32, threshold: f64) -> Option<ValidationVerdict> {
    let dimensions: BTreeMap<String, f64> = parsed
        .get("dimensions")
        .or_else(|| parsed.get("scores"))
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| number(value).map(|score| (key.clone(), score)))
                .collect()
        })
        .unwrap_or_default();

    let explicit = ["score", "total_score", "overall_score"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(number));
    let score = match explicit {
        Some(score) => normalize_total(score),
        None if !dimensions.is_empty() => {
            dimensions.values().sum::<f64>() / dimensions.len() as f64
        }
        None => return None,
    };

    let feedback = ["feedback", "comment", "summary"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(Value::as_str))
        .unwrap_or("")
        .trim()
        .to_string();
    let suggestions = match parsed.get("suggestions").or_else(|| parsed.get("improvements")) {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| row.as_str().map(|text| text.trim().to_string()))
            .filter(|text| !text.is_empty())
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    };

    Some(ValidationVerdict::new(
        iteration,
        score,
        dimensions,
        feedback,
        suggestions,
        threshold,
    ))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches("/10").trim().parse().ok(),
        _ => None,
    }
}

fn normalize_total(score: f64) -> f64 {
    if score > 10.0 && score <= 50.0 {
        score / 5.0
    } else {
        score
    }
}

/// Loose textual scores. A `None` divisor means the scale is unknown and the
/// 50-point heuristic applies.
fn score_from_text(text: &str) -> Option<f64> {
    let patterns: [(&str, Option<f64>); 4] = [
        (r"(\d+(?:\.\d+)?)\s*/\s*50", Some(5.0)),
        (r"(?:总分|总评分|综合评分)\s*[:：]?\s*(\d+(?:\.\d+)?)", None),
        (r"(?i)\bscore\b\s*[:：=]?\s*(\d+(?:\.\d+)?)", None),
        (r"(\d+(?:\.\d+)?)\s*/\s*10\b", Some(1.0)),
    ];
    for (pattern, divisor) in patterns {
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        let Some(found) = regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|value| value.as_str().parse::<f64>().ok())
        else {
            continue;
        };
        return Some(match divisor {
            Some(divisor) => found / divisor,
            None => normalize_total(found),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reply_is_read_with_dimensions_and_suggestions() {
        let reply = r#"```json
{"score": 8.5, "dimensions": {"layout": 9, "color": "8"}, "feedback": "Clean and bright.", "suggestions": ["Bigger CTA", ""]}
```"#;
        let verdict = parse_verdict(reply, 2, 7.0);
        assert_eq!(verdict.iteration, 2);
        assert_eq!(verdict.score, 8.5);
        assert_eq!(verdict.dimensions.get("color"), Some(&8.0));
        assert_eq!(verdict.suggestions, vec!["Bigger CTA".to_string()]);
        assert!(!verdict.needs_optimization);
    }

    #[test]
    fn fifty_point_totals_and_dimension_means_are_normalized() {
        let total = parse_verdict(r#"{"total_score": 40, "feedback": "ok"}"#, 0, 7.0);
        assert_eq!(total.score, 8.0);

        let mean = parse_verdict(
            r#"{"dimensions": {"a": 6, "b": 8}, "feedback": "fine"}"#,
            0,
            7.0,
        );
        assert_eq!(mean.score, 7.0);
    }

    #[test]
    fn textual_scores_are_recognized() {
        assert_eq!(parse_verdict("Overall score: 6.5, ok", 0, 7.0).score, 6.5);
        assert_eq!(parse_verdict("I'd give it 9/10.", 0, 7.0).score, 9.0);
        assert_eq!(parse_verdict("总分：42", 0, 7.0).score, 8.4);
        assert_eq!(parse_verdict("Five dimensions total 35/50", 0, 7.0).score, 7.0);
    }

    #[test]
    fn keyword_feedback_forces_optimization_at_passing_score() {
        let verdict = parse_verdict(r#"{"score": 8, "feedback": "存在问题需要改进"}"#, 0, 7.0);
        assert!(verdict.needs_optimization);
    }

    #[test]
    fn unparseable_reply_scores_zero_and_keeps_text() {
        let verdict = parse_verdict("looks nice overall", 3, 7.0);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.feedback, "looks nice overall");
        assert!(verdict.needs_optimization);
    }
}
