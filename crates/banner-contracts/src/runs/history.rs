use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;

use crate::now_utc_iso;
use crate::verdict::ValidationVerdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub html_path: String,
    pub screenshot_path: Option<String>,
    pub verdict: Option<ValidationVerdict>,
    pub optimization_attempted: bool,
    pub optimized_html_path: Option<String>,
    /// Unified diff of this iteration's HTML against the previous iteration's.
    pub html_diff: Option<Vec<String>>,
    pub note: Option<String>,
    pub created_at: String,
}

/// Everything the optimization loop saw, persisted as `optimization_summary.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationHistory {
    pub path: PathBuf,
    pub initial_html_path: String,
    pub created_at: String,
    pub iterations: Vec<IterationRecord>,
    last_html: Option<String>,
}

impl OptimizationHistory {
    pub fn new(path: impl Into<PathBuf>, initial_html_path: &Path) -> Self {
        Self {
            path: path.into(),
            initial_html_path: initial_html_path.to_string_lossy().to_string(),
            created_at: now_utc_iso(),
            iterations: Vec::new(),
            last_html: None,
        }
    }

    pub fn begin_iteration(&mut self, iteration: u32, html: &str, html_path: &Path) -> &mut IterationRecord {
        let html_diff = self.last_html.as_deref().map(|prev| html_diff(prev, html));
        self.last_html = Some(html.to_string());
        self.iterations.push(IterationRecord {
            iteration,
            html_path: html_path.to_string_lossy().to_string(),
            screenshot_path: None,
            verdict: None,
            optimization_attempted: false,
            optimized_html_path: None,
            html_diff,
            note: None,
            created_at: now_utc_iso(),
        });
        let index = self.iterations.len() - 1;
        &mut self.iterations[index]
    }

    pub fn current_mut(&mut self) -> Option<&mut IterationRecord> {
        self.iterations.last_mut()
    }

    pub fn total_iterations(&self) -> usize {
        self.iterations.len()
    }

    /// Score of the last iteration that produced a verdict.
    pub fn final_score(&self) -> Option<f64> {
        self.iterations
            .iter()
            .rev()
            .find_map(|row| row.verdict.as_ref().map(|verdict| verdict.score))
    }

    pub fn save(&self, extra: Option<&Map<String, Value>>) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "total_iterations".to_string(),
            Value::Number((self.iterations.len() as u64).into()),
        );
        payload.insert(
            "final_score".to_string(),
            self.final_score()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "initial_html_path".to_string(),
            Value::String(self.initial_html_path.clone()),
        );
        payload.insert(
            "history".to_string(),
            serde_json::to_value(&self.iterations)?,
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert("updated_at".to_string(), Value::String(now_utc_iso()));
        if let Some(extra) = extra {
            for (key, value) in extra {
                payload.insert(key.clone(), value.clone());
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
        Ok(())
    }
}

fn html_diff(prev: &str, curr: &str) -> Vec<String> {
    TextDiff::from_lines(prev, curr)
        .unified_diff()
        .header("prev", "curr")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}
