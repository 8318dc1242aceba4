use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub project_id: String,
    pub event_name: String,
    pub requirements: String,
    pub work_dir: String,
    /// `success` or `error`.
    pub status: String,
    pub started_at: String,
    pub stages: Vec<Map<String, Value>>,
    pub layers: Vec<Map<String, Value>>,
    pub iterations: u64,
    pub final_score: Option<f64>,
    pub final_html_path: Option<String>,
    pub failures: Vec<String>,
}

pub fn write_final_report(
    path: &Path,
    report: &FinalReport,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut project_info = Map::new();
    project_info.insert("project_id".to_string(), Value::String(report.project_id.clone()));
    project_info.insert("event_name".to_string(), Value::String(report.event_name.clone()));
    project_info.insert(
        "requirements".to_string(),
        Value::String(report.requirements.clone()),
    );
    project_info.insert("work_dir".to_string(), Value::String(report.work_dir.clone()));
    project_info.insert("started_at".to_string(), Value::String(report.started_at.clone()));

    let mut optimization = Map::new();
    optimization.insert(
        "total_iterations".to_string(),
        Value::Number(report.iterations.into()),
    );
    optimization.insert(
        "final_score".to_string(),
        report
            .final_score
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    );
    optimization.insert(
        "final_html_path".to_string(),
        report
            .final_html_path
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );

    let mut results = Map::new();
    results.insert(
        "stages".to_string(),
        Value::Array(report.stages.iter().cloned().map(Value::Object).collect()),
    );
    results.insert(
        "layers".to_string(),
        Value::Array(report.layers.iter().cloned().map(Value::Object).collect()),
    );
    results.insert("optimization".to_string(), Value::Object(optimization));

    let mut payload = Map::new();
    payload.insert("project_info".to_string(), Value::Object(project_info));
    payload.insert("status".to_string(), Value::String(report.status.clone()));
    payload.insert("results".to_string(), Value::Object(results));
    payload.insert(
        "failures".to_string(),
        Value::Array(report.failures.iter().cloned().map(Value::String).collect()),
    );
    payload.insert("completed_at".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_final_report, FinalReport};

    #[test]
    fn final_report_has_project_results_and_completion() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("final_report.json");

        let mut stage = Map::new();
        stage.insert("stage".to_string(), json!("event_analysis"));
        stage.insert("status".to_string(), json!("completed"));
        let mut layer = Map::new();
        layer.insert("layer".to_string(), json!("background"));
        layer.insert("status".to_string(), json!("failed"));
        let report = FinalReport {
            project_id: "proj-1".to_string(),
            event_name: "SummerSale".to_string(),
            requirements: String::new(),
            work_dir: temp.path().to_string_lossy().to_string(),
            status: "success".to_string(),
            started_at: "2026-10-19T00:00:00+00:00".to_string(),
            stages: vec![stage],
            layers: vec![layer],
            iterations: 2,
            final_score: Some(7.5),
            final_html_path: None,
            failures: vec!["background: download failed".to_string()],
        };
        let mut extra = Map::new();
        extra.insert("cancelled".to_string(), json!(false));
        write_final_report(&path, &report, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["project_info"]["event_name"], json!("SummerSale"));
        assert_eq!(parsed["results"]["stages"][0]["status"], json!("completed"));
        assert_eq!(parsed["results"]["optimization"]["final_score"], json!(7.5));
        assert_eq!(parsed["results"]["optimization"]["final_html_path"], Value::Null);
        assert_eq!(parsed["failures"][0], json!("background: download failed"));
        assert_eq!(parsed["cancelled"], json!(false));
        assert!(parsed.get("completed_at").and_then(Value::as_str).is_some());
        Ok(())
    }
}
