use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::now_utc_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub step_name: String,
    pub status: ProgressStatus,
    pub details: String,
    pub timestamp: String,
}

/// `progress.json`: a JSON array of step transitions, rewritten on every record.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    path: PathBuf,
    entries: Mutex<Vec<ProgressEntry>>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                path: path.into(),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn record(
        &self,
        step_name: &str,
        status: ProgressStatus,
        details: &str,
    ) -> anyhow::Result<ProgressEntry> {
        let mut entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("progress lock poisoned"))?;
        let entry = ProgressEntry {
            step_name: step_name.to_string(),
            status,
            details: details.to_string(),
            timestamp: now_utc_iso(),
        };
        entries.push(entry.clone());

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.inner.path, serde_json::to_string_pretty(&*entries)?)?;
        Ok(entry)
    }

    pub fn entries(&self) -> Vec<ProgressEntry> {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn progress_log_appends_without_dedup() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("progress.json");
        let log = ProgressLog::new(&path);

        log.record("event_analysis", ProgressStatus::Started, "")?;
        log.record("event_analysis", ProgressStatus::Completed, "ok")?;
        log.record("event_analysis", ProgressStatus::Completed, "ok")?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let rows = parsed.as_array().cloned().unwrap_or_default();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["status"], json!("started"));
        assert_eq!(rows[1]["step_name"], json!("event_analysis"));
        assert!(rows[2].get("timestamp").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn parallel_records_keep_timestamps_ordered() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = ProgressLog::new(temp.path().join("progress.json"));

        std::thread::scope(|scope| {
            for worker in 0..6 {
                let log = log.clone();
                scope.spawn(move || {
                    for _ in 0..40 {
                        let _ = log.record(&format!("layer_{worker}"), ProgressStatus::InProgress, "");
                    }
                });
            }
        });

        let entries = log.entries();
        assert_eq!(entries.len(), 240);
        for pair in entries.windows(2) {
            let earlier = DateTime::parse_from_rfc3339(&pair[0].timestamp)?;
            let later = DateTime::parse_from_rfc3339(&pair[1].timestamp)?;
            assert!(earlier <= later);
        }
        Ok(())
    }

    #[test]
    fn in_progress_serializes_snake_case() -> anyhow::Result<()> {
        let value = serde_json::to_value(ProgressStatus::InProgress)?;
        assert_eq!(value, json!("in_progress"));
        Ok(())
    }
}
