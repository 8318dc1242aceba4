use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::now_utc_iso;

pub type EventPayload = Map<String, Value>;

/// Append-only writer for a project's `events.jsonl`.
///
/// - default fields are `type`, `project_id`, `seq`, `ts`
/// - `seq` counts events emitted through this writer (and its clones), starting at 1
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    project_id: String,
    seq: Mutex<u64>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                project_id: project_id.into(),
                seq: Mutex::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Sequence assignment and the file append happen under one lock so
        // line order always matches `seq` order.
        let mut seq = self
            .inner
            .seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        *seq += 1;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "project_id".to_string(),
            Value::String(self.inner.project_id.clone()),
        );
        event.insert("seq".to_string(), Value::Number((*seq).into()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Reads back every event type in file order. Unparseable lines are skipped.
    pub fn read_types(&self) -> anyhow::Result<Vec<String>> {
        let raw = std::fs::read_to_string(&self.inner.path)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "proj-123");

        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), Value::String("analysis".to_string()));
        let emitted = log.emit("stage_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("stage_started".to_string()));
        assert_eq!(parsed["project_id"], Value::String("proj-123".to_string()));
        assert_eq!(parsed["stage"], Value::String("analysis".to_string()));
        assert_eq!(parsed["seq"], Value::Number(1.into()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn clones_share_one_sequence() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let log = EventLog::new(&path, "proj-123");
        let clone = log.clone();

        log.emit("one", EventPayload::new())?;
        let second = clone.emit("two", EventPayload::new())?;
        assert_eq!(second["seq"], Value::Number(2.into()));

        assert_eq!(log.read_types()?, vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn concurrent_emits_keep_every_line_intact() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "proj-123");

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let log = log.clone();
                scope.spawn(move || {
                    for _ in 0..10 {
                        let mut payload = EventPayload::new();
                        payload.insert("worker".to_string(), Value::Number(worker.into()));
                        let _ = log.emit("tick", payload);
                    }
                });
            }
        });

        let raw = fs::read_to_string(&path)?;
        let seqs: Vec<u64> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("seq").and_then(Value::as_u64))
            .collect();
        assert_eq!(seqs.len(), 40);
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
        Ok(())
    }
}
