use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    #[serde(rename = "path")]
    pub file_path: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub description: String,
    pub size: u64,
    pub created_at: String,
}

/// Directory (relative to the project root) that `save_artifact` uses for a file type.
pub fn artifact_dir_for(file_type: &str) -> &'static str {
    match file_type.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "html" | "css" | "js" => "web",
        "png" | "jpg" | "jpeg" | "gif" | "svg" => "images",
        _ => "documents",
    }
}

/// `file_manifest.json`: every persisted file, in write order.
///
/// Entries are never rewritten or removed; saving the same filename twice
/// leaves two entries. `latest_by_filename` collapses them for display.
#[derive(Debug, Clone)]
pub struct FileManifest {
    inner: Arc<ManifestInner>,
}

#[derive(Debug)]
struct ManifestInner {
    path: PathBuf,
    entries: Mutex<Vec<ManifestEntry>>,
}

impl FileManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ManifestInner {
                path: path.into(),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(
        &self,
        filename: &str,
        file_path: &Path,
        file_type: &str,
        description: &str,
        size: u64,
    ) -> anyhow::Result<ManifestEntry> {
        let mut entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("manifest lock poisoned"))?;
        // Stamped under the lock so `created_at` never decreases along the file.
        let entry = ManifestEntry {
            filename: filename.to_string(),
            file_path: file_path.to_string_lossy().to_string(),
            file_type: file_type.to_string(),
            description: description.to_string(),
            size,
            created_at: now_utc_iso(),
        };
        entries.push(entry.clone());
        write_json(&self.inner.path, &json!({ "files": &*entries }))?;
        Ok(entry)
    }

    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// One entry per filename (the most recent write), in first-seen order.
    pub fn latest_by_filename(&self) -> Vec<ManifestEntry> {
        let mut latest: IndexMap<String, ManifestEntry> = IndexMap::new();
        for entry in self.entries() {
            latest.insert(entry.filename.clone(), entry);
        }
        latest.into_values().collect()
    }
}

fn write_json(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}
