use std::fs;
use std::path::{Path, PathBuf};

use banner_contracts::events::{EventLog, EventPayload};
use banner_contracts::runs::{artifact_dir_for, FileManifest, ProgressLog, ProgressStatus};
use serde_json::Value;
use tracing::warn;

use crate::error::BannerResult;

pub const DOCUMENTS_DIR: &str = "documents";
pub const SVG_DIR: &str = "svg";
pub const IMAGES_DIR: &str = "images";
pub const RECEIPTS_DIR: &str = "receipts";
pub const WEB_DIR: &str = "web";
pub const ASSETS_DIR: &str = "web/assets";
pub const DEBUG_DIR: &str = "debug/vl_optimization";
pub const HISTORY_DIR: &str = "optimization_history";

const PROJECT_DIRS: [&str; 8] = [
    DOCUMENTS_DIR,
    SVG_DIR,
    IMAGES_DIR,
    RECEIPTS_DIR,
    WEB_DIR,
    ASSETS_DIR,
    DEBUG_DIR,
    HISTORY_DIR,
];

/// One run's work directory plus its append-only logs. Cheap to share
/// across threads: the logs serialize their own appends.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    manifest: FileManifest,
    progress: ProgressLog,
    events: EventLog,
}

impl ProjectStore {
    pub fn create(root: impl Into<PathBuf>, project_id: &str) -> BannerResult<Self> {
        let root = root.into();
        for dir in PROJECT_DIRS {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            manifest: FileManifest::new(root.join("file_manifest.json")),
            progress: ProgressLog::new(root.join("progress.json")),
            events: EventLog::new(root.join("events.jsonl"), project_id),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn manifest(&self) -> &FileManifest {
        &self.manifest
    }

    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Writes `content` into the directory implied by `file_type` and adds a
    /// manifest entry. An existing file with the same name is overwritten.
    pub fn save_artifact(
        &self,
        content: &str,
        filename: &str,
        file_type: &str,
        description: &str,
    ) -> BannerResult<PathBuf> {
        self.save_bytes_in(
            artifact_dir_for(file_type),
            filename,
            content.as_bytes(),
            file_type,
            description,
        )
    }

    pub fn save_bytes_in(
        &self,
        dir: &str,
        filename: &str,
        bytes: &[u8],
        file_type: &str,
        description: &str,
    ) -> BannerResult<PathBuf> {
        let target_dir = self.root.join(dir);
        fs::create_dir_all(&target_dir)?;
        let path = target_dir.join(filename);
        fs::write(&path, bytes)?;
        self.manifest
            .append(filename, &path, file_type, description, bytes.len() as u64)?;
        Ok(path)
    }

    /// Writes a file relative to the root without a manifest entry
    /// (bookkeeping and debug output).
    pub fn write_file(&self, relative: &str, bytes: &[u8]) -> BannerResult<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn write_json(&self, relative: &str, value: &Value) -> BannerResult<PathBuf> {
        self.write_file(relative, serde_json::to_string_pretty(value)?.as_bytes())
    }

    pub fn record_progress(&self, step: &str, status: ProgressStatus, details: &str) {
        if let Err(err) = self.progress.record(step, status, details) {
            warn!(event = "progress_write_failed", step, error = %err);
        }
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event = "event_write_failed", event_type, error = %err);
        }
    }

    /// Copies `svg/` and `images/` into `web/assets/` so the HTML can use
    /// relative `assets/...` references. Returns the number of files copied.
    pub fn mirror_assets(&self) -> BannerResult<usize> {
        let mut copied = 0;
        for dir in [SVG_DIR, IMAGES_DIR] {
            let source = self.root.join(dir);
            if !source.is_dir() {
                continue;
            }
            let target = self.root.join(ASSETS_DIR).join(dir);
            fs::create_dir_all(&target)?;
            for entry in fs::read_dir(&source)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                fs::copy(entry.path(), target.join(entry.file_name()))?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}
