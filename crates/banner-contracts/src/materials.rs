use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layers::{LayerKind, Modality};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MaterialStatus {
    Succeeded,
    Failed { reason: String },
}

/// One generated layer asset. A failed material keeps the attempted prompt,
/// filename and size so the report can show what was tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMaterial {
    pub layer: LayerKind,
    pub modality: Modality,
    /// Primary file first; extra sibling SVG blocks follow.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    pub bytes: u64,
    pub prompt: String,
    pub filename: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sha256: Option<String>,
    pub status: MaterialStatus,
    pub created_at: DateTime<Utc>,
}

impl GeneratedMaterial {
    pub fn failed(
        layer: LayerKind,
        prompt: impl Into<String>,
        filename: impl Into<String>,
        size: Option<(u32, u32)>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            modality: layer.modality(),
            paths: Vec::new(),
            bytes: 0,
            prompt: prompt.into(),
            filename: filename.into(),
            width: size.map(|(width, _)| width),
            height: size.map(|(_, height)| height),
            sha256: None,
            status: MaterialStatus::Failed {
                reason: reason.into(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == MaterialStatus::Succeeded
    }

    pub fn primary_path(&self) -> Option<&PathBuf> {
        self.paths.first()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            MaterialStatus::Failed { reason } => Some(reason),
            MaterialStatus::Succeeded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionArtifact {
    pub iteration: u32,
    pub html: String,
    pub html_path: PathBuf,
    #[serde(default)]
    pub referenced_materials: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}
