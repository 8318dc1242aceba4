use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::layers::LayerKind;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What a generator was asked to produce for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRequest {
    pub layer: LayerKind,
    pub intent: String,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

/// Parameters the generator actually used after extraction and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMaterial {
    pub provider: String,
    pub model: Option<String>,
    pub prompt: String,
    pub filename: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Where each extracted value came from (`llm`, `syntactic`, `default`).
    #[serde(default)]
    pub sources: Map<String, Value>,
}

/// Keys whose values are inline binary or raw markup bodies.
const OMITTED_KEYS: &[&str] = &["b64_json", "image", "image_bytes", "data", "bytes", "image_url"];

pub fn receipt_path(receipts_dir: &Path, layer: LayerKind) -> PathBuf {
    receipts_dir.join(format!("receipt-{}.json", layer.key()))
}

/// One layer's generation record, successful or not.
#[derive(Debug, Clone)]
pub struct MaterialReceipt<'r> {
    pub request: &'r MaterialRequest,
    pub resolved: &'r ResolvedMaterial,
    pub provider_request: &'r Map<String, Value>,
    pub provider_response: &'r Map<String, Value>,
    pub warnings: &'r [String],
    pub artifact_paths: &'r [PathBuf],
    pub status: &'r str,
}

impl MaterialReceipt<'_> {
    pub fn to_json(&self, receipt_path: &Path) -> anyhow::Result<Value> {
        let paths: Vec<String> = self
            .artifact_paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        Ok(json!({
            "schema_version": RECEIPT_SCHEMA_VERSION,
            "status": self.status,
            "request": sanitize(serde_json::to_value(self.request)?),
            "resolved": sanitize(serde_json::to_value(self.resolved)?),
            "provider_request": sanitize(Value::Object(self.provider_request.clone())),
            "provider_response": sanitize(Value::Object(self.provider_response.clone())),
            "warnings": self.warnings,
            "artifacts": {
                "paths": paths,
                "receipt_path": receipt_path.to_string_lossy(),
            },
        }))
    }

    /// Writes `receipt-<layer>.json` under `receipts_dir`, replacing any
    /// earlier receipt for the same layer.
    pub fn write(&self, receipts_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = receipt_path(receipts_dir, self.request.layer);
        let payload = self.to_json(&path)?;
        fs::create_dir_all(receipts_dir)
            .with_context(|| format!("creating {}", receipts_dir.display()))?;
        fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

fn sanitize(value: Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, row)| {
                    if OMITTED_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                        (key, Value::String("<omitted>".to_string()))
                    } else {
                        (key, sanitize(row))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}
