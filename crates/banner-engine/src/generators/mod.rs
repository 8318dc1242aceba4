//! Per-layer material generators. Both modalities share one shape: narrow
//! the design down to the layer, derive a prompt and a filename (model
//! first, syntactic fallback, then a default), call the generation resource,
//! persist, and write a receipt.

pub mod raster;
pub mod vector;

use std::path::PathBuf;

use banner_contracts::layers::{LayerKind, LayerSpec, Modality};
use banner_contracts::materials::{GeneratedMaterial, MaterialStatus};
use banner_contracts::runs::{MaterialReceipt, MaterialRequest, ProgressStatus, ResolvedMaterial};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::agent::AgentModel;
use crate::cancel::CancelToken;
use crate::extract::{extract, Extracted, FilenameGrammar, LayerFilterGrammar, PromptGrammar, Route};
use crate::map_object;
use crate::store::{ProjectStore, RECEIPTS_DIR};

pub use raster::RasterGenerator;
pub use vector::VectorGenerator;

/// Shared, read-only inputs for generating any layer of one run.
pub struct GenerationContext<'a> {
    pub agent: &'a dyn AgentModel,
    pub store: &'a ProjectStore,
    /// Layer design text the per-layer details are filtered from.
    pub design_text: &'a str,
    pub banner_size: (u32, u32),
    pub cancel: &'a CancelToken,
}

pub trait MaterialGenerator: Sync {
    fn modality(&self) -> Modality;

    /// Always returns a material; failures come back as
    /// `MaterialStatus::Failed` with the attempted parameters.
    fn generate(&self, ctx: &GenerationContext<'_>, spec: &LayerSpec) -> GeneratedMaterial;
}

/// Runs one generator with progress and event bookkeeping around it.
pub fn generate_layer(
    generator: &dyn MaterialGenerator,
    ctx: &GenerationContext<'_>,
    spec: &LayerSpec,
) -> GeneratedMaterial {
    let step = format!("layer:{}", spec.kind.key());
    ctx.store
        .record_progress(&step, ProgressStatus::Started, spec.modality().as_str());

    let material = if ctx.cancel.is_cancelled() {
        GeneratedMaterial::failed(spec.kind, "", "", None, "run cancelled")
    } else if generator.modality() != spec.modality() {
        GeneratedMaterial::failed(
            spec.kind,
            "",
            "",
            None,
            format!(
                "{} generator cannot produce a {} layer",
                generator.modality().as_str(),
                spec.modality().as_str()
            ),
        )
    } else {
        generator.generate(ctx, spec)
    };

    match &material.status {
        MaterialStatus::Succeeded => {
            info!(event = "material_created", layer = spec.kind.key(), files = material.paths.len());
            ctx.store.record_progress(
                &step,
                ProgressStatus::Completed,
                &material.filename,
            );
            ctx.store.emit(
                "material_created",
                map_object(json!({
                    "layer": spec.kind.key(),
                    "modality": material.modality.as_str(),
                    "paths": material.paths,
                    "bytes": material.bytes,
                    "sha256": material.sha256,
                })),
            );
        }
        MaterialStatus::Failed { reason } => {
            warn!(event = "material_failed", layer = spec.kind.key(), reason = %reason);
            ctx.store
                .record_progress(&step, ProgressStatus::Failed, reason);
            ctx.store.emit(
                "material_failed",
                map_object(json!({
                    "layer": spec.kind.key(),
                    "reason": reason,
                    "prompt": material.prompt,
                    "filename": material.filename,
                })),
            );
        }
    }
    material
}

/// The slice of the design describing this layer, plus the resolved plan
/// entry when the design was found.
pub(crate) fn layer_info(ctx: &GenerationContext<'_>, spec: &LayerSpec) -> Extracted<String> {
    let plan = serde_json::to_string_pretty(&spec.to_plan_entry()).unwrap_or_default();
    let grammar = LayerFilterGrammar { kind: spec.kind };
    let mut found = extract(
        Some(ctx.agent),
        &grammar,
        ctx.design_text,
        Route::LlmFirst,
        || plan.clone(),
    );
    if found.value != plan {
        found.value = format!("{}\n\nResolved plan:\n{plan}", found.value);
    }
    found
}

pub(crate) fn derive_prompt(
    ctx: &GenerationContext<'_>,
    layer_info: &str,
    default: impl FnOnce() -> String,
) -> Extracted<String> {
    extract(Some(ctx.agent), &PromptGrammar, layer_info, Route::LlmFirst, default)
}

pub(crate) fn derive_filename(
    ctx: &GenerationContext<'_>,
    grammar: FilenameGrammar,
    kind: LayerKind,
    layer_info: &str,
    default: impl FnOnce() -> String,
) -> Extracted<String> {
    let mut found = extract(Some(ctx.agent), &grammar, layer_info, Route::LlmFirst, default);
    found.value = layer_prefixed(kind, &found.value);
    found
}

/// Filenames always start with the layer key so layers never collide.
pub(crate) fn layer_prefixed(kind: LayerKind, filename: &str) -> String {
    if filename.starts_with(kind.key()) {
        filename.to_string()
    } else {
        format!("{}_{filename}", kind.key())
    }
}

pub(crate) fn split_filename(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (filename, ""),
    }
}

pub(crate) fn sources(entries: &[(&str, &str)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, source)| (key.to_string(), Value::String(source.to_string())))
        .collect()
}

/// Everything the receipt for one layer needs.
pub(crate) struct ReceiptInput<'r> {
    pub resolved: ResolvedMaterial,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: &'r [String],
    pub paths: &'r [PathBuf],
    pub status: &'r str,
}

pub(crate) fn record_receipt(ctx: &GenerationContext<'_>, spec: &LayerSpec, input: ReceiptInput<'_>) {
    let request = MaterialRequest {
        layer: spec.kind,
        intent: spec.intent.clone(),
        expected_outputs: spec.expected_outputs.clone(),
    };
    let receipt = MaterialReceipt {
        request: &request,
        resolved: &input.resolved,
        provider_request: &input.provider_request,
        provider_response: &input.provider_response,
        warnings: input.warnings,
        artifact_paths: input.paths,
        status: input.status,
    };
    if let Err(err) = receipt.write(&ctx.store.dir(RECEIPTS_DIR)) {
        warn!(event = "receipt_write_failed", layer = spec.kind.key(), error = %err);
    }
}

pub(crate) struct Produced {
    pub paths: Vec<PathBuf>,
    pub bytes: u64,
    pub sha256: Option<String>,
    pub size: Option<(u32, u32)>,
}

pub(crate) fn succeeded(spec: &LayerSpec, prompt: String, filename: String, produced: Produced) -> GeneratedMaterial {
    GeneratedMaterial {
        layer: spec.kind,
        modality: spec.modality(),
        paths: produced.paths,
        bytes: produced.bytes,
        prompt,
        filename,
        width: produced.size.map(|(width, _)| width),
        height: produced.size.map(|(_, height)| height),
        sha256: produced.sha256,
        status: MaterialStatus::Succeeded,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DryrunAgent;

    #[test]
    fn filenames_are_prefixed_with_the_layer_key() {
        assert_eq!(layer_prefixed(LayerKind::Logo, "logo.svg"), "logo.svg");
        assert_eq!(layer_prefixed(LayerKind::Logo, "wave.svg"), "logo_wave.svg");
        assert_eq!(
            layer_prefixed(LayerKind::MainElement, "main_element.png"),
            "main_element.png"
        );
    }

    #[test]
    fn split_filename_keeps_dotless_names_whole() {
        assert_eq!(split_filename("bg.final.png"), ("bg.final", "png"));
        assert_eq!(split_filename("plain"), ("plain", ""));
        assert_eq!(split_filename(".hidden"), (".hidden", ""));
    }

    #[test]
    fn mismatched_generator_fails_the_layer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let agent = DryrunAgent::new();
        let cancel = CancelToken::new();
        let ctx = GenerationContext {
            agent: &agent,
            store: &store,
            design_text: "",
            banner_size: (1200, 600),
            cancel: &cancel,
        };

        let background = LayerSpec::default_for(LayerKind::Background);
        let material = generate_layer(&VectorGenerator, &ctx, &background);

        assert!(!material.succeeded());
        assert!(matches!(
            &material.status,
            MaterialStatus::Failed { reason } if reason.contains("cannot produce a raster layer")
        ));
        assert!(store.dir("svg").read_dir().map(|mut dir| dir.next().is_none()).unwrap_or(true));
        Ok(())
    }
}
