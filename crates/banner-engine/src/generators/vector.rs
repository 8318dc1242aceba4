use banner_contracts::layers::{LayerSpec, Modality};
use banner_contracts::materials::GeneratedMaterial;
use banner_contracts::runs::ResolvedMaterial;
use serde_json::{json, Map, Value};

use super::{
    derive_filename, derive_prompt, layer_info, record_receipt, sources, split_filename,
    succeeded, GenerationContext, MaterialGenerator, Produced, ReceiptInput,
};
use crate::agent::{AgentRequest, AgentTask, Capability};
use crate::extract::{extract, FilenameGrammar, MarkupGrammar, Route};
use crate::prompts::{StagePrompt, SvgPrompt};
use crate::store::SVG_DIR;
use crate::{map_object, sha256_hex, timestamp_slug, truncate_text};

/// SVG layers produced by the code-generation model.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorGenerator;

impl MaterialGenerator for VectorGenerator {
    fn modality(&self) -> Modality {
        Modality::Vector
    }

    fn generate(&self, ctx: &GenerationContext<'_>, spec: &LayerSpec) -> GeneratedMaterial {
        let kind = spec.kind;
        let info = layer_info(ctx, spec);
        let prompt = derive_prompt(ctx, &info.value, || {
            format!("{} layer: {}", kind.key(), spec.intent)
        });
        let filename = derive_filename(ctx, FilenameGrammar::vector(), kind, &info.value, || {
            format!("{}_{}.svg", kind.key(), timestamp_slug())
        });

        let mut warnings: Vec<String> = Vec::new();
        let mut resolved = ResolvedMaterial {
            provider: ctx.agent.name().to_string(),
            model: None,
            prompt: prompt.value.clone(),
            filename: filename.value.clone(),
            width: Some(ctx.banner_size.0),
            height: Some(ctx.banner_size.1),
            sources: sources(&[
                ("layer_info", info.source.as_str()),
                ("prompt", prompt.source.as_str()),
                ("filename", filename.source.as_str()),
            ]),
        };

        let fail = |reason: String, resolved: ResolvedMaterial, warnings: &[String], response: Map<String, Value>| {
            record_receipt(
                ctx,
                spec,
                ReceiptInput {
                    resolved,
                    provider_request: Map::new(),
                    provider_response: response,
                    warnings,
                    paths: &[],
                    status: "failed",
                },
            );
            GeneratedMaterial::failed(kind, &prompt.value, &filename.value, Some(ctx.banner_size), reason)
        };

        let rendered = match (SvgPrompt {
            layer_label: kind.label().to_string(),
            layer_key: kind.key().to_string(),
            prompt: prompt.value.clone(),
            layer_info: info.value.clone(),
            width: ctx.banner_size.0,
            height: ctx.banner_size.1,
        })
        .render()
        {
            Ok(rendered) => rendered,
            Err(err) => return fail(err.to_string(), resolved, &warnings, Map::new()),
        };

        let request = AgentRequest::new(
            Capability::CodeGeneration,
            AgentTask::SvgGeneration(kind),
            SvgPrompt::SYSTEM,
            rendered,
        );
        let reply = match ctx.agent.invoke(&request) {
            Ok(reply) => reply,
            Err(err) => return fail(err.to_string(), resolved, &warnings, Map::new()),
        };
        let response = map_object(json!({
            "reply_chars": reply.chars().count(),
            "reply_preview": truncate_text(&reply, 200),
        }));

        let blocks = extract(Some(ctx.agent), &MarkupGrammar::svg(), &reply, Route::LlmFirst, Vec::new);
        resolved
            .sources
            .insert("svg".to_string(), json!(blocks.source.as_str()));
        if blocks.value.is_empty() {
            return fail(
                "no <svg> markup found in model reply".to_string(),
                resolved,
                &warnings,
                response,
            );
        }
        if blocks.value.len() > 1 {
            warnings.push(format!("reply held {} svg blocks; saved each", blocks.value.len()));
        }

        let (stem, _) = split_filename(&filename.value);
        let mut paths = Vec::new();
        let mut bytes = 0u64;
        for (index, block) in blocks.value.iter().enumerate() {
            let name = if blocks.value.len() == 1 {
                filename.value.clone()
            } else {
                format!("{stem}_{}.svg", index + 1)
            };
            let description = format!("{} layer SVG", kind.label());
            match ctx
                .store
                .save_bytes_in(SVG_DIR, &name, block.as_bytes(), "svg", &description)
            {
                Ok(path) => {
                    bytes += block.len() as u64;
                    paths.push(path);
                }
                Err(err) => {
                    return fail(format!("failed saving {name}: {err}"), resolved, &warnings, response)
                }
            }
        }
        let primary = blocks.value.first().map(|block| sha256_hex(block.as_bytes()));

        record_receipt(
            ctx,
            spec,
            ReceiptInput {
                resolved,
                provider_request: map_object(json!({
                    "capability": Capability::CodeGeneration.as_str(),
                    "task": request.task.to_string(),
                })),
                provider_response: response,
                warnings: &warnings,
                paths: &paths,
                status: "succeeded",
            },
        );
        succeeded(
            spec,
            prompt.value.clone(),
            filename.value.clone(),
            Produced {
                paths,
                bytes,
                sha256: primary,
                size: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use banner_contracts::layers::LayerKind;
    use banner_contracts::materials::MaterialStatus;

    use super::*;
    use crate::agent::AgentModel;
    use crate::cancel::CancelToken;
    use crate::error::{BannerError, BannerResult};
    use crate::store::ProjectStore;

    /// Replies to SVG generation with `svg_reply`, to extraction with `""`.
    struct SvgAgent {
        svg_reply: Option<String>,
        tasks: Mutex<Vec<String>>,
    }

    impl AgentModel for SvgAgent {
        fn name(&self) -> &str {
            "svg-stub"
        }

        fn invoke(&self, request: &AgentRequest) -> BannerResult<String> {
            if let Ok(mut tasks) = self.tasks.lock() {
                tasks.push(request.task.to_string());
            }
            match request.task {
                AgentTask::SvgGeneration(_) => self
                    .svg_reply
                    .clone()
                    .ok_or_else(|| BannerError::Model("quota exceeded".to_string())),
                _ => Ok(String::new()),
            }
        }
    }

    fn context<'a>(
        agent: &'a SvgAgent,
        store: &'a ProjectStore,
        design: &'a str,
        cancel: &'a CancelToken,
    ) -> GenerationContext<'a> {
        GenerationContext {
            agent,
            store,
            design_text: design,
            banner_size: (1200, 600),
            cancel,
        }
    }

    #[test]
    fn sibling_blocks_are_saved_with_index_suffixes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let cancel = CancelToken::new();
        let agent = SvgAgent {
            svg_reply: Some("```svg\n<svg id=\"a\"></svg>\n<svg id=\"b\"></svg>\n```".to_string()),
            tasks: Mutex::new(Vec::new()),
        };
        let design = r#"{"layers": {"logo": {"input": "wave shaped event mark", "output": ["wave.svg"]}}}"#;
        let spec = LayerSpec::default_for(LayerKind::Logo);

        let material = VectorGenerator.generate(&context(&agent, &store, design, &cancel), &spec);

        assert!(material.succeeded(), "{:?}", material.failure_reason());
        assert_eq!(material.filename, "logo_wave.svg");
        assert_eq!(material.prompt, "wave shaped event mark");
        let names: Vec<String> = material
            .paths
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["logo_wave_1.svg".to_string(), "logo_wave_2.svg".to_string()]);
        assert_eq!(
            material.sha256.as_deref(),
            Some(sha256_hex(b"<svg id=\"a\"></svg>").as_str())
        );

        let receipt: Value = serde_json::from_str(&std::fs::read_to_string(
            temp.path().join("receipts/receipt-logo.json"),
        )?)?;
        assert_eq!(receipt["status"], json!("succeeded"));
        assert_eq!(receipt["resolved"]["sources"]["filename"], json!("syntactic"));
        assert_eq!(store.manifest().entries().len(), 2);
        Ok(())
    }

    #[test]
    fn model_failure_yields_failed_material_with_attempted_values() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let cancel = CancelToken::new();
        let agent = SvgAgent {
            svg_reply: None,
            tasks: Mutex::new(Vec::new()),
        };
        let spec = LayerSpec::default_for(LayerKind::Text);

        let material = VectorGenerator.generate(&context(&agent, &store, "", &cancel), &spec);

        assert!(matches!(material.status, MaterialStatus::Failed { .. }));
        assert!(material.failure_reason().unwrap_or("").contains("quota exceeded"));
        assert!(material.filename.starts_with("text_"));
        assert!(material.filename.ends_with(".svg"));
        assert!(!material.prompt.is_empty());
        assert!(temp.path().join("receipts/receipt-text.json").is_file());
        Ok(())
    }

    #[test]
    fn reply_without_markup_fails_the_layer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let cancel = CancelToken::new();
        let agent = SvgAgent {
            svg_reply: Some("Sorry, I cannot draw that.".to_string()),
            tasks: Mutex::new(Vec::new()),
        };
        let spec = LayerSpec::default_for(LayerKind::Effects);
        let material = VectorGenerator.generate(&context(&agent, &store, "", &cancel), &spec);
        assert!(!material.succeeded());
        assert!(store.manifest().entries().is_empty());
        Ok(())
    }
}
