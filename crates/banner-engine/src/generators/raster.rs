use banner_contracts::layers::{LayerKind, LayerSpec, Modality};
use banner_contracts::materials::GeneratedMaterial;
use banner_contracts::runs::ResolvedMaterial;
use image::ImageFormat;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::{
    derive_filename, derive_prompt, layer_info, record_receipt, sources, split_filename,
    succeeded, GenerationContext, MaterialGenerator, Produced, ReceiptInput,
};
use crate::extract::{extract, FilenameGrammar, Route, SizeGrammar};
use crate::imagegen::ImageGenerator;
use crate::store::IMAGES_DIR;
use crate::{sha256_hex, timestamp_slug};

pub const DEFAULT_RASTER_SIZE: (u32, u32) = (1024, 768);
const DEFAULT_BACKGROUND_PROMPT: &str = "elegant background design, gradient colors, modern style";

/// Raster layers produced by an external text-to-image resource.
pub struct RasterGenerator<'g> {
    images: &'g dyn ImageGenerator,
}

impl<'g> RasterGenerator<'g> {
    pub fn new(images: &'g dyn ImageGenerator) -> Self {
        Self { images }
    }
}

fn default_prompt(spec: &LayerSpec) -> String {
    match spec.kind {
        LayerKind::Background => DEFAULT_BACKGROUND_PROMPT.to_string(),
        _ => format!("{}, high quality, detailed, centered subject", spec.intent),
    }
}

fn extension_for(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

impl MaterialGenerator for RasterGenerator<'_> {
    fn modality(&self) -> Modality {
        Modality::Raster
    }

    fn generate(&self, ctx: &GenerationContext<'_>, spec: &LayerSpec) -> GeneratedMaterial {
        let kind = spec.kind;
        let info = layer_info(ctx, spec);
        let prompt = derive_prompt(ctx, &info.value, || default_prompt(spec));
        let size = extract(Some(ctx.agent), &SizeGrammar, &info.value, Route::LlmFirst, || {
            DEFAULT_RASTER_SIZE
        });
        let filename = derive_filename(ctx, FilenameGrammar::raster(), kind, &info.value, || {
            format!("{}.png", kind.key())
        });
        let (width, height) = size.value;

        let mut warnings: Vec<String> = Vec::new();
        let resolved = ResolvedMaterial {
            provider: self.images.name().to_string(),
            model: None,
            prompt: prompt.value.clone(),
            filename: filename.value.clone(),
            width: Some(width),
            height: Some(height),
            sources: sources(&[
                ("layer_info", info.source.as_str()),
                ("prompt", prompt.source.as_str()),
                ("size", size.source.as_str()),
                ("filename", filename.source.as_str()),
            ]),
        };
        let fail = |reason: String,
                    resolved: ResolvedMaterial,
                    request: Map<String, Value>,
                    response: Map<String, Value>| {
            record_receipt(
                ctx,
                spec,
                ReceiptInput {
                    resolved,
                    provider_request: request,
                    provider_response: response,
                    warnings: &[],
                    paths: &[],
                    status: "failed",
                },
            );
            GeneratedMaterial::failed(kind, &prompt.value, &filename.value, Some(size.value), reason)
        };

        let generated = match self.images.generate(&prompt.value, width, height) {
            Ok(generated) => generated,
            Err(err) => return fail(err.to_string(), resolved, Map::new(), Map::new()),
        };
        let downloaded = match self.images.download(&generated.url) {
            Ok(downloaded) => downloaded,
            Err(err) => {
                return fail(
                    err.to_string(),
                    resolved,
                    generated.provider_request,
                    generated.provider_response,
                )
            }
        };

        let real_size = match image::load_from_memory(&downloaded.bytes) {
            Ok(decoded) => Some((decoded.width(), decoded.height())),
            Err(err) => {
                warn!(event = "raster_not_decodable", layer = kind.key(), error = %err);
                warnings.push(format!("downloaded bytes did not decode as an image: {err}"));
                None
            }
        };
        let (stem, requested_ext) = split_filename(&filename.value);
        let ext = extension_for(&downloaded.bytes)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if requested_ext.is_empty() {
                    "png".to_string()
                } else {
                    requested_ext.to_string()
                }
            });
        let saved_name = format!("{stem}_{}.{ext}", timestamp_slug());

        let description = format!("{} layer image", kind.label());
        let path = match ctx.store.save_bytes_in(
            IMAGES_DIR,
            &saved_name,
            &downloaded.bytes,
            &ext,
            &description,
        ) {
            Ok(path) => path,
            Err(err) => {
                return fail(
                    format!("failed saving {saved_name}: {err}"),
                    resolved,
                    generated.provider_request,
                    generated.provider_response,
                )
            }
        };

        let mut provider_response = generated.provider_response;
        provider_response.insert("bytes".to_string(), json!(downloaded.bytes.len()));
        provider_response.insert("mime_type".to_string(), json!(downloaded.mime_type));
        let paths = vec![path];
        record_receipt(
            ctx,
            spec,
            ReceiptInput {
                resolved,
                provider_request: generated.provider_request,
                provider_response,
                warnings: &warnings,
                paths: &paths,
                status: "succeeded",
            },
        );
        succeeded(
            spec,
            prompt.value.clone(),
            saved_name,
            Produced {
                paths,
                bytes: downloaded.bytes.len() as u64,
                sha256: Some(sha256_hex(&downloaded.bytes)),
                size: real_size.or(Some(size.value)),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::agent::{AgentModel, AgentRequest};
    use crate::cancel::CancelToken;
    use crate::error::{BannerError, BannerResult};
    use crate::imagegen::{DownloadedImage, DryrunImageGenerator, GeneratedImage};
    use crate::store::ProjectStore;

    struct SilentAgent;

    impl AgentModel for SilentAgent {
        fn name(&self) -> &str {
            "silent"
        }

        fn invoke(&self, _request: &AgentRequest) -> BannerResult<String> {
            Ok(String::new())
        }
    }

    struct BrokenDownloads;

    impl ImageGenerator for BrokenDownloads {
        fn name(&self) -> &str {
            "broken"
        }

        fn generate(&self, prompt: &str, _width: u32, _height: u32) -> BannerResult<GeneratedImage> {
            Ok(GeneratedImage {
                url: format!("https://images.invalid/{prompt}"),
                provider_request: Map::new(),
                provider_response: Map::new(),
            })
        }

        fn download(&self, _url: &str) -> BannerResult<DownloadedImage> {
            Err(BannerError::Download("timed out after 30s".to_string()))
        }
    }

    fn context<'a>(
        store: &'a ProjectStore,
        design: &'a str,
        cancel: &'a CancelToken,
    ) -> GenerationContext<'a> {
        GenerationContext {
            agent: &SilentAgent,
            store,
            design_text: design,
            banner_size: (1200, 600),
            cancel,
        }
    }

    #[test]
    fn background_uses_design_size_and_records_real_dimensions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let cancel = CancelToken::new();
        let design = r#"{"layers": {"背景层": {"input": "sunset over a calm sea", "output": ["sea.jpg"], "specifications": {"size": "800x400"}}}}"#;
        let spec = LayerSpec::default_for(LayerKind::Background);

        let generator = DryrunImageGenerator;
        let material = RasterGenerator::new(&generator).generate(&context(&store, design, &cancel), &spec);

        assert!(material.succeeded(), "{:?}", material.failure_reason());
        assert_eq!(material.prompt, "sunset over a calm sea");
        assert_eq!((material.width, material.height), (Some(800), Some(400)));
        assert!(material.filename.starts_with("background_sea_"));
        assert!(material.filename.ends_with(".png"));
        let path = material.primary_path().cloned().unwrap_or_default();
        assert!(path.starts_with(temp.path().join("images")));
        assert_eq!(fs::metadata(&path)?.len(), material.bytes);
        Ok(())
    }

    #[test]
    fn download_failure_keeps_attempted_parameters() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ProjectStore::create(temp.path(), "p")?;
        let cancel = CancelToken::new();
        let spec = LayerSpec::default_for(LayerKind::Background);

        let generator = BrokenDownloads;
        let material = RasterGenerator::new(&generator).generate(&context(&store, "", &cancel), &spec);

        assert!(!material.succeeded());
        assert!(material.failure_reason().unwrap_or("").contains("timed out"));
        assert_eq!((material.width, material.height), (Some(1024), Some(768)));
        assert_eq!(material.filename, "background.png");
        assert!(material.paths.is_empty());
        assert!(store.manifest().entries().is_empty());
        Ok(())
    }

    #[test]
    fn default_prompts_follow_the_layer() {
        let background = LayerSpec::default_for(LayerKind::Background);
        assert_eq!(default_prompt(&background), DEFAULT_BACKGROUND_PROMPT);
        let hero = LayerSpec::default_for(LayerKind::MainElement);
        assert!(default_prompt(&hero).starts_with(&hero.intent));
    }
}
