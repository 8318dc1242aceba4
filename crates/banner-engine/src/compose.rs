//! HTML composition of the generated layers.

use std::path::{Path, PathBuf};

use banner_contracts::layers::LayerKind;
use banner_contracts::materials::{CompositionArtifact, GeneratedMaterial};
use banner_contracts::stages::Stage;
use chrono::Utc;
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentTask};
use crate::error::BannerResult;
use crate::extract::{extract, ExtractionSource, MarkupGrammar, Route};
use crate::prompts::{CompositionPrompt, StagePrompt};
use crate::store::HISTORY_DIR;
use crate::RunContext;

/// A successful material as the HTML sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub layer: LayerKind,
    /// Relative to `web/`, e.g. `assets/svg/logo_wave.svg`.
    pub href: String,
    pub source: PathBuf,
}

/// Successful materials in stacking order, bottom layer first.
pub fn asset_refs(materials: &[GeneratedMaterial]) -> Vec<AssetRef> {
    let mut refs: Vec<AssetRef> = materials
        .iter()
        .filter(|material| material.succeeded())
        .flat_map(|material| {
            material.paths.iter().filter_map(move |path| {
                let name = path.file_name()?.to_str()?;
                Some(AssetRef {
                    layer: material.layer,
                    href: format!("assets/{}/{name}", material.modality.dir_name()),
                    source: path.clone(),
                })
            })
        })
        .collect();
    refs.sort_by_key(|asset| asset.layer.stack_index());
    refs
}

pub fn materials_listing(refs: &[AssetRef]) -> String {
    refs.iter()
        .map(|asset| {
            format!(
                "- {} ({}): {}",
                asset.layer.label(),
                asset.layer.key(),
                asset.href
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Material files whose names appear in `html`.
pub fn referenced_in(html: &str, candidates: &[PathBuf]) -> Vec<PathBuf> {
    candidates
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| html.contains(name))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Result of the composition stage. The artifact always exists; the model
/// fields say whether it came from the model or the fallback layout.
#[derive(Debug, Clone)]
pub struct Composition {
    pub artifact: CompositionArtifact,
    pub reply: Option<String>,
    pub error: Option<String>,
}

impl Composition {
    pub fn used_fallback(&self) -> bool {
        self.error.is_some()
    }
}

pub fn compose(
    ctx: &RunContext<'_>,
    context: &str,
    materials: &[GeneratedMaterial],
) -> BannerResult<Composition> {
    let (width, height) = (ctx.config.banner_width, ctx.config.banner_height);
    let refs = asset_refs(materials);
    let event_name = &ctx.project.request.event_name;

    let rendered = CompositionPrompt {
        event_name: event_name.clone(),
        width,
        height,
        materials: materials_listing(&refs),
        context: context.to_string(),
    }
    .render()?;
    let request = AgentRequest::new(
        Stage::HtmlComposition.capability(),
        AgentTask::Stage(Stage::HtmlComposition),
        CompositionPrompt::SYSTEM,
        rendered,
    );

    let (reply, extracted) = match ctx.agent.invoke(&request) {
        Ok(reply) => {
            let found = extract(
                Some(ctx.agent),
                &MarkupGrammar::html(),
                &reply,
                Route::SyntacticFirst,
                Vec::new,
            );
            let html = match found.source {
                ExtractionSource::Default => None,
                _ => found.value.into_iter().next(),
            };
            let html = html.ok_or_else(|| "no HTML document in composition reply".to_string());
            (Some(reply), html)
        }
        Err(err) => (None, Err(err.to_string())),
    };

    let (html, error) = match extracted {
        Ok(html) => (html, None),
        Err(error) => {
            warn!(event = "composition_fallback", reason = %error, layers = refs.len());
            (fallback_html(event_name, width, height, &refs), Some(error))
        }
    };

    match ctx.store.mirror_assets() {
        Ok(copied) => info!(event = "assets_mirrored", files = copied),
        Err(err) => warn!(event = "assets_mirror_failed", error = %err),
    }
    let html_path = ctx.store.save_artifact(
        &html,
        "banner.html",
        "html",
        "Initial banner composition",
    )?;
    ctx.store.write_file(
        &format!("{HISTORY_DIR}/initial_banner.html"),
        html.as_bytes(),
    )?;

    let candidates: Vec<PathBuf> = refs.iter().map(|asset| asset.source.clone()).collect();
    let artifact = CompositionArtifact {
        iteration: 0,
        referenced_materials: referenced_in(&html, &candidates),
        html,
        html_path,
        created_at: Utc::now(),
    };
    Ok(Composition {
        artifact,
        reply,
        error,
    })
}

/// Deterministic layout stacking every asset as a full-size layer.
pub fn fallback_html(event_name: &str, width: u32, height: u32, refs: &[AssetRef]) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", escape_html(event_name)));
    html.push_str("<style>\nhtml, body { margin: 0; padding: 0; }\n");
    html.push_str(&format!(
        ".banner {{ position: relative; width: {width}px; height: {height}px; overflow: hidden; }}\n"
    ));
    html.push_str(".layer { position: absolute; left: 0; top: 0; width: 100%; height: 100%; object-fit: cover; }\n");
    html.push_str("</style>\n</head>\n<body>\n<div class=\"banner\">\n");
    for (index, asset) in refs.iter().enumerate() {
        html.push_str(&format!(
            "<img class=\"layer layer-{key}\" style=\"z-index: {index}\" src=\"{href}\" alt=\"{key}\">\n",
            key = asset.layer.key(),
            href = escape_html(&asset.href),
        ));
    }
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Copy of `html` with a `<base>` pointing at `web_dir`, so relative asset
/// references resolve when the file is opened from elsewhere.
pub fn with_base_href(html: &str, web_dir: &Path) -> String {
    let base = format!("<base href=\"file://{}/\">", web_dir.display());
    let lower = html.to_ascii_lowercase();
    for tag in ["<head", "<html"] {
        if let Some(start) = lower.find(tag) {
            if let Some(end) = lower[start..].find('>') {
                let at = start + end + 1;
                return format!("{}\n{base}{}", &html[..at], &html[at..]);
            }
        }
    }
    format!("{base}\n{html}")
}

#[cfg(test)]
mod tests {
    use banner_contracts::layers::Modality;

    use super::*;
    use crate::extract::Grammar;

    fn material(layer: LayerKind, modality: Modality, path: &str) -> GeneratedMaterial {
        let mut material = GeneratedMaterial::failed(layer, "p", "f", None, "pending");
        material.modality = modality;
        material.paths = vec![PathBuf::from(path)];
        material.status = banner_contracts::materials::MaterialStatus::Succeeded;
        material
    }

    #[test]
    fn assets_skip_failures_and_follow_stacking_order() {
        let text = material(LayerKind::Text, Modality::Vector, "/w/svg/text_title.svg");
        let background = material(LayerKind::Background, Modality::Raster, "/w/images/background_1.png");
        let failed = GeneratedMaterial::failed(LayerKind::Logo, "p", "logo.svg", None, "quota");

        let refs = asset_refs(&[text, failed, background]);
        let hrefs: Vec<&str> = refs.iter().map(|asset| asset.href.as_str()).collect();
        assert_eq!(hrefs, vec!["assets/images/background_1.png", "assets/svg/text_title.svg"]);
        assert!(materials_listing(&refs).contains("(background): assets/images/background_1.png"));
    }

    #[test]
    fn fallback_stacks_every_asset_at_banner_size() {
        let refs = asset_refs(&[
            material(LayerKind::Background, Modality::Raster, "/w/images/bg.png"),
            material(LayerKind::Logo, Modality::Vector, "/w/svg/logo.svg"),
        ]);
        let html = fallback_html("Summer <Sale>", 1200, 600, &refs);
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>Summer &lt;Sale&gt;</title>"));
        assert!(html.contains("width: 1200px; height: 600px"));
        assert!(html.contains("style=\"z-index: 0\" src=\"assets/images/bg.png\""));
        assert!(html.contains("style=\"z-index: 1\" src=\"assets/svg/logo.svg\""));
        assert!(MarkupGrammar::html().parse(&html).is_some());
    }

    #[test]
    fn base_href_goes_inside_head() {
        let html = "<!DOCTYPE html><html><HEAD><title>x</title></HEAD><body></body></html>";
        let based = with_base_href(html, Path::new("/tmp/run/web"));
        assert!(based.contains("<HEAD>\n<base href=\"file:///tmp/run/web/\"><title>"));

        let bare = with_base_href("<div>x</div>", Path::new("/w"));
        assert!(bare.starts_with("<base href=\"file:///w/\">"));
    }

    #[test]
    fn referenced_materials_are_matched_by_file_name() {
        let candidates = vec![PathBuf::from("/w/svg/a.svg"), PathBuf::from("/w/images/b.png")];
        let found = referenced_in("<img src=\"assets/images/b.png\">", &candidates);
        assert_eq!(found, vec![PathBuf::from("/w/images/b.png")]);
    }
}
