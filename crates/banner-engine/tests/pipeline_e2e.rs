use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use banner_engine::{
    AgentModel, AgentRequest, AgentTask, BannerEngine, BannerError, BannerRequest, BannerResult,
    CancelToken, DownloadedImage, DryrunAgent, EngineConfig, GeneratedImage, ImageGenerator,
    ImageGeneratorRegistry, LoopStatus, Renderer, RunStatus,
};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Map, Value};

/// Dryrun stage replies with a fixed review score; every optimization
/// request returns a new revision of the page.
struct ScriptedAgent {
    inner: DryrunAgent,
    revisions: AtomicUsize,
}

impl ScriptedAgent {
    fn scoring(score: f64) -> Self {
        Self {
            inner: DryrunAgent::with_score(score),
            revisions: AtomicUsize::new(0),
        }
    }
}

impl AgentModel for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn invoke(&self, request: &AgentRequest) -> BannerResult<String> {
        match request.task {
            AgentTask::HtmlOptimization => {
                let revision = self.revisions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!(
                    "Improved:\n```html\n<!DOCTYPE html>\n<html><body><h1>revision {revision}</h1></body></html>\n```"
                ))
            }
            _ => self.inner.invoke(request),
        }
    }
}

struct StubImages {
    fail: bool,
}

impl ImageGenerator for StubImages {
    fn name(&self) -> &str {
        "stub"
    }

    fn generate(&self, prompt: &str, width: u32, height: u32) -> BannerResult<GeneratedImage> {
        if self.fail {
            return Err(BannerError::Generation("stub provider is down".to_string()));
        }
        let mut request = Map::new();
        request.insert("prompt".to_string(), json!(prompt));
        Ok(GeneratedImage {
            url: format!("stub://image?w={width}&h={height}"),
            provider_request: request,
            provider_response: Map::new(),
        })
    }

    fn download(&self, _url: &str) -> BannerResult<DownloadedImage> {
        let mut bytes = Cursor::new(Vec::new());
        RgbImage::from_pixel(96, 48, Rgb([200, 120, 40]))
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|err| BannerError::Download(err.to_string()))?;
        Ok(DownloadedImage {
            bytes: bytes.into_inner(),
            mime_type: Some("image/png".to_string()),
        })
    }
}

#[derive(Clone, Default)]
struct StubRenderer {
    renders: Arc<AtomicUsize>,
    broken: bool,
}

impl Renderer for StubRenderer {
    fn render(&self, html_path: &Path, output_path: &Path, _width: u32, _height: u32) -> BannerResult<()> {
        if self.broken {
            return Err(BannerError::Render("browser not found".to_string()));
        }
        if !html_path.is_file() {
            return Err(BannerError::Render(format!("missing {}", html_path.display())));
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        fs::write(output_path, b"\x89PNG stub")?;
        Ok(())
    }
}

fn engine(
    work_root: &Path,
    agent: ScriptedAgent,
    images: StubImages,
    renderer: StubRenderer,
    max_iterations: u32,
) -> BannerEngine {
    let config = EngineConfig {
        work_root: work_root.to_path_buf(),
        image_provider: "stub".to_string(),
        max_iterations,
        ..EngineConfig::default()
    };
    let mut registry = ImageGeneratorRegistry::new();
    registry.register(images);
    BannerEngine::new(config, Box::new(agent), registry, Box::new(renderer))
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[test]
fn passing_review_accepts_the_first_composition() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let renderer = StubRenderer::default();
    let engine = engine(
        temp.path(),
        ScriptedAgent::scoring(8.0),
        StubImages { fail: false },
        renderer.clone(),
        5,
    );

    let outcome = engine.run(BannerRequest::new("SummerSale", ""));

    assert_eq!(outcome.status, RunStatus::Success, "{:?}", outcome.error);
    assert_eq!(outcome.phases.len(), 6);
    assert_eq!(outcome.materials.len(), 6);
    assert!(outcome.materials.iter().all(|material| material.succeeded()));
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.verdicts.len(), 1);
    assert_eq!(outcome.loop_status, Some(LoopStatus::Accepted));
    assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);

    let work_dir = outcome
        .project
        .as_ref()
        .map(|project| project.work_dir.clone())
        .unwrap_or_default();
    for relative in [
        "project_info.json",
        "documents/event_analysis.md",
        "documents/layer_routing_plan.json",
        "documents/layer_generation.json",
        "web/banner.html",
        "optimization_history/initial_banner.html",
        "optimization_history/optimization_summary.json",
        "final_report.json",
    ] {
        assert!(work_dir.join(relative).is_file(), "missing {relative}");
    }
    assert!(!work_dir.join("web/banner_optimized.html").exists());

    let banner = fs::read_to_string(work_dir.join("web/banner.html"))?;
    let raster = outcome
        .materials
        .iter()
        .find(|material| material.layer.key() == "background")
        .and_then(|material| material.primary_path())
        .and_then(|path| path.file_name())
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    assert!(banner.contains(&format!("assets/images/{raster}")));
    assert!(work_dir.join("web/assets/images").join(&raster).is_file());

    let report = read_json(&work_dir.join("final_report.json"))?;
    assert_eq!(report["status"], json!("success"));
    assert_eq!(report["results"]["optimization"]["total_iterations"], json!(1));
    assert_eq!(report["loop_status"], json!("accepted"));

    let events = fs::read_to_string(work_dir.join("events.jsonl"))?;
    let started = events
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| event["type"] == json!("stage_started"))
        .count();
    assert_eq!(started, 6);
    Ok(())
}

#[test]
fn low_scores_iterate_to_the_bound() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let engine = engine(
        temp.path(),
        ScriptedAgent::scoring(5.0),
        StubImages { fail: false },
        StubRenderer::default(),
        3,
    );

    let outcome = engine.run(BannerRequest::new("SummerSale", ""));

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.loop_status, Some(LoopStatus::Exhausted));
    assert_eq!(outcome.artifacts.len(), 3);
    assert_eq!(outcome.verdicts.len(), 3);
    assert!(outcome.verdicts.iter().all(|verdict| verdict.needs_optimization));

    let work_dir = outcome
        .project
        .as_ref()
        .map(|project| project.work_dir.clone())
        .unwrap_or_default();
    let summary = read_json(&work_dir.join("optimization_history/optimization_summary.json"))?;
    assert_eq!(summary["total_iterations"], json!(3));
    assert_eq!(summary["final_score"], json!(5.0));
    assert_eq!(
        outcome.final_html_path,
        Some(work_dir.join("web/banner_optimized.html"))
    );
    let optimized = fs::read_to_string(work_dir.join("web/banner_optimized.html"))?;
    assert!(optimized.contains("revision 2"));
    Ok(())
}

#[test]
fn raster_outage_degrades_only_the_raster_layers() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let engine = engine(
        temp.path(),
        ScriptedAgent::scoring(8.0),
        StubImages { fail: true },
        StubRenderer::default(),
        2,
    );

    let outcome = engine.run(BannerRequest::new("SummerSale", "warm colors"));

    assert_eq!(outcome.status, RunStatus::Success);
    let failed: Vec<&str> = outcome
        .materials
        .iter()
        .filter(|material| !material.succeeded())
        .map(|material| material.layer.key())
        .collect();
    assert_eq!(failed, vec!["background", "main_element"]);
    assert!(outcome
        .failures
        .iter()
        .any(|line| line.contains("layer background") && line.contains("stub provider is down")));

    let html = outcome
        .artifacts
        .first()
        .map(|artifact| artifact.html.clone())
        .unwrap_or_default();
    assert!(!html.contains("assets/images/"));
    assert!(html.contains("assets/svg/"));
    Ok(())
}

#[test]
fn render_failure_keeps_the_initial_banner() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let renderer = StubRenderer {
        broken: true,
        ..StubRenderer::default()
    };
    let engine = engine(
        temp.path(),
        ScriptedAgent::scoring(8.0),
        StubImages { fail: false },
        renderer,
        5,
    );

    let outcome = engine.run(BannerRequest::new("SummerSale", ""));

    assert_eq!(outcome.loop_status, Some(LoopStatus::RenderFailed));
    assert!(outcome.verdicts.is_empty());
    assert!(outcome
        .final_html_path
        .as_ref()
        .map(|path| path.ends_with("web/banner.html"))
        .unwrap_or(false));
    assert!(outcome.failures.iter().any(|line| line.starts_with("optimization:")));
    Ok(())
}

#[test]
fn cancelled_run_still_writes_a_final_report() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let cancel = CancelToken::new();
    cancel.cancel();
    let engine = engine(
        temp.path(),
        ScriptedAgent::scoring(8.0),
        StubImages { fail: false },
        StubRenderer::default(),
        5,
    )
    .with_cancel_token(cancel);

    let outcome = engine.run(BannerRequest::new("SummerSale", ""));

    assert_eq!(outcome.status, RunStatus::Error);
    assert!(outcome.phases.is_empty());
    let work_dir = outcome
        .project
        .as_ref()
        .map(|project| project.work_dir.clone())
        .unwrap_or_default();
    let report = read_json(&work_dir.join("final_report.json"))?;
    assert_eq!(report["status"], json!("error"));
    Ok(())
}
