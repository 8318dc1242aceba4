//! Staged banner pipeline: six ordered LLM stages, per-layer material
//! generators and a bounded render/score/rewrite loop, all recorded into one
//! work directory.

pub mod agent;
pub mod cancel;
pub mod compose;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod generators;
pub mod imagegen;
pub mod optimize;
pub mod pipeline;
pub mod prompts;
pub mod render;
pub mod routing;
pub mod scoring;
pub mod store;

use std::path::{Path, PathBuf};

use banner_contracts::layers::LayerSpec;
use banner_contracts::materials::{CompositionArtifact, GeneratedMaterial};
use banner_contracts::models::ModelSelector;
use banner_contracts::runs::{write_final_report, FinalReport, ProgressStatus};
use banner_contracts::stages::{PhaseLedger, PhaseResult};
use banner_contracts::verdict::ValidationVerdict;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub use agent::{AgentModel, AgentRequest, AgentTask, Capability, DryrunAgent, OpenAiCompatibleAgent};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use error::{BannerError, BannerResult};
pub use imagegen::{
    default_generator_registry, DownloadedImage, DryrunImageGenerator, GeneratedImage,
    ImageGenerator, ImageGeneratorRegistry, PollinationsGenerator,
};
pub use optimize::{LoopOutcome, LoopStatus};
pub use render::{ChromeRenderer, DryrunRenderer, Renderer};

use crate::optimize::OptimizationLoop;
use crate::store::ProjectStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerRequest {
    pub event_name: String,
    #[serde(default)]
    pub requirements: String,
}

impl BannerRequest {
    pub fn new(event_name: impl Into<String>, requirements: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            requirements: requirements.into(),
        }
    }
}

/// Identity of one run. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub request: BannerRequest,
}

impl ProjectContext {
    pub fn new(work_root: &Path, request: BannerRequest) -> Self {
        let project_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let dir_name = format!(
            "{}_{}_{}",
            project_slug(&request.event_name),
            created_at.format("%Y%m%d_%H%M%S"),
            &project_id[..8]
        );
        Self {
            project_id,
            work_dir: work_root.join(dir_name),
            created_at,
            request,
        }
    }

    pub fn to_info(&self) -> Value {
        json!({
            "project_id": self.project_id,
            "event_name": self.request.event_name,
            "requirements": self.request.requirements,
            "work_dir": self.work_dir.to_string_lossy(),
            "created_at": self.created_at.to_rfc3339_opts(SecondsFormat::Micros, false),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Everything a run produced, including partial results when it stopped
/// early.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub project: Option<ProjectContext>,
    pub phases: Vec<PhaseResult>,
    pub layers: Vec<LayerSpec>,
    pub materials: Vec<GeneratedMaterial>,
    pub artifacts: Vec<CompositionArtifact>,
    pub verdicts: Vec<ValidationVerdict>,
    pub loop_status: Option<LoopStatus>,
    pub final_html_path: Option<PathBuf>,
    pub failures: Vec<String>,
    pub error: Option<String>,
}

impl RunOutcome {
    fn rejected(project: Option<ProjectContext>, message: String) -> Self {
        Self {
            status: RunStatus::Error,
            project,
            phases: Vec::new(),
            layers: Vec::new(),
            materials: Vec::new(),
            artifacts: Vec::new(),
            verdicts: Vec::new(),
            loop_status: None,
            final_html_path: None,
            failures: vec![message.clone()],
            error: Some(message),
        }
    }
}

/// Mutable state threaded through the stages of one run.
#[derive(Debug, Default)]
pub struct RunState {
    pub ledger: PhaseLedger,
    pub layers: Vec<LayerSpec>,
    pub materials: Vec<GeneratedMaterial>,
    pub artifacts: Vec<CompositionArtifact>,
    pub verdicts: Vec<ValidationVerdict>,
    pub loop_status: Option<LoopStatus>,
    pub final_html_path: Option<PathBuf>,
    pub failures: Vec<String>,
}

/// Read-only collaborators shared by every stage of one run.
pub struct RunContext<'a> {
    pub config: &'a EngineConfig,
    pub agent: &'a dyn AgentModel,
    pub images: &'a dyn ImageGenerator,
    pub renderer: &'a dyn Renderer,
    pub store: &'a ProjectStore,
    pub project: &'a ProjectContext,
    pub cancel: &'a CancelToken,
}

pub struct BannerEngine {
    config: EngineConfig,
    agent: Box<dyn AgentModel>,
    images: ImageGeneratorRegistry,
    renderer: Box<dyn Renderer>,
    cancel: CancelToken,
}

impl BannerEngine {
    pub fn new(
        config: EngineConfig,
        agent: Box<dyn AgentModel>,
        images: ImageGeneratorRegistry,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            agent,
            images,
            renderer,
            cancel: CancelToken::new(),
        }
    }

    /// Builds the live (or, with `dryrun`, offline) collaborators from config.
    pub fn from_config(mut config: EngineConfig) -> BannerResult<Self> {
        let images = default_generator_registry(config.http_timeout_secs);
        if config.dryrun {
            config.image_provider = "dryrun".to_string();
            return Ok(Self::new(
                config,
                Box::new(DryrunAgent::new()),
                images,
                Box::new(DryrunRenderer),
            ));
        }
        let agent = OpenAiCompatibleAgent::new(&config, &ModelSelector::default())?;
        let renderer = ChromeRenderer::discover(
            config.renderer_binary.clone(),
            config.render_timeout_secs,
        );
        Ok(Self::new(config, Box::new(agent), images, Box::new(renderer)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the whole pipeline. Never panics and never returns an error:
    /// failures end up in the outcome and in `final_report.json`.
    pub fn run(&self, request: BannerRequest) -> RunOutcome {
        if request.event_name.trim().is_empty() {
            return RunOutcome::rejected(None, "event name must not be empty".to_string());
        }
        let Some(images) = self.images.get(&self.config.image_provider) else {
            return RunOutcome::rejected(
                None,
                format!(
                    "unknown image provider `{}` (available: {})",
                    self.config.image_provider,
                    self.images.names().join(", ")
                ),
            );
        };

        let project = ProjectContext::new(&self.config.work_root, request);
        let span = info_span!("banner.run", project_id = %project.project_id);
        let _entered = span.enter();

        let store = match ProjectStore::create(&project.work_dir, &project.project_id) {
            Ok(store) => store,
            Err(err) => {
                tracing::error!(event = "work_dir_failed", error = %err);
                return RunOutcome::rejected(Some(project), err.to_string());
            }
        };
        if let Err(err) = store.write_json("project_info.json", &project.to_info()) {
            warn!(event = "project_info_failed", error = %err);
        }
        info!(
            event = "run_started",
            work_dir = %project.work_dir.display(),
            event_name = %project.request.event_name,
        );
        store.record_progress("run", ProgressStatus::Started, &project.request.event_name);

        let ctx = RunContext {
            config: &self.config,
            agent: self.agent.as_ref(),
            images,
            renderer: self.renderer.as_ref(),
            store: &store,
            project: &project,
            cancel: &self.cancel,
        };
        let mut state = RunState::default();
        let result = drive(&ctx, &mut state);

        let (status, error_text) = match (&result, state.loop_status) {
            (Err(err), _) => (RunStatus::Error, Some(err.to_string())),
            (Ok(()), Some(LoopStatus::Cancelled)) => {
                (RunStatus::Error, Some(BannerError::Cancelled.to_string()))
            }
            (Ok(()), _) => (RunStatus::Success, None),
        };
        if let Some(text) = &error_text {
            state.failures.push(format!("run: {text}"));
        }
        finish_run(&ctx, &state, status);

        RunOutcome {
            status,
            project: Some(project.clone()),
            phases: state.ledger.results().to_vec(),
            layers: state.layers,
            materials: state.materials,
            artifacts: state.artifacts,
            verdicts: state.verdicts,
            loop_status: state.loop_status,
            final_html_path: state.final_html_path,
            failures: state.failures,
            error: error_text,
        }
    }
}

fn drive(ctx: &RunContext<'_>, state: &mut RunState) -> BannerResult<()> {
    pipeline::run_stages(ctx, state)?;
    if !state.ledger.is_complete() {
        return Err(BannerError::Generation(format!(
            "pipeline stopped after {} stages",
            state.ledger.results().len()
        )));
    }
    let Some(initial) = state.artifacts.first().cloned() else {
        return Err(BannerError::Render("no composition to optimize".to_string()));
    };
    state.final_html_path = Some(initial.html_path.clone());

    let outcome = OptimizationLoop::new(ctx).run(initial)?;
    state.loop_status = Some(outcome.status);
    if let Some(path) = &outcome.final_html_path {
        state.final_html_path = Some(path.clone());
    }
    if let Some(note) = outcome.status.failure_note() {
        state.failures.push(format!("optimization: {note}"));
    }
    state.verdicts = outcome.verdicts;
    // Loop artifacts start with the initial composition.
    state.artifacts = outcome.artifacts;
    Ok(())
}

fn finish_run(ctx: &RunContext<'_>, state: &RunState, status: RunStatus) {
    let store = ctx.store;
    let stages: Vec<Map<String, Value>> = state
        .ledger
        .results()
        .iter()
        .map(|row| {
            map_object(json!({
                "stage": row.stage.key(),
                "status": row.status,
                "created_at": row.created_at.to_rfc3339_opts(SecondsFormat::Micros, false),
                "error": if row.is_completed() { Value::Null } else { Value::String(row.raw_output.clone()) },
            }))
        })
        .collect();
    let layers: Vec<Map<String, Value>> = state
        .materials
        .iter()
        .map(|material| {
            map_object(json!({
                "layer": material.layer.key(),
                "modality": material.modality.as_str(),
                "status": material.status,
                "paths": material.paths,
                "bytes": material.bytes,
                "prompt": truncate_text(&material.prompt, 240),
            }))
        })
        .collect();

    let summary = json!({
        "project": ctx.project.to_info(),
        "stages": stages,
        "layers": state.layers.iter().map(LayerSpec::to_plan_entry).collect::<Vec<Value>>(),
        "materials": state.materials,
        "artifacts": state.artifacts.iter().map(|artifact| json!({
            "iteration": artifact.iteration,
            "html_path": artifact.html_path,
            "referenced_materials": artifact.referenced_materials,
        })).collect::<Vec<Value>>(),
        "verdicts": state.verdicts,
    });
    if let Err(err) = store.save_artifact(
        &serde_json::to_string_pretty(&summary).unwrap_or_default(),
        "intermediate_results_summary.json",
        "json",
        "Summary of every stage, layer and iteration",
    ) {
        warn!(event = "summary_write_failed", error = %err);
    }

    let report = FinalReport {
        project_id: ctx.project.project_id.clone(),
        event_name: ctx.project.request.event_name.clone(),
        requirements: ctx.project.request.requirements.clone(),
        work_dir: ctx.project.work_dir.to_string_lossy().to_string(),
        status: status.as_str().to_string(),
        started_at: ctx.project.created_at.to_rfc3339_opts(SecondsFormat::Micros, false),
        stages,
        layers,
        iterations: state.verdicts.len() as u64,
        final_score: state.verdicts.last().map(|verdict| verdict.score),
        final_html_path: state
            .final_html_path
            .as_ref()
            .map(|path| path.to_string_lossy().to_string()),
        failures: state.failures.clone(),
    };
    let extra = state
        .loop_status
        .map(|loop_status| map_object(json!({ "loop_status": loop_status })));
    if let Err(err) = write_final_report(
        &store.root().join("final_report.json"),
        &report,
        extra.as_ref(),
    ) {
        tracing::error!(event = "final_report_failed", error = %err);
    }

    let progress_status = match status {
        RunStatus::Success => ProgressStatus::Completed,
        RunStatus::Error => ProgressStatus::Failed,
    };
    store.record_progress("run", progress_status, status.as_str());
    store.emit(
        "run_finished",
        map_object(json!({
            "status": status.as_str(),
            "failures": state.failures.len(),
            "iterations": state.verdicts.len(),
        })),
    );
    info!(event = "run_finished", status = status.as_str(), failures = state.failures.len());
}

fn project_slug(event_name: &str) -> String {
    let slug: String = event_name
        .trim()
        .chars()
        .map(|ch| if ch.is_whitespace() { '_' } else { ch })
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-'))
        .take(40)
        .collect();
    if slug.is_empty() {
        "banner".to_string()
    } else {
        slug
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Drops one surrounding ``` fence (with optional language tag) if present.
pub(crate) fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
