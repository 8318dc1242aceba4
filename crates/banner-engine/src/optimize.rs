//! Render, score and rewrite the composed banner until the vision model is
//! satisfied or the iteration budget runs out.

use std::path::{Path, PathBuf};

use banner_contracts::materials::CompositionArtifact;
use banner_contracts::runs::OptimizationHistory;
use banner_contracts::verdict::ValidationVerdict;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentTask, Capability};
use crate::compose::{referenced_in, with_base_href};
use crate::error::{BannerError, BannerResult};
use crate::extract::{extract, ExtractionSource, MarkupGrammar, Route};
use crate::prompts::{OptimizationPrompt, ScoringPrompt, StagePrompt};
use crate::scoring::parse_verdict;
use crate::store::{DEBUG_DIR, HISTORY_DIR, WEB_DIR};
use crate::{map_object, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// The last verdict did not ask for more work.
    Accepted,
    /// Still below the bar after `max_iterations`.
    Exhausted,
    RenderFailed,
    ScoringFailed,
    Cancelled,
}

impl LoopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Exhausted => "exhausted",
            Self::RenderFailed => "render_failed",
            Self::ScoringFailed => "scoring_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn failure_note(self) -> Option<&'static str> {
        match self {
            Self::Accepted | Self::Exhausted => None,
            Self::RenderFailed => Some("rendering failed; kept the last rendered composition"),
            Self::ScoringFailed => Some("vision scoring failed; kept the last composition"),
            Self::Cancelled => Some("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    /// Every composition seen, the initial one first.
    pub artifacts: Vec<CompositionArtifact>,
    pub verdicts: Vec<ValidationVerdict>,
    pub final_html_path: Option<PathBuf>,
}

pub struct OptimizationLoop<'r, 'a> {
    ctx: &'r RunContext<'a>,
}

impl<'r, 'a> OptimizationLoop<'r, 'a> {
    pub fn new(ctx: &'r RunContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn run(&self, initial: CompositionArtifact) -> BannerResult<LoopOutcome> {
        let ctx = self.ctx;
        let max_iterations = ctx.config.max_iterations.max(1);
        let mut history = OptimizationHistory::new(
            ctx.store.dir(HISTORY_DIR).join("optimization_summary.json"),
            &initial.html_path,
        );
        let mut artifacts = vec![initial.clone()];
        let mut verdicts: Vec<ValidationVerdict> = Vec::new();
        let mut current = initial.clone();
        let mut last_rendered = initial.clone();
        let mut status = LoopStatus::Exhausted;

        for iteration in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                status = LoopStatus::Cancelled;
                break;
            }
            info!(event = "iteration_started", iteration, html = %current.html_path.display());
            let record = history.begin_iteration(iteration, &current.html, &current.html_path);

            let screenshot = match self.render(iteration, &current) {
                Ok(path) => path,
                Err(err) => {
                    warn!(event = "render_failed", iteration, error = %err);
                    record.note = Some(format!("render failed: {err}"));
                    status = LoopStatus::RenderFailed;
                    break;
                }
            };
            record.screenshot_path = Some(screenshot.to_string_lossy().to_string());
            last_rendered = current.clone();

            let verdict = match self.score(iteration, &screenshot) {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(event = "scoring_failed", iteration, error = %err);
                    record.note = Some(format!("scoring failed: {err}"));
                    status = LoopStatus::ScoringFailed;
                    break;
                }
            };
            info!(
                event = "iteration_scored",
                iteration,
                score = verdict.score,
                needs_optimization = verdict.needs_optimization,
            );
            self.record_verdict(&verdict, &screenshot);
            record.verdict = Some(verdict.clone());
            verdicts.push(verdict.clone());

            if !verdict.needs_optimization {
                status = LoopStatus::Accepted;
                break;
            }
            if iteration + 1 >= max_iterations {
                status = LoopStatus::Exhausted;
                break;
            }

            record.optimization_attempted = true;
            match self.optimize(iteration, &current, &verdict) {
                Ok(next) => {
                    record.optimized_html_path = Some(next.html_path.to_string_lossy().to_string());
                    ctx.store.emit(
                        "optimization_applied",
                        map_object(json!({
                            "iteration": next.iteration,
                            "html_path": next.html_path,
                            "previous_score": verdict.score,
                        })),
                    );
                    artifacts.push(next.clone());
                    current = next;
                }
                Err(err) => {
                    warn!(event = "optimization_skipped", iteration, error = %err);
                    record.note = Some(format!("optimization skipped: {err}"));
                }
            }
        }

        // A rewrite that never rendered is not a result.
        let kept = if status == LoopStatus::RenderFailed {
            &last_rendered
        } else {
            &current
        };
        let mut final_html_path = kept.html_path.clone();
        if kept.html != initial.html {
            match ctx.store.save_artifact(
                &kept.html,
                "banner_optimized.html",
                "html",
                "Banner after vision feedback optimization",
            ) {
                Ok(path) => final_html_path = path,
                Err(err) => warn!(event = "optimized_write_failed", error = %err),
            }
        }

        let mut extra = Map::new();
        extra.insert("status".to_string(), json!(status.as_str()));
        extra.insert("final_html_path".to_string(), json!(final_html_path));
        if let Err(err) = history.save(Some(&extra)) {
            warn!(event = "history_write_failed", error = %err);
        }
        info!(
            event = "optimization_finished",
            status = status.as_str(),
            iterations = history.total_iterations(),
            final_score = ?history.final_score(),
        );

        Ok(LoopOutcome {
            status,
            artifacts,
            verdicts,
            final_html_path: Some(final_html_path),
        })
    }

    fn render(&self, iteration: u32, artifact: &CompositionArtifact) -> BannerResult<PathBuf> {
        let ctx = self.ctx;
        let html = with_base_href(&artifact.html, &ctx.store.dir(WEB_DIR));
        let html_path = ctx
            .store
            .write_file(&format!("{DEBUG_DIR}/banner_iter_{iteration}.html"), html.as_bytes())?;
        let screenshot = ctx
            .store
            .dir(DEBUG_DIR)
            .join(format!("banner_screenshot_iter_{iteration}.png"));
        ctx.renderer.render(
            &html_path,
            &screenshot,
            ctx.config.banner_width,
            ctx.config.banner_height,
        )?;
        Ok(screenshot)
    }

    fn score(&self, iteration: u32, screenshot: &Path) -> BannerResult<ValidationVerdict> {
        let ctx = self.ctx;
        let rendered = ScoringPrompt {
            event_name: ctx.project.request.event_name.clone(),
            requirements: ctx.project.request.requirements.clone(),
            width: ctx.config.banner_width,
            height: ctx.config.banner_height,
        }
        .render()?;
        let request = AgentRequest::new(
            Capability::VisionScoring,
            AgentTask::VisionScoring,
            ScoringPrompt::SYSTEM,
            rendered,
        )
        .with_image(screenshot);
        let reply = ctx.agent.invoke(&request)?;
        Ok(parse_verdict(&reply, iteration, ctx.config.score_threshold))
    }

    fn record_verdict(&self, verdict: &ValidationVerdict, screenshot: &Path) {
        let ctx = self.ctx;
        let payload = match serde_json::to_value(verdict) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = "verdict_serialize_failed", error = %err);
                Value::Null
            }
        };
        let relative = format!("{HISTORY_DIR}/validation_result_iter_{}.json", verdict.iteration);
        if let Err(err) = ctx.store.write_json(&relative, &payload) {
            warn!(event = "verdict_write_failed", error = %err);
        }
        ctx.store.emit(
            "iteration_scored",
            map_object(json!({
                "iteration": verdict.iteration,
                "score": verdict.score,
                "needs_optimization": verdict.needs_optimization,
                "screenshot": screenshot,
            })),
        );
    }

    /// One rewrite of the current HTML. Errors leave the HTML unchanged for
    /// the next round.
    fn optimize(
        &self,
        iteration: u32,
        current: &CompositionArtifact,
        verdict: &ValidationVerdict,
    ) -> BannerResult<CompositionArtifact> {
        let ctx = self.ctx;
        let rendered = OptimizationPrompt {
            html: current.html.clone(),
            score: verdict.score,
            feedback: verdict.feedback.clone(),
            suggestions: verdict
                .suggestions
                .iter()
                .map(|suggestion| format!("- {suggestion}"))
                .collect::<Vec<_>>()
                .join("\n"),
            manifest: self.manifest_listing(),
            requirements: ctx.project.request.requirements.clone(),
            width: ctx.config.banner_width,
            height: ctx.config.banner_height,
        }
        .render()?;
        let request = AgentRequest::new(
            Capability::CodeGeneration,
            AgentTask::HtmlOptimization,
            OptimizationPrompt::SYSTEM,
            rendered,
        );
        let reply = ctx.agent.invoke(&request)?;
        let found = extract(
            Some(ctx.agent),
            &MarkupGrammar::html(),
            &reply,
            Route::SyntacticFirst,
            Vec::new,
        );
        let html = match (found.source, found.value.into_iter().next()) {
            (ExtractionSource::Default, _) | (_, None) => {
                return Err(BannerError::Extraction(
                    "no HTML document in optimization reply".to_string(),
                ))
            }
            (_, Some(html)) => html,
        };

        let next_iteration = iteration + 1;
        let html_path = ctx.store.save_bytes_in(
            HISTORY_DIR,
            &format!("optimized_banner_iter_{next_iteration}.html"),
            html.as_bytes(),
            "html",
            &format!("Banner rewritten after iteration {iteration} scored {:.1}", verdict.score),
        )?;
        Ok(CompositionArtifact {
            iteration: next_iteration,
            referenced_materials: referenced_in(&html, &current.referenced_materials),
            html,
            html_path,
            created_at: Utc::now(),
        })
    }

    fn manifest_listing(&self) -> String {
        let root = self.ctx.store.root();
        self.ctx
            .store
            .manifest()
            .latest_by_filename()
            .iter()
            .map(|entry| {
                let path = Path::new(&entry.file_path);
                let shown = path.strip_prefix(root).unwrap_or(path);
                format!(
                    "- {} ({}): {}",
                    shown.display(),
                    entry.file_type,
                    entry.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
