//! The six ordered stages. Each stage sees only bounded summaries of the
//! stages before it; a failed stage is recorded and the run continues on
//! defaults.

use std::thread;

use banner_contracts::layers::{default_layer_specs, LayerSpec, Modality};
use banner_contracts::materials::{GeneratedMaterial, MaterialStatus};
use banner_contracts::runs::ProgressStatus;
use banner_contracts::stages::Stage;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentTask};
use crate::compose::compose;
use crate::context::{KeyInfo, StageContext};
use crate::error::{BannerError, BannerResult};
use crate::extract::{extract, ExtractionSource, JsonGrammar, Route};
use crate::generators::{
    generate_layer, GenerationContext, MaterialGenerator, RasterGenerator, VectorGenerator,
};
use crate::prompts::{
    AnalysisPrompt, LayerDesignPrompt, LayerRoutingPrompt, MarketingPrompt, StagePrompt,
};
use crate::routing::{plan_document, resolve_plan, routing_entries, specs_from_design};
use crate::{map_object, RunContext, RunState};

/// How one stage ended. A failed stage may still have produced raw text
/// worth keeping (an unparseable reply).
#[derive(Debug, Clone, PartialEq)]
pub enum StageStep {
    Completed { raw: String, payload: Option<Value> },
    Failed { error: String, raw: Option<String> },
}

pub fn run_stages(ctx: &RunContext<'_>, state: &mut RunState) -> BannerResult<()> {
    let mut context = StageContext::new(KeyInfo::new(Some(ctx.agent), ctx.config.key_info_budget));
    let mut design_text = String::new();

    for stage in Stage::ALL {
        ctx.cancel.check()?;
        let prior = context.for_stage(&state.ledger, stage);
        info!(event = "stage_started", stage = stage.key(), index = stage.index());
        ctx.store
            .record_progress(stage.key(), ProgressStatus::Started, stage.title());
        ctx.store.emit(
            "stage_started",
            map_object(json!({"stage": stage.key(), "index": stage.index()})),
        );

        let step = match stage {
            Stage::Analysis => analysis(ctx, &prior),
            Stage::Marketing => marketing(ctx, &prior),
            Stage::LayerDesign => {
                let (step, specs, text) = layer_design(ctx, &prior);
                state.layers = specs;
                design_text = text;
                step
            }
            Stage::LayerRouting => {
                let (step, plan) = layer_routing(ctx, &prior, &design_text, state.layers.clone());
                state.layers = plan;
                step
            }
            Stage::LayerGeneration => {
                let materials = generate_layers(ctx, &state.layers, &design_text);
                let step = generation_step(&materials);
                for material in &materials {
                    if let Some(reason) = material.failure_reason() {
                        state.failures.push(format!("layer {}: {reason}", material.layer.key()));
                    }
                }
                state.materials = materials;
                step
            }
            Stage::HtmlComposition => {
                let composition = compose(ctx, &prior, &state.materials)?;
                let step = if composition.used_fallback() {
                    StageStep::Failed {
                        error: format!(
                            "{}; used the fallback layout",
                            composition.error.as_deref().unwrap_or("composition failed")
                        ),
                        raw: composition.reply.clone(),
                    }
                } else {
                    StageStep::Completed {
                        raw: composition.reply.clone().unwrap_or_default(),
                        payload: Some(json!({
                            "html_path": composition.artifact.html_path,
                            "referenced_materials": composition.artifact.referenced_materials,
                        })),
                    }
                };
                state.artifacts.push(composition.artifact);
                step
            }
        };
        record_step(ctx, state, stage, step)?;
    }
    Ok(())
}

fn record_step(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    stage: Stage,
    step: StageStep,
) -> BannerResult<()> {
    let document = stage.document_name();
    let file_type = if document.ends_with(".json") { "json" } else { "md" };
    let (body, status) = match &step {
        StageStep::Completed { raw, .. } => (raw.clone(), ProgressStatus::Completed),
        StageStep::Failed { error, raw } => (
            match raw {
                Some(raw) => format!("<!-- stage failed: {error} -->\n{raw}"),
                None => format!("# {}\n\nStage failed: {error}\n", stage.title()),
            },
            ProgressStatus::Failed,
        ),
    };
    if let Err(err) = ctx
        .store
        .save_artifact(&body, &document, file_type, stage.title())
    {
        warn!(event = "stage_document_failed", stage = stage.key(), error = %err);
    }

    match step {
        StageStep::Completed { raw, payload } => {
            info!(event = "stage_finished", stage = stage.key(), chars = raw.chars().count());
            state
                .ledger
                .record_completed(stage, raw, payload)
                .map_err(BannerError::from)?;
            ctx.store.record_progress(stage.key(), status, &document);
        }
        StageStep::Failed { error, .. } => {
            warn!(event = "stage_failed", stage = stage.key(), error = %error);
            state.failures.push(format!("{}: {error}", stage.key()));
            ctx.store.record_progress(stage.key(), status, &error);
            state
                .ledger
                .record_failed(stage, error)
                .map_err(BannerError::from)?;
        }
    }
    ctx.store.emit(
        "stage_finished",
        map_object(json!({
            "stage": stage.key(),
            "status": state.ledger.get(stage).map(|row| row.status),
            "document": document,
        })),
    );
    Ok(())
}

/// Renders `prompt` and sends it with the stage's capability.
fn ask<P: StagePrompt>(ctx: &RunContext<'_>, stage: Stage, prompt: &P) -> BannerResult<String> {
    let rendered = prompt.render()?;
    let request = AgentRequest::new(
        stage.capability(),
        AgentTask::Stage(stage),
        P::SYSTEM,
        rendered,
    );
    ctx.agent.invoke(&request)
}

fn text_step(reply: BannerResult<String>) -> StageStep {
    match reply {
        Ok(raw) => StageStep::Completed { raw, payload: None },
        Err(err) => StageStep::Failed {
            error: err.to_string(),
            raw: None,
        },
    }
}

fn analysis(ctx: &RunContext<'_>, prior: &str) -> StageStep {
    let request = &ctx.project.request;
    text_step(ask(
        ctx,
        Stage::Analysis,
        &AnalysisPrompt {
            event_name: request.event_name.clone(),
            requirements: request.requirements.clone(),
            context: prior.to_string(),
        },
    ))
}

fn marketing(ctx: &RunContext<'_>, prior: &str) -> StageStep {
    let request = &ctx.project.request;
    text_step(ask(
        ctx,
        Stage::Marketing,
        &MarketingPrompt {
            event_name: request.event_name.clone(),
            requirements: request.requirements.clone(),
            context: prior.to_string(),
        },
    ))
}

/// Parses a stage reply as JSON, repairing through the model when the reply
/// is not already valid.
fn parse_payload(ctx: &RunContext<'_>, grammar: &JsonGrammar, raw: &str) -> Option<Value> {
    let found = extract(Some(ctx.agent), grammar, raw, Route::SyntacticFirst, || Value::Null);
    match found.source {
        ExtractionSource::Default => None,
        _ => Some(found.value),
    }
}

/// Returns the step, the layer specs and the design text later layers are
/// filtered from.
fn layer_design(ctx: &RunContext<'_>, prior: &str) -> (StageStep, Vec<LayerSpec>, String) {
    let reply = ask(
        ctx,
        Stage::LayerDesign,
        &LayerDesignPrompt {
            event_name: ctx.project.request.event_name.clone(),
            width: ctx.config.banner_width,
            height: ctx.config.banner_height,
            context: prior.to_string(),
        },
    );
    let raw = match reply {
        Ok(raw) => raw,
        Err(err) => return (text_step(Err(err)), default_layer_specs(), String::new()),
    };
    match parse_payload(ctx, &JsonGrammar::object(), &raw) {
        Some(design) => {
            let specs = specs_from_design(&design);
            let text = serde_json::to_string_pretty(&design).unwrap_or_else(|_| raw.clone());
            (
                StageStep::Completed {
                    raw,
                    payload: Some(design),
                },
                specs,
                text,
            )
        }
        None => (
            StageStep::Failed {
                error: "layer design reply held no JSON object".to_string(),
                raw: Some(raw),
            },
            default_layer_specs(),
            String::new(),
        ),
    }
}

fn layer_routing(
    ctx: &RunContext<'_>,
    prior: &str,
    design_text: &str,
    specs: Vec<LayerSpec>,
) -> (StageStep, Vec<LayerSpec>) {
    let use_llm_routing = ctx.config.use_llm_routing;
    // Without a parsed design the model routes the default plan.
    let layer_design = if design_text.trim().is_empty() {
        serde_json::to_string_pretty(&plan_document(&specs, false)).unwrap_or_default()
    } else {
        design_text.to_string()
    };
    let reply = ask(
        ctx,
        Stage::LayerRouting,
        &LayerRoutingPrompt {
            event_name: ctx.project.request.event_name.clone(),
            layer_design,
            context: prior.to_string(),
        },
    );
    let (step, entries) = match reply {
        Err(err) => (text_step(Err(err)), Vec::new()),
        Ok(raw) => match parse_payload(ctx, &JsonGrammar::any(), &raw) {
            Some(routing) => {
                let entries = routing_entries(&routing);
                (
                    StageStep::Completed {
                        raw,
                        payload: Some(routing),
                    },
                    entries,
                )
            }
            None => (
                StageStep::Failed {
                    error: "layer routing reply held no JSON".to_string(),
                    raw: Some(raw),
                },
                Vec::new(),
            ),
        },
    };

    let plan = resolve_plan(specs, &entries, use_llm_routing);
    let document = plan_document(&plan, use_llm_routing);
    match serde_json::to_string_pretty(&document) {
        Ok(text) => {
            if let Err(err) = ctx.store.save_artifact(
                &text,
                "layer_routing_plan.json",
                "json",
                "Resolved per-layer generation plan",
            ) {
                warn!(event = "routing_plan_write_failed", error = %err);
            }
        }
        Err(err) => warn!(event = "routing_plan_write_failed", error = %err),
    }
    (step, plan)
}

/// Generates every layer in stacking order, on scoped threads when
/// `parallel_layers` is set. The result is in plan order either way.
pub fn generate_layers(
    ctx: &RunContext<'_>,
    plan: &[LayerSpec],
    design_text: &str,
) -> Vec<GeneratedMaterial> {
    let generation = GenerationContext {
        agent: ctx.agent,
        store: ctx.store,
        design_text,
        banner_size: (ctx.config.banner_width, ctx.config.banner_height),
        cancel: ctx.cancel,
    };
    let vector = VectorGenerator;
    let raster = RasterGenerator::new(ctx.images);
    let pick = |spec: &LayerSpec| generator_for(spec, &vector, &raster);

    if !ctx.config.parallel_layers {
        return plan
            .iter()
            .map(|spec| generate_layer(pick(spec), &generation, spec))
            .collect();
    }

    let generation = &generation;
    thread::scope(|scope| {
        let handles: Vec<_> = plan
            .iter()
            .map(|spec| {
                let generator = pick(spec);
                (spec, scope.spawn(move || generate_layer(generator, generation, spec)))
            })
            .collect();
        handles
            .into_iter()
            .map(|(spec, handle)| {
                handle.join().unwrap_or_else(|_| {
                    warn!(event = "layer_thread_panicked", layer = spec.kind.key());
                    GeneratedMaterial::failed(spec.kind, "", "", None, "layer generator panicked")
                })
            })
            .collect()
    })
}

fn generator_for<'g>(
    spec: &LayerSpec,
    vector: &'g VectorGenerator,
    raster: &'g RasterGenerator<'_>,
) -> &'g dyn MaterialGenerator {
    match spec.modality() {
        Modality::Vector => vector,
        Modality::Raster => raster,
    }
}

fn generation_step(materials: &[GeneratedMaterial]) -> StageStep {
    let layers: Vec<Value> = materials
        .iter()
        .map(|material| {
            json!({
                "layer": material.layer.key(),
                "modality": material.modality.as_str(),
                "status": material.status,
                "filename": material.filename,
                "prompt": material.prompt,
                "paths": material.paths,
                "sha256": material.sha256,
            })
        })
        .collect();
    let succeeded = materials.iter().filter(|material| material.succeeded()).count();
    let payload = json!({
        "succeeded": succeeded,
        "failed": materials.len() - succeeded,
        "layers": layers,
    });
    let raw = serde_json::to_string_pretty(&payload).unwrap_or_default();

    let all_failed = !materials.is_empty()
        && materials
            .iter()
            .all(|material| matches!(material.status, MaterialStatus::Failed { .. }));
    if all_failed {
        StageStep::Failed {
            error: "no layer produced a material".to_string(),
            raw: Some(raw),
        }
    } else {
        StageStep::Completed {
            raw,
            payload: Some(payload),
        }
    }
}
