use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use banner_contracts::models::{Capability, ModelSelector};
use banner_engine::{BannerEngine, BannerRequest, CancelToken, EngineConfig, RunStatus};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "banner-rs", version, about = "Staged LLM banner pipeline")]
struct Cli {
    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the whole pipeline for one event.
    Run(RunArgs),
    /// List the registered models per capability.
    Models,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    event: String,
    #[arg(long, default_value = "")]
    requirements: String,
    /// JSON config file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "BANNER_WORK_ROOT")]
    out: Option<PathBuf>,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    score_threshold: Option<f64>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    code_model: Option<String>,
    #[arg(long)]
    vision_model: Option<String>,
    #[arg(long)]
    image_provider: Option<String>,
    #[arg(long)]
    use_llm_routing: bool,
    #[arg(long)]
    parallel_layers: bool,
    /// Offline agent, image generator and renderer.
    #[arg(long, env = "BANNER_DRYRUN")]
    dryrun: bool,
    /// Give up (and cancel the run) after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("banner-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("BANNER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => run_pipeline(args),
        Command::Models => {
            list_models();
            Ok(0)
        }
    }
}

fn build_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env();

    if let Some(out) = &args.out {
        config.work_root = out.clone();
    }
    if let Some(value) = args.max_iterations {
        config.max_iterations = value;
    }
    if let Some(value) = args.score_threshold {
        config.score_threshold = value;
    }
    if let Some(value) = args.width {
        config.banner_width = value;
    }
    if let Some(value) = args.height {
        config.banner_height = value;
    }
    if args.text_model.is_some() {
        config.text_model = args.text_model.clone();
    }
    if args.code_model.is_some() {
        config.code_model = args.code_model.clone();
    }
    if args.vision_model.is_some() {
        config.vision_model = args.vision_model.clone();
    }
    if let Some(provider) = &args.image_provider {
        config.image_provider = provider.clone();
    }
    config.use_llm_routing |= args.use_llm_routing;
    config.parallel_layers |= args.parallel_layers;
    config.dryrun |= args.dryrun;
    config.validate()?;
    Ok(config)
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    if args.event.trim().is_empty() {
        bail!("--event must not be empty");
    }
    let config = build_config(&args)?;
    info!(
        event = "config_resolved",
        work_root = %config.work_root.display(),
        dryrun = config.dryrun,
        image_provider = %config.image_provider,
        max_iterations = config.max_iterations,
    );

    let mut engine = BannerEngine::from_config(config)?;
    if let Some(secs) = args.timeout_secs {
        engine = engine.with_cancel_token(CancelToken::with_timeout(Duration::from_secs(secs)));
    }
    let outcome = engine.run(BannerRequest::new(args.event, args.requirements));

    let summary = json!({
        "status": outcome.status.as_str(),
        "work_dir": outcome.project.as_ref().map(|project| project.work_dir.clone()),
        "final_html": outcome.final_html_path,
        "iterations": outcome.verdicts.len(),
        "final_score": outcome.verdicts.last().map(|verdict| verdict.score),
        "loop_status": outcome.loop_status,
        "failures": outcome.failures,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(match outcome.status {
        RunStatus::Success => 0,
        RunStatus::Error => 2,
    })
}

fn list_models() {
    let selector = ModelSelector::default();
    for capability in [
        Capability::TextGeneration,
        Capability::CodeGeneration,
        Capability::ImageGeneration,
        Capability::VisionScoring,
    ] {
        let names: Vec<String> = selector
            .registry
            .by_capability(capability)
            .into_iter()
            .map(|model| format!("{} ({})", model.name, model.provider))
            .collect();
        println!("{capability}: {}", names.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() -> Result<()> {
        let cli = Cli::try_parse_from([
            "banner-rs",
            "run",
            "--event",
            "SummerSale",
            "--dryrun",
            "--max-iterations",
            "2",
            "--width",
            "728",
            "--height",
            "90",
            "--parallel-layers",
        ])?;
        let Command::Run(args) = cli.command else {
            bail!("expected the run command");
        };
        let config = build_config(&args)?;
        assert!(config.dryrun);
        assert!(config.parallel_layers);
        assert_eq!(config.max_iterations, 2);
        assert_eq!((config.banner_width, config.banner_height), (728, 90));
        Ok(())
    }

    #[test]
    fn invalid_threshold_is_rejected() -> Result<()> {
        let cli = Cli::try_parse_from([
            "banner-rs",
            "run",
            "--event",
            "x",
            "--dryrun",
            "--score-threshold",
            "12",
        ])?;
        let Command::Run(args) = cli.command else {
            bail!("expected the run command");
        };
        assert!(build_config(&args).is_err());
        Ok(())
    }
}
