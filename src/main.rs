use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vlm_sim_eval::config::{Config, ExtractorKind};
use vlm_sim_eval::evaluation::build_evaluators;
use vlm_sim_eval::frame::{FfmpegFrameExtractor, FrameExtractor, StillImageExtractor};
use vlm_sim_eval::judge::{Judge, OpenAiJudge};
use vlm_sim_eval::loader::{load_scenarios, resolve_scenario_path};
use vlm_sim_eval::models::{Scenario, ScenarioResult};
use vlm_sim_eval::output::{self, OutputFormat};
use vlm_sim_eval::report::ReportWriter;
use vlm_sim_eval::runner::ScenarioRunner;
use vlm_sim_eval::vlm::{OpenAiVlmBackend, VlmBackend};
use vlm_sim_eval::world_model::SimulationClient;

/// VLM scenario evaluation - drive a vision-language controller through a simulated world and score it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output - log every step and poll
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenarios and score the trajectories
    Run {
        /// Scenario file, directory, or scenario name
        path: String,

        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format: plain or json
        #[arg(short, long, default_value = "plain")]
        output: OutputFormat,

        /// Do not save per-step frames
        #[arg(long)]
        no_frames: bool,

        /// Override the step budget of every scenario
        #[arg(long)]
        max_steps: Option<usize>,

        /// Scenarios executed in parallel
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List the scenarios found at a path
    List {
        /// Scenario file, directory, or scenario name
        path: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "vlm_sim_eval=debug" } else { "vlm_sim_eval=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load(path: &str) -> Result<Vec<Scenario>> {
    let resolved = resolve_scenario_path(path)?;
    let scenarios = load_scenarios(&resolved)?;
    if scenarios.is_empty() {
        anyhow::bail!("No scenarios found in {}", resolved.display());
    }
    Ok(scenarios)
}

fn build_extractor(config: &Config) -> Arc<dyn FrameExtractor> {
    match config.world_model.extractor {
        ExtractorKind::Ffmpeg => Arc::new(FfmpegFrameExtractor::new(&config.world_model.ffmpeg_path)),
        ExtractorKind::Still => Arc::new(StillImageExtractor),
    }
}

async fn run(
    path: &str,
    config_path: Option<&Path>,
    format: OutputFormat,
    no_frames: bool,
    max_steps: Option<usize>,
    concurrency: Option<usize>,
) -> Result<Vec<ScenarioResult>> {
    let mut config = Config::load(config_path)?;
    let mut scenarios = load(path)?;

    if let Some(max_steps) = max_steps {
        config.runner.max_steps = max_steps;
        for scenario in &mut scenarios {
            scenario.max_steps = Some(max_steps);
        }
    }
    if let Some(concurrency) = concurrency {
        config.runner.concurrency = concurrency;
    }
    if no_frames {
        config.output.save_frames = false;
    }

    let judge: Option<Arc<dyn Judge>> = if config.evaluation.needs_judge() {
        Some(Arc::new(
            OpenAiJudge::from_config(&config.judge).context("Failed to configure judge model")?,
        ))
    } else {
        None
    };
    let evaluators = build_evaluators(&config.evaluation, judge)?;

    let world = Arc::new(SimulationClient::from_config(&config.world_model)?);
    let writer = Arc::new(ReportWriter::new(&config.output.directory, config.output.save_frames));
    let runner = ScenarioRunner::new(world, build_extractor(&config), config.runner.clone()).with_observer(writer.clone());

    info!(scenarios = scenarios.len(), concurrency = config.runner.concurrency, "running scenarios");
    let vlm_config = config.vlm.clone();
    let results = runner
        .execute_all(
            &scenarios,
            |_| Ok(Box::new(OpenAiVlmBackend::from_config(&vlm_config)?) as Box<dyn VlmBackend>),
            &evaluators,
            config.runner.max_steps,
        )
        .await;

    for result in &results {
        if let Err(e) = writer.write_result(result) {
            warn!(scenario = %result.scenario.name, error = %format!("{:#}", e), "could not write result");
        }
    }

    output::print_results(&results, format);
    Ok(results)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run {
            path,
            config,
            output,
            no_frames,
            max_steps,
            concurrency,
        } => {
            let results = run(&path, config.as_deref(), output, no_frames, max_steps, concurrency).await?;
            if output::passed_count(&results) < results.len() {
                std::process::exit(1);
            }
        }
        Command::List { path } => {
            for scenario in load(&path)? {
                let bound = scenario
                    .max_steps
                    .map_or_else(|| "-".to_string(), |steps| steps.to_string());
                println!(
                    "{:<24} {:>5} steps  {} expected actions  {}",
                    scenario.name,
                    bound,
                    scenario.expected_actions.len(),
                    scenario.tags.join(",")
                );
            }
        }
    }

    Ok(())
}
