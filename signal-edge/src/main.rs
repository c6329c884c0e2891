//! signal-edge CLI
//!
//! # Walk-forward evaluation of replayed model predictions
//! signal-edge run --config config/default.toml --data data/dataset.json --output results/run.json
//!
//! # Print the split plan for each instrument
//! signal-edge splits --config config/default.toml --data data/dataset.json
//!
//! # Replay an observation stream through the drift monitor
//! signal-edge drift --config config/default.toml --observations data/observations.json --baseline 60

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use signal_edge::data::{InstrumentData, Observation};
use signal_edge::drift::Baseline;
use signal_edge::ensemble::{PolicyKind, ReplayTrainer};
use signal_edge::walkforward::InstrumentJob;
use signal_edge::{DataLoader, EngineConfig, WalkForwardSplits};

#[derive(Parser)]
#[command(name = "signal-edge")]
#[command(about = "Walk-forward validation and drift monitoring for ML trading signals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run walk-forward evaluation over a dataset of prices and predictions
    Run {
        /// Path to configuration file (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to the JSON dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Write the full JSON record here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the configured combination policy
        #[arg(long, value_parser = parse_policy)]
        policy: Option<PolicyKind>,

        /// Only evaluate these instruments (comma-separated)
        #[arg(long)]
        instruments: Option<String>,
    },

    /// Print the walk-forward split plan
    Splits {
        /// Path to configuration file (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to the JSON dataset
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Replay observations through the drift monitor
    Drift {
        /// Path to configuration file (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to the JSON observation stream
        #[arg(long)]
        observations: PathBuf,

        /// Use each instrument's first N observations as the feature baseline
        #[arg(long, default_value_t = 0)]
        baseline: usize,

        /// Acknowledge each retrain trigger immediately, as if retrained on
        /// the latest feature window
        #[arg(long)]
        auto_ack: bool,
    },
}

fn parse_policy(s: &str) -> std::result::Result<PolicyKind, String> {
    match s.to_lowercase().replace('-', "_").as_str() {
        "voting" => Ok(PolicyKind::Voting),
        "blending" => Ok(PolicyKind::Blending),
        "stacking" => Ok(PolicyKind::Stacking),
        "bayesian_averaging" | "bayesian" => Ok(PolicyKind::BayesianAveraging),
        other => Err(format!("unknown policy: {}", other)),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn load_dataset(path: &Path, filter: Option<&str>) -> Result<Vec<InstrumentData>> {
    let mut dataset = DataLoader::new(path)
        .load_dataset()
        .with_context(|| format!("Failed to load dataset {}", path.display()))?;

    if let Some(filter) = filter {
        let wanted: Vec<String> = filter
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        dataset.retain(|d| wanted.contains(&d.series.instrument.to_uppercase()));
    }

    if dataset.is_empty() {
        bail!("No instruments to evaluate in {}", path.display());
    }
    Ok(dataset)
}

fn run(
    config: EngineConfig,
    data: &Path,
    output: Option<&Path>,
    instruments: Option<&str>,
) -> Result<()> {
    let dataset = load_dataset(data, instruments)?;
    let orchestrator = config.orchestrator();
    orchestrator.validate().context("Invalid configuration")?;

    info!(
        "Evaluating {} instruments with policy {}",
        dataset.len(),
        config.combiner.policy.name()
    );

    let trainers: Vec<ReplayTrainer> = dataset
        .iter()
        .map(|d| {
            ReplayTrainer::new(d.models.clone(), d.predictions.clone())
                .with_flat_band(config.drift.flat_band)
        })
        .collect();
    let jobs: Vec<InstrumentJob<'_>> = dataset
        .iter()
        .zip(&trainers)
        .map(|(d, trainer)| InstrumentJob {
            series: &d.series,
            trainer,
        })
        .collect();

    let pb = ProgressBar::new(jobs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let cancel = AtomicBool::new(false);
    let results = orchestrator.run_many(&jobs, &cancel, |instrument| {
        pb.set_message(instrument.to_string());
        pb.inc(1);
    });
    pb.finish_with_message("done");

    let mut records = Vec::new();
    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(record) => {
                println!("{}\n", record.report());
                records.push(record);
            }
            Err(e) => warn!("{}: walk-forward run failed: {}", job.series.instrument, e),
        }
    }

    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&records)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} records to {}", records.len(), path.display());
    }

    if records.is_empty() {
        bail!("Every instrument failed");
    }
    Ok(())
}

fn splits(config: EngineConfig, data: &Path) -> Result<()> {
    let dataset = load_dataset(data, None)?;

    for d in &dataset {
        let plan = WalkForwardSplits::new(config.splits.clone(), &d.series.timestamps())
            .with_context(|| format!("{}: cannot split", d.series.instrument))?;

        println!(
            "{}: {} periods, {} splits",
            d.series.instrument,
            d.series.len(),
            plan.expected_splits()
        );
        println!("| Split | Train Start | Train End  | Test Start | Test End   |");
        println!("|-------|-------------|------------|------------|------------|");
        for split in &plan {
            println!(
                "| {:>5} | {}  | {} | {} | {} |",
                split.split_num,
                split.train.start.format("%Y-%m-%d"),
                split.train.end.format("%Y-%m-%d"),
                split.test.start.format("%Y-%m-%d"),
                split.test.end.format("%Y-%m-%d"),
            );
        }
        println!();
    }

    Ok(())
}

fn feature_names(width: usize) -> Vec<String> {
    (0..width).map(|i| format!("feature_{}", i)).collect()
}

/// Reference rebuilt from the latest observations, standing in for the
/// train window of a retrained model.
fn refreshed_baseline(recent: &mut VecDeque<Observation>) -> Result<Option<Baseline>> {
    let width = match recent.front() {
        Some(obs) if !obs.features.is_empty() => obs.features.len(),
        _ => return Ok(None),
    };
    let baseline = Baseline::from_observations(feature_names(width), recent.make_contiguous())?;
    Ok(Some(baseline))
}

fn drift(config: EngineConfig, path: &Path, baseline_len: usize, auto_ack: bool) -> Result<()> {
    let observations = DataLoader::new(path)
        .load_observations()
        .with_context(|| format!("Failed to load observations {}", path.display()))?;
    let mut registry = config.drift_registry().context("Invalid drift configuration")?;

    let mut by_instrument: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for obs in observations {
        by_instrument.entry(obs.instrument.clone()).or_default().push(obs);
    }

    let mut transitions = 0usize;
    for (instrument, stream) in &by_instrument {
        let split = baseline_len.min(stream.len());
        let (reference, live) = stream.split_at(split);

        if !reference.is_empty() {
            let names = feature_names(reference[0].features.len());
            let baseline = Baseline::from_observations(names, reference)
                .with_context(|| format!("{}: cannot build baseline", instrument))?;
            registry.set_baseline(instrument, baseline);
        }

        let window = config.drift.window_features;
        let mut recent: VecDeque<Observation> = VecDeque::with_capacity(window);
        for obs in live {
            if recent.len() == window {
                recent.pop_front();
            }
            recent.push_back(obs.clone());

            let report = registry
                .update(obs)
                .with_context(|| format!("{}: drift update failed", instrument))?;

            if report.transitioned() {
                transitions += 1;
                let trigger = report
                    .trigger
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {}: {:?} -> {:?} ({}, accuracy {})",
                    report.timestamp.format("%Y-%m-%d %H:%M"),
                    instrument,
                    report.previous_status,
                    report.status,
                    trigger,
                    report
                        .rolling_accuracy
                        .map(|a| format!("{:.3}", a))
                        .unwrap_or_else(|| "n/a".to_string()),
                );
            }

            if auto_ack && report.retrain_required() {
                let baseline = refreshed_baseline(&mut recent)
                    .with_context(|| format!("{}: cannot refresh baseline", instrument))?;
                registry.acknowledge_retrain(instrument, baseline, report.timestamp)?;
                println!(
                    "{} {}: retrain acknowledged",
                    report.timestamp.format("%Y-%m-%d %H:%M"),
                    instrument
                );
            }
        }
    }

    println!("\n{} transitions", transitions);
    for (instrument, status) in registry.statuses() {
        println!("{}: {:?}", instrument, status);
    }

    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            output,
            policy,
            instruments,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(policy) = policy {
                config.combiner.policy = policy;
            }
            run(config, &data, output.as_deref(), instruments.as_deref())
        }
        Commands::Splits { config, data } => splits(load_config(config.as_deref())?, &data),
        Commands::Drift {
            config,
            observations,
            baseline,
            auto_ack,
        } => drift(
            load_config(config.as_deref())?,
            &observations,
            baseline,
            auto_ack,
        ),
    }
}
