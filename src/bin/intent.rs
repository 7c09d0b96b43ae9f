#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use intent_harness::classifier::Classifier;
use intent_harness::config::AppConfig;
use intent_harness::dispatch::{dispatch_all, DispatchOutcome, FailurePolicy};
use intent_harness::evaluator::{render_report_markdown, Evaluator};
use intent_harness::gateway::{ProviderGateway, TracingUsageSink};
use intent_harness::records::{
    read_results_json, write_results, ClassificationRequest, InputTable, SuccessFilter,
};
use intent_harness::sampler::{self, stratified_sample};
use intent_harness::taxonomy::MatchProfile;

#[derive(Parser)]
#[command(name = "intent", version, about = "LLM intent classification harness")]
struct Cli {
    /// Also write plain-text logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Write logs to a timestamped file in this directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every question in a CSV and score against ground truth
    Run {
        #[arg(long, short)]
        input: PathBuf,
        /// CSV export; the JSON export is written next to it
        #[arg(long, short, default_value = "result/result.csv")]
        output: PathBuf,
        /// Classify a stratified sample of this many rows
        #[arg(long = "limit", short = 'n')]
        limit: Option<usize>,
        /// Prior success filter: all, O or X
        #[arg(long, short, default_value = "all")]
        filter: SuccessFilter,
        #[arg(long)]
        seed: Option<u64>,
        /// loose or strict (overrides MATCH_PROFILE)
        #[arg(long)]
        profile: Option<MatchProfile>,
        /// Acceptance threshold in [0, 1] (overrides the profile's)
        #[arg(long)]
        threshold: Option<f64>,
        /// fail-fast or continue (overrides FAILURE_POLICY)
        #[arg(long)]
        policy: Option<FailurePolicy>,
        /// Concurrent requests (overrides MAX_CONCURRENT_REQUESTS)
        #[arg(long)]
        workers: Option<usize>,
        /// Pause in seconds after each call (overrides THINKING_TIME)
        #[arg(long)]
        thinking_time: Option<u64>,
    },
    /// Recompute statistics from a JSON export
    Report {
        #[arg(long)]
        results: PathBuf,
        #[arg(long, default_value_t = 20)]
        top_n: usize,
        /// Write markdown here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Rewrite the ground-truth column with strict-profile classifications
    Relabel {
        #[arg(long, short)]
        input: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        /// Concurrent requests (overrides MAX_CONCURRENT_REQUESTS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Draw a stratified sample of input rows by ground truth
    Sample {
        #[arg(long, short)]
        input: PathBuf,
        #[arg(long = "limit", short = 'n')]
        limit: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, short, default_value = "all")]
        filter: SuccessFilter,
        /// Write the sampled rows here; prints them otherwise
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| std::env::var("LOG_LEVEL").ok().map(|v| v.trim().to_lowercase()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn log_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.log_file {
        return Some(path.clone());
    }
    cli.log_dir.as_ref().map(|dir| {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        dir.join(format!("intent_{stamp}.log"))
    })
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Latch set by Ctrl-C; dispatch stops taking new work once it flips.
fn interrupt_latch() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight requests");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

fn build_classifier(
    config: &AppConfig,
    profile: MatchProfile,
    threshold: Option<f64>,
) -> Result<Classifier, Box<dyn std::error::Error>> {
    let taxonomy = Arc::new(config.taxonomy.load()?);
    let provider = config.provider.build(config.timeout)?;
    tracing::info!(
        provider = config.provider.kind().as_str(),
        model = config.provider.model(),
        endpoint = %provider.endpoint(),
        labels = taxonomy.len(),
        profile = profile.as_str(),
        "classifier ready"
    );
    let gateway = ProviderGateway::with_config(
        provider,
        Arc::new(TracingUsageSink),
        config.gateway_config(),
    );
    let mut classifier_config = config.classifier_config();
    classifier_config.profile = profile;
    if threshold.is_some() {
        classifier_config.threshold = threshold;
    }
    Ok(Classifier::new(Arc::new(gateway), taxonomy, classifier_config).with_job(Uuid::new_v4()))
}

fn log_plan(requests: &[ClassificationRequest], limit: usize) {
    for slot in sampler::plan(requests, limit) {
        tracing::info!(
            stratum = %slot.stratum,
            available = slot.available,
            target = slot.target,
            "sample quota"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(log_path(&cli).as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            output,
            limit,
            filter,
            seed,
            profile,
            threshold,
            policy,
            workers,
            thinking_time,
        } => {
            if let Some(t) = threshold {
                if !(0.0..=1.0).contains(&t) {
                    return Err("--threshold must be within [0, 1]".into());
                }
            }
            let mut config = AppConfig::from_env()?;
            if let Some(workers) = workers {
                config.max_concurrent_requests = workers;
            }
            if let Some(secs) = thinking_time {
                config.thinking_time = std::time::Duration::from_secs(secs);
            }
            if let Some(policy) = policy {
                config.failure_policy = policy;
            }
            let profile = profile.unwrap_or(config.match_profile);

            let table = InputTable::load(&input)?;
            let mut requests = table.requests(filter);
            tracing::info!(
                input = %input.display(),
                rows = table.len(),
                selected = requests.len(),
                "input loaded"
            );
            if let Some(limit) = limit {
                log_plan(&requests, limit);
                requests = stratified_sample(requests, limit, &mut rng_from(seed));
            }
            if requests.is_empty() {
                tracing::warn!("no questions to classify");
                return Ok(());
            }

            let classifier = build_classifier(&config, profile, threshold)?;
            let mut evaluator = Evaluator::new();
            let report = dispatch_all(
                Arc::new(classifier),
                requests,
                &config.dispatch_config(),
                &mut evaluator,
                interrupt_latch(),
            )
            .await?;

            write_results(&output, &report.records)?;
            evaluator.log_summary(10);

            match report.outcome {
                DispatchOutcome::Completed => {}
                DispatchOutcome::Interrupted => {
                    tracing::warn!(
                        not_attempted = report.not_attempted,
                        "run interrupted; partial results written"
                    );
                }
                DispatchOutcome::Aborted { row, reason } => {
                    return Err(format!(
                        "batch aborted at row {row} ({} not attempted, {} abandoned in flight): {reason}",
                        report.not_attempted, report.abandoned_in_flight
                    )
                    .into());
                }
            }
        }
        Commands::Report {
            results,
            top_n,
            out,
        } => {
            let records = read_results_json(&results)?;
            let evaluator = Evaluator::from_records(&records);
            let markdown = render_report_markdown(&evaluator, top_n);
            match out {
                Some(path) => fs::write(path, markdown)?,
                None => print!("{markdown}"),
            }
        }
        Commands::Relabel {
            input,
            output,
            workers,
        } => {
            let mut config = AppConfig::from_env()?;
            if let Some(workers) = workers {
                config.max_concurrent_requests = workers;
            }
            config.failure_policy = FailurePolicy::FailFast;

            let table = InputTable::load(&input)?;
            let requests = table.requests(SuccessFilter::All);
            let classifier = build_classifier(&config, MatchProfile::Strict, None)?;
            let mut evaluator = Evaluator::new();
            let report = dispatch_all(
                Arc::new(classifier),
                requests,
                &config.dispatch_config(),
                &mut evaluator,
                interrupt_latch(),
            )
            .await?;

            if let DispatchOutcome::Aborted { row, reason } = &report.outcome {
                return Err(format!(
                    "relabel aborted at row {row} ({} not attempted, {} abandoned in flight): {reason}",
                    report.not_attempted, report.abandoned_in_flight
                )
                .into());
            }

            let labels: BTreeMap<usize, String> = report
                .records
                .iter()
                .filter(|r| !r.status.is_error())
                .filter_map(|r| r.top_label().map(|label| (r.row, label.to_string())))
                .collect();
            table.write_relabeled(&output, &labels)?;
            tracing::info!(
                output = %output.display(),
                relabeled = labels.len(),
                not_attempted = report.not_attempted,
                "relabeled input written"
            );
        }
        Commands::Sample {
            input,
            limit,
            seed,
            filter,
            output,
        } => {
            let table = InputTable::load(&input)?;
            let requests = table.requests(filter);
            for slot in sampler::plan(&requests, limit) {
                let name = if slot.stratum.is_empty() {
                    "(none)"
                } else {
                    slot.stratum.as_str()
                };
                println!("{name}\t{}/{}", slot.target, slot.available);
            }

            let sample = stratified_sample(requests, limit, &mut rng_from(seed));
            match output {
                Some(path) => {
                    let rows: BTreeSet<usize> = sample.iter().map(|r| r.row).collect();
                    let written = table.write_rows(&path, &rows)?;
                    tracing::info!(output = %path.display(), rows = written, "sample written");
                }
                None => {
                    for req in &sample {
                        println!(
                            "{}\t{}\t{}",
                            req.row,
                            req.ground_truth.as_deref().unwrap_or(""),
                            req.question
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
