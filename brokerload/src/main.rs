//! brokerload - drives configurable load against a pub/sub broker and reports
//! throughput, latency and message-integrity figures.

use anyhow::{bail, Context, Result};
use brokerload::args::{Args, Command};
use brokerload::config::RunConfig;
use brokerload::report::{export_results, render_summary};
use brokerload::runner::{Runner, StopReason};
use brokerload::signals::spawn_interrupt_watcher;
use brokerload::templates::Template;
use brokerload::utils::format_bytes;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Initialize tracing subscriber for structured logging
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

/// Loads a config and prints every validation problem
///
/// Fails if the file cannot be read or any problem was found.
fn load_valid_config(path: &Path) -> Result<RunConfig> {
    let cfg = RunConfig::load(path)?;
    let problems = cfg.validate();
    if !problems.is_empty() {
        eprintln!("Config {} is invalid:", path.display());
        for problem in &problems {
            eprintln!("  - {}", problem);
        }
        bail!("{} validation error(s)", problems.len());
    }
    Ok(cfg)
}

/// Print startup information: endpoint, duration, topics and worker groups
fn print_startup_info(cfg: &RunConfig) {
    info!("Starting brokerload test '{}'", cfg.test_name);
    if let Some(description) = &cfg.description {
        info!("{}", description);
    }
    info!(
        "Service: {} - Duration: {} - Producers: {} - Consumers: {}",
        cfg.broker.service_url,
        cfg.execution.duration,
        cfg.total_producers(),
        cfg.total_consumers()
    );
    if let Some(timeout) = &cfg.broker.connection_timeout {
        info!("Connection timeout: {}", timeout);
    }
    for topic in &cfg.topics {
        info!(
            "Topic {} (partitions: {}, schema: {:?}, dispatch: {:?})",
            topic.name, topic.partitions, topic.schema_type, topic.dispatch_strategy
        );
    }
    for group in &cfg.producers {
        let rate = if group.rate_per_second == 0 {
            "unlimited".to_string()
        } else {
            format!("{}/s", group.rate_per_second)
        };
        info!(
            "Producer group {} -> {}: {} x {} messages of {}",
            group.name,
            group.topic,
            group.count,
            rate,
            format_bytes(group.message_size as u64)
        );
    }
    for group in &cfg.consumers {
        info!(
            "Consumer group {} <- {} ({}, {:?}): {} instances",
            group.name, group.topic, group.subscription, group.subscription_type, group.count
        );
    }
}

async fn run(config: PathBuf, duration: Option<String>) -> Result<()> {
    let mut cfg = load_valid_config(&config)?;
    if let Some(duration) = duration {
        cfg.override_duration(&duration)?;
    }
    print_startup_info(&cfg);

    let client = brokerload::connect(&cfg.broker.service_url)
        .with_context(|| format!("connect to {}", cfg.broker.service_url))?;

    let shutdown = CancellationToken::new();
    let watcher = spawn_interrupt_watcher(shutdown.clone());
    let outcome = Runner::new(client).run(&cfg, shutdown.clone()).await;
    shutdown.cancel();
    let _ = watcher.await;
    let outcome = outcome?;

    if outcome.stop == StopReason::Interrupted {
        info!("Run stopped early after {:.1}s", outcome.snapshot.elapsed_sec);
    }
    println!("{}", render_summary(&cfg, &outcome.snapshot, &outcome.rates));
    export_results(&cfg, &outcome.snapshot);
    info!("brokerload run completed");
    Ok(())
}

fn validate(config: PathBuf) -> Result<()> {
    load_valid_config(&config)?;
    println!("Config is valid");
    Ok(())
}

fn init(template: Template, output: Option<PathBuf>) -> Result<()> {
    let path = Command::init_output(template, output);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, template.contents())
        .with_context(|| format!("write template {}", path.display()))?;
    println!("Wrote {:?} template to {}", template, path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.quiet);

    match args.command {
        Command::Run { config, duration } => run(config, duration).await,
        Command::Validate { config } => validate(config),
        Command::Init { template, output } => init(template, output),
    }
}
