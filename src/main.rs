//! Drive Revenant daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{info, warn};

use drive_revenant::cli::{default_event_log_path, Cli, Command};
use drive_revenant::domain::{default_ping_dir, normalize_letter};
use drive_revenant::{
    Config, ConfigEnumerator, DriveEnumerator, Engine, IoEngine, NdjsonSink, ProbeTarget, Prober,
    StaticPolicy, TokioClock,
};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Command::Run) | None => cmd_run(config).await,
        Some(Command::CheckConfig) => cmd_check_config(&config),
        Some(Command::Ping { letter }) => cmd_ping(&config, &letter).await,
    }
}

/// Run the scheduler in the foreground until Ctrl+C.
async fn cmd_run(config: Config) -> Result<()> {
    let clock = Arc::new(TokioClock::new());
    let prober = Arc::new(IoEngine::new(&config.io, clock.clone()));
    let policy = Arc::new(StaticPolicy::new());

    let events_path = default_event_log_path();
    let events =
        Arc::new(NdjsonSink::create(&events_path).context("Failed to open the event log")?);
    info!(path = %events_path.display(), "Writing NDJSON events");

    let enumerator = ConfigEnumerator::new(&config);
    let (engine, handle) = Engine::new(config, clock, prober, policy, events);
    let engine_task = tokio::spawn(engine.run());

    let drives = enumerator.list().await;
    if drives.is_empty() {
        warn!("No drives configured; add a [drives] table to the config");
    }
    for drive in drives {
        handle
            .set_drive_config(drive.letter.clone(), drive.spec.clone())
            .await
            .map_err(|e| eyre::eyre!("Engine rejected drive {}: {e}", drive.letter))?;
    }

    info!("Drive Revenant running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await.ok();
    if tokio::time::timeout(Duration::from_millis(2000), engine_task)
        .await
        .is_err()
    {
        warn!("Scheduler did not drain within 2000ms, abandoning");
    }

    Ok(())
}

/// Print the effective configuration after defaulting.
fn cmd_check_config(config: &Config) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// One-shot manual probe of a single drive.
async fn cmd_ping(config: &Config, raw: &str) -> Result<()> {
    let letter =
        normalize_letter(raw).ok_or_else(|| eyre::eyre!("Invalid drive letter: {raw}"))?;

    let clock = Arc::new(TokioClock::new());
    let io = IoEngine::new(&config.io, clock);

    let ping_dir = config
        .drives
        .get(&letter)
        .and_then(|spec| spec.ping_dir.clone())
        .unwrap_or_else(|| default_ping_dir(&letter));
    let target = ProbeTarget {
        letter: letter.clone(),
        ping_dir,
    };

    let write = io.probe_write(&target).await;
    println!(
        "{letter}: write {:?} in {}ms ({})",
        write.code, write.latency_ms, write.notes
    );
    let read = io.probe_read(&target).await;
    println!(
        "{letter}: read {:?} in {}ms ({})",
        read.code, read.latency_ms, read.notes
    );

    Ok(())
}
