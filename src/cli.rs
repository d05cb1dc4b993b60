//! Command-line front end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use browser_driver::{BrowserDriver, CdpDriver, DriverConfig};
use clap::{Parser, Subcommand};
use pacts_core_types::{EngineConfig, Verdict};
use run_coordinator::EngineStack;
use selector_cache::{DurableCacheStore, JsonFileStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::artifact::Artifact;
use crate::planner::{Planner, RuleBasedPlanner};
use crate::requirement::Requirement;

#[derive(Parser)]
#[command(name = "pacts", version, about = "Self-healing browser test automation")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML/YAML). Defaults are probed when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write logs to daily-rotated files in this directory instead of
    /// stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a requirement file against an origin.
    Run {
        /// Requirement file (plain text or YAML).
        requirement: PathBuf,

        /// Origin URL the run starts from.
        #[arg(long)]
        url: String,

        /// Run with a visible browser window.
        #[arg(long)]
        headed: bool,

        /// Chrome/Chromium executable override.
        #[arg(long)]
        chrome_path: Option<PathBuf>,

        /// Attach to a running browser instead of launching one.
        #[arg(long)]
        ws_url: Option<String>,

        /// Override the HITL wait bound (e.g. "5m", "90s").
        #[arg(long, value_parser = humantime::parse_duration)]
        hitl_timeout: Option<Duration>,
    },

    /// Inspect or clear the durable selector cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Entry counts and per-entry hit statistics.
    Stats,
    /// Drop every durable entry.
    Clear,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.json_logs, cli.log_dir.as_deref());
    let config = crate::config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            requirement,
            url,
            headed,
            chrome_path,
            ws_url,
            hitl_timeout,
        } => {
            let mut config = config;
            if let Some(timeout) = hitl_timeout {
                config.hitl_timeout_ms = timeout.as_millis() as u64;
            }
            run_requirement(config, &requirement, &url, headed, chrome_path, ws_url).await
        }
        Command::Cache { command } => cache_command(config, command),
    }
}

async fn run_requirement(
    config: EngineConfig,
    requirement_path: &std::path::Path,
    url: &str,
    headed: bool,
    chrome_path: Option<PathBuf>,
    ws_url: Option<String>,
) -> Result<()> {
    let requirement = Requirement::load(requirement_path)
        .with_context(|| format!("loading requirement {}", requirement_path.display()))?;
    info!(
        scenario = %requirement.scenario,
        steps = requirement.steps.len(),
        "requirement parsed"
    );

    let planner = RuleBasedPlanner::new();
    let intents = planner.plan(requirement.steps.clone());

    let driver_config = DriverConfig {
        headless: !headed,
        executable: chrome_path.unwrap_or_default(),
        websocket_url: ws_url,
        action_timeout_ms: config.action_timeout_ms,
        ..DriverConfig::default()
    };
    let driver: Arc<dyn BrowserDriver> = Arc::new(CdpDriver::new(driver_config));
    let stack = EngineStack::build(driver, config.clone())?;

    // Ctrl-C cancels at the next suspension point; the run still
    // terminates with a verdict and a persisted record.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let record = stack.coordinator.run(url, intents.clone(), cancel).await;

    let counters = stack.telemetry.counters();
    println!("scenario:   {}", requirement.scenario);
    println!("run:        {}", record.req_id);
    println!(
        "steps:      {}/{} executed",
        record.executed_steps.len(),
        intents.len()
    );
    println!("heal moves: {}", record.heal_events.len());
    println!(
        "cache:      {} fast / {} durable hits, {} misses",
        counters.cache_hit_fast, counters.cache_hit_durable, counters.cache_miss
    );

    match &record.verdict {
        Verdict::Pass => {
            let artifact =
                Artifact::from_run(&requirement.scenario, url, &intents, &record);
            let path = artifact.write_to(&config.artifact_dir)?;
            println!("verdict:    PASS");
            println!("artifact:   {}", path.display());
            Ok(())
        }
        Verdict::Fail { kind, rca_detail } => {
            println!("verdict:    FAIL ({kind})");
            println!("cause:      {rca_detail}");
            bail!("run failed: {kind}");
        }
        Verdict::Blocked { signature } => {
            println!("verdict:    BLOCKED");
            println!("signature:  {signature}");
            bail!("run blocked by challenge page");
        }
    }
}

fn cache_command(config: EngineConfig, command: CacheCommand) -> Result<()> {
    let store = JsonFileStore::open(&config.cache_path)
        .with_context(|| format!("opening cache at {}", config.cache_path.display()))?;
    match command {
        CacheCommand::Stats => {
            let entries = store.all()?;
            println!(
                "{} durable entries at {}",
                entries.len(),
                config.cache_path.display()
            );
            for entry in entries {
                println!(
                    "  {:40} {:12} stable={} hits={} misses={}",
                    entry.selector,
                    entry.strategy.name(),
                    entry.stable,
                    entry.hits,
                    entry.misses
                );
            }
        }
        CacheCommand::Clear => {
            store.clear()?;
            println!("durable cache cleared");
        }
    }
    Ok(())
}

fn init_logging(json: bool, log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pacts.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            Some(guard)
        }
        None => {
            if json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
            None
        }
    }
}
