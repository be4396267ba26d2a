//! Hostloop
//!
//! Starts pools of loop workers, evaluates the startup script on each, and
//! checks the deferred invocations it schedules.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hostloop::settings::{DEFAULT_CONFIG_FILE, Overrides, Settings};
use hostloop::trial::{load_script, run_trials};

/// Hostloop worker pool trials
#[derive(Parser, Debug)]
#[command(name = "hostloop")]
#[command(about = "Run loop-worker pool trials", long_about = None)]
struct Args {
    /// Settings file (optional)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Workers per pool
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of rounds
    #[arg(short, long)]
    trials: Option<usize>,

    /// Startup script to run instead of the fixed one
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Grant a host capability: env, threads, io or process (repeatable)
    #[arg(long = "capability", value_name = "NAME")]
    capabilities: Vec<String>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = Overrides {
        workers: args.workers,
        trials: args.trials,
        script: args.script.clone(),
    };
    let settings = Settings::load(&args.config, &overrides, &args.capabilities)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(args, settings))
}

async fn async_main(args: Args, settings: Settings) -> Result<()> {
    info!("Starting hostloop v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} trial(s), {} workers, binding '{}', capabilities [{}]",
        settings.trials,
        settings.workers,
        settings.engine.binding_name,
        settings.engine.capabilities.names().join(", ")
    );

    let script = settings.script.as_deref().map(load_script).transpose()?;
    if let Some(script) = &script {
        info!("Startup script: {}", script.name);
    }

    let summary = run_trials(&settings, script).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    summary.check()
}
