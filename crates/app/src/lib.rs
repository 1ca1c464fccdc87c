use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cadenza_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use cadenza_core::engine::{EngineParams, GenerationEngine, SynthEngine};
use cadenza_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use cadenza_core::placement::{detect_accelerators, CapacityPlacement, PlacementPolicy};
use cadenza_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "cadenza",
    about = "AI music generation server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one track locally without starting the server.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(help = "What the track is about")]
    prompt: String,
    #[arg(short = 'o', long, help = "Output WAV path")]
    output: PathBuf,
    #[arg(long, help = "Lyrics to sing")]
    lyrics: Option<String>,
    #[arg(long, help = "Style/tag string, e.g. \"lofi, mellow\"")]
    tags: Option<String>,
    #[arg(long, default_value_t = 30_000, help = "Target duration in milliseconds")]
    duration_ms: u32,
    #[arg(long, help = "Seed for reproducible generation")]
    seed: Option<u32>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(args).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_plan = logging::compose_logging_init_plan(&LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    });
    let console_filter = parse_env_filter_with_fallback(&init_plan.filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = runtime_mode_name(mode),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Engine construction is the one failure that must be loud at startup: a
/// server that cannot process anything should not bind its port.
fn load_engine(config: &AppConfig) -> Result<Arc<dyn GenerationEngine>> {
    let accelerators = detect_accelerators();
    let placement = CapacityPlacement.place(&accelerators);
    let engine = SynthEngine::load(placement, config.engine.sample_rate)
        .context("failed to load generation engine")?;
    Ok(Arc::new(engine))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let engine = load_engine(&config)?;
    let state = AppState::new(engine, config, cfg_path, data_dir);
    let scheduler = Arc::clone(state.scheduler());
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting cadenza server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            scheduler.shutdown();
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_generate(args: GenerateArgs) -> Result<()> {
    let config = AppConfig::default();
    let engine = load_engine(&config)?;

    let params = EngineParams {
        job_id: "cli".to_string(),
        lyrics: args.lyrics,
        tags: args.tags.unwrap_or_else(|| "pop music".to_string()),
        duration_ms: args.duration_ms,
        temperature: 1.0,
        cfg_scale: 1.5,
        top_k: 50,
        seed: args.seed.unwrap_or_else(rand::random),
        output_path: args.output.clone(),
        reference: None,
        continuation: None,
    };
    info!(seed = params.seed, "Generating track");

    let token = CancellationToken::new();
    let output = tokio::task::spawn_blocking(move || {
        let progress = |percent: u8, msg: &str| {
            print_progress(percent, msg);
        };
        engine.generate(&params, &progress, &token)
    })
    .await
    .context("generation worker panicked")??;

    eprintln!();
    info!(output = %output.audio_path.display(), "Track written");
    Ok(())
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn print_progress(percent: u8, msg: &str) {
    let fraction = f64::from(percent.min(100)) / 100.0;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    eprint!("\r[{bar}] {percent:3}% | {msg}    ");
}
