use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use stager_engine::canvas::{self, CanvasOutcome, StandardizeOptions};
use stager_engine::config::megabytes;
use stager_engine::keys::KeyPool;
use stager_engine::{EngineConfig, StagingPipeline, StagingRequest};
use tracing::info;

mod server;

#[derive(Debug, Parser)]
#[command(name = "stager", version, about = "Room staging pipeline")]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Command,
}

/// Overrides for values otherwise read from `STAGER_*` environment variables.
#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    public_base_url: Option<String>,
    #[arg(long, global = true)]
    image_model: Option<String>,
    #[arg(long, global = true)]
    run_deadline_secs: Option<u64>,
    #[arg(long, global = true)]
    max_upload_mb: Option<usize>,
    #[arg(long, global = true)]
    furnish_concurrency: Option<usize>,
    #[arg(long, global = true)]
    detail_concurrency: Option<usize>,
    #[arg(long, global = true)]
    upscale_concurrency: Option<usize>,
}

impl EngineArgs {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(base) = &self.public_base_url {
            config.public_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = &self.image_model {
            config.image_model = model.clone();
        }
        if let Some(secs) = self.run_deadline_secs {
            config.run_deadline = std::time::Duration::from_secs(secs.max(1));
        }
        if let Some(mb) = self.max_upload_mb {
            config.max_upload_bytes = megabytes(mb.clamp(1, 512));
        }
        let limits = &mut config.limits;
        for (flag, slot) in [
            (self.furnish_concurrency, &mut limits.furnish),
            (self.detail_concurrency, &mut limits.detail),
            (self.upscale_concurrency, &mut limits.upscale),
        ] {
            if let Some(value) = flag {
                *slot = value.clamp(1, 64);
            }
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and the output directory.
    Serve(ServeArgs),
    /// Run every stage for one room photo.
    Run(RunArgs),
    /// Normalize an image onto its canonical canvas.
    Standardize(StandardizeArgs),
    /// Fit an image onto a reference image's canvas.
    Fit(FitArgs),
    /// Show how many model credentials are configured.
    Keys,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "STAGER_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "STAGER_PORT", default_value_t = 8000)]
    port: u16,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    room: PathBuf,
    #[arg(long)]
    style: PathBuf,
    #[arg(long, default_value_t = 1)]
    variants: usize,
    #[arg(long, default_value_t = 0)]
    details: usize,
    #[arg(long)]
    no_moodboard: bool,
    #[arg(long)]
    upscale: bool,
}

#[derive(Debug, Parser)]
struct StandardizeArgs {
    input: PathBuf,
    #[arg(long)]
    force_landscape: bool,
    #[arg(long)]
    keep_ratio: bool,
}

#[derive(Debug, Parser)]
struct FitArgs {
    image: PathBuf,
    #[arg(long)]
    reference: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("stager error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("stager=info,stager_engine=info,tower_http=warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = cli.engine.apply(EngineConfig::from_env());
    match cli.command {
        Command::Serve(args) => run_serve(config, args),
        Command::Run(args) => run_pipeline(config, args),
        Command::Standardize(args) => run_standardize(args),
        Command::Fit(args) => run_fit(args),
        Command::Keys => run_keys(&config),
    }
}

fn run_serve(config: EngineConfig, args: ServeArgs) -> Result<i32> {
    // Built before the runtime: the blocking HTTP clients inside must not be
    // created or dropped on an async worker.
    let pipeline = Arc::new(StagingPipeline::from_config(config)?);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed starting tokio runtime")?;
    runtime.block_on(server::serve(pipeline.clone(), addr))?;
    drop(runtime);
    drop(pipeline);
    Ok(0)
}

fn run_pipeline(config: EngineConfig, args: RunArgs) -> Result<i32> {
    let pipeline = StagingPipeline::from_config(config)?;
    let mut request = StagingRequest::new(args.room, args.style);
    request.variants = args.variants;
    request.details = args.details;
    request.moodboard = !args.no_moodboard;
    request.upscale = args.upscale;

    let staged = pipeline.run_all(&request)?;
    info!(run_id = %staged.run_id, artifacts = staged.urls().len(), "run complete");
    println!("{}", serde_json::to_string_pretty(&staged)?);
    Ok(0)
}

fn run_standardize(args: StandardizeArgs) -> Result<i32> {
    let options = StandardizeOptions {
        force_landscape: args.force_landscape,
        keep_ratio: args.keep_ratio,
    };
    print_outcome(canvas::standardize(&args.input, options))
}

fn run_fit(args: FitArgs) -> Result<i32> {
    print_outcome(canvas::fit_to_reference_canvas(&args.image, &args.reference))
}

fn print_outcome(outcome: CanvasOutcome) -> Result<i32> {
    match outcome {
        CanvasOutcome::Normalized(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        CanvasOutcome::Degraded { original, reason } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "degraded": true,
                    "path": original,
                    "reason": reason,
                }))?
            );
            Ok(2)
        }
    }
}

fn run_keys(config: &EngineConfig) -> Result<i32> {
    let pool = KeyPool::from_env(&config.key_prefix, config.key_cooldown)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "prefix": pool.prefix(),
            "status": pool.status(),
            "upscaler_configured": config.upscaler.api_key.is_some(),
        }))?
    );
    Ok(0)
}
