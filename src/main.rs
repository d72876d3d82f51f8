use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use isoforge::config::AppConfig;
use isoforge::core::image_builder::{ImageBuilderType, create_builder};
use isoforge::core::models::FileSystemType;
use isoforge::core::orchestrator::{JobEvent, JobTimeouts, Orchestrator, ProcessLauncher};
use isoforge::core::request::{JobRequest, RequestOptions};
use isoforge::core::worker;
use isoforge::logging::{self, LogConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "isoforge")]
#[command(about = "Assemble bootable ISO images from a directory tree", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a source directory
    Build(BuildArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Config-affecting flags shared by `build` and `config`.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    builder: Option<ImageBuilderType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    file_system: Option<FileSystemType>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

#[derive(Args)]
struct BuildArgs {
    /// Directory whose contents become the image root
    source: PathBuf,

    /// Output image path (defaults to `<source>.iso` beside the source)
    #[arg(long, short)]
    destination: Option<PathBuf>,

    /// Volume label (defaults to the destination's base name)
    #[arg(long, short)]
    label: Option<String>,

    /// Replace an existing destination
    #[arg(long)]
    overwrite: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    destination: PathBuf,
    #[arg(long)]
    label: String,
    #[arg(long, value_enum)]
    file_system: FileSystemType,
    #[arg(long, value_enum)]
    builder: ImageBuilderType,
    #[arg(long)]
    overwrite: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Build(args) => {
            let config = AppConfig::new(config_path, Some(&args.config))?;
            init_logging(&config);
            run_build(args, config, cli.config.clone()).await
        }
        Commands::Config(args) => {
            let config = AppConfig::new(config_path, Some(&args))?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Worker(args) => {
            let config = AppConfig::new(config_path, None::<&ConfigArgs>)?;
            init_logging(&config);
            let code = run_worker(args, &config).await;
            std::process::exit(if code == 0 { 0 } else { 1 });
        }
    }
}

fn init_logging(config: &AppConfig) {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });
}

async fn run_build(args: BuildArgs, config: AppConfig, config_path: Option<PathBuf>) -> Result<()> {
    let request = JobRequest::resolve(RequestOptions {
        source: args.source,
        destination: args.destination,
        label: args.label,
        file_system: config.file_system,
        overwrite: args.overwrite,
        builder: config.builder,
    })?;
    request.preflight()?;

    let launcher = ProcessLauncher::current_exe(config_path)?;
    let orchestrator = Orchestrator::new(Arc::new(launcher), JobTimeouts::from(&config.timeouts));

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling image job");
            ctrl_c_token.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(report_events(rx));

    let report = orchestrator.run(&request, tx, cancel).await;
    let _ = printer.await;

    let image = report.into_result().context("Image job failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&image).context("Failed to render image descriptor")?
    );
    Ok(())
}

async fn run_worker(args: WorkerArgs, config: &AppConfig) -> i32 {
    let request = JobRequest {
        source: args.source,
        destination: args.destination,
        label: args.label,
        file_system: args.file_system,
        overwrite: args.overwrite,
        builder: args.builder,
    };
    let builder = create_builder(request.builder, &config.mkisofs);
    worker::run(request, builder).await
}

async fn report_events(mut rx: mpsc::Receiver<JobEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            JobEvent::Started { job_id, pid } => info!(%job_id, ?pid, "Worker started"),
            JobEvent::BootCatalog { platforms } if platforms.is_empty() => {
                warn!("No boot files found, the image will not be bootable")
            }
            JobEvent::Progress {
                bytes_written,
                total_bytes,
            } => {
                let percent = if total_bytes == 0 {
                    100.0
                } else {
                    bytes_written as f64 * 100.0 / total_bytes as f64
                };
                info!(bytes_written, total_bytes, "Writing image: {percent:.1}%");
            }
            JobEvent::Finished { state, result } if !result.is_success() => {
                error!(?state, %result, "{}", result.describe())
            }
            _ => {}
        }
    }
}
