use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use opentelemetry::global;
use opentelemetry::metrics::Unit;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use imgdelta::api::routes;
use imgdelta::config::AppConfig;
use imgdelta::engine::{self, DeltaEngine, EngineConfig};
use imgdelta::registry::{MemoryRegistry, OciRegistry, RegistryDelegate};
use imgdelta::selector::AlgorithmChoice;

mod telemetry;

/// Delta distribution service for OCI artifacts
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service (default)
    Serve {
        /// Keep artifacts and deltas in memory instead of a registry
        #[arg(long)]
        memory: bool,
    },

    /// Compute a delta between two local files
    Diff {
        #[arg(long)]
        old: PathBuf,

        #[arg(long)]
        new: PathBuf,

        /// Delta tag naming the algorithms, e.g. bsdiff_zstd
        #[arg(long, default_value = "bsdiff")]
        algorithm: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Rebuild a file from its old version and a delta
    Patch {
        #[arg(long)]
        old: PathBuf,

        #[arg(long)]
        delta: PathBuf,

        /// Tag the delta was stored under
        #[arg(long, default_value = "bsdiff")]
        algorithm: String,

        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => serve(memory).await,
        Commands::Diff { old, new, algorithm, output } => {
            telemetry::init_subscriber(None);
            tokio::task::spawn_blocking(move || diff_files(&old, &new, &algorithm, &output)).await?
        }
        Commands::Patch { old, delta, algorithm, output } => {
            telemetry::init_subscriber(None);
            tokio::task::spawn_blocking(move || patch_files(&old, &delta, &algorithm, &output)).await?
        }
    }
}

async fn serve(memory: bool) -> anyhow::Result<()> {
    telemetry::init_subscriber(telemetry::otlp_tracer()?);

    let config = AppConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let metrics = telemetry::Metrics::new()?;
    let meter = metrics.meter();
    let app_metrics = Arc::new(routes::AppMetrics {
        request_counter: meter
            .u64_counter("http_requests_total")
            .with_description("Delta requests served, by status")
            .with_unit(Unit::new("requests"))
            .init(),
    });

    let delegate: Arc<dyn RegistryDelegate> = if memory {
        warn!("Serving from an in-memory registry, nothing is persisted");
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(OciRegistry::new(&config.registry))
    };
    let engine = Arc::new(DeltaEngine::new(delegate, EngineConfig::from(&config.delta), &meter));

    let state = (Arc::clone(&engine), app_metrics);
    let scrape = metrics.registry();
    let app = Router::new()
        .route("/metrics", get(move || telemetry::render(scrape.clone())))
        .merge(routes::delta_router(state.clone()))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("imgdeltad listening on {}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // Running computations may still push their deltas
    engine.shutdown().await;

    metrics.shutdown();
    global::shutdown_tracer_provider();
    Ok(())
}

fn diff_files(old: &Path, new: &Path, algorithm: &str, output: &Path) -> anyhow::Result<()> {
    let choice = AlgorithmChoice::from_tag(algorithm).with_context(|| format!("unknown algorithm {}", algorithm))?;

    let old_file = BufReader::new(File::open(old).with_context(|| format!("opening {}", old.display()))?);
    let new_file = BufReader::new(File::open(new).with_context(|| format!("opening {}", new.display()))?);

    let mut delta = engine::compute_delta(choice, old_file, new_file)?;

    let mut out = BufWriter::new(File::create(output).with_context(|| format!("creating {}", output.display()))?);
    let written = io::copy(&mut delta, &mut out)?;
    info!("Wrote {} byte {} delta to {}", written, choice, output.display());
    Ok(())
}

fn patch_files(old: &Path, delta: &Path, algorithm: &str, output: &Path) -> anyhow::Result<()> {
    let old_file = BufReader::new(File::open(old).with_context(|| format!("opening {}", old.display()))?);
    let delta_file = BufReader::new(File::open(delta).with_context(|| format!("opening {}", delta.display()))?);

    let mut rebuilt = engine::apply_delta(algorithm, old_file, delta_file)?;

    let mut out = BufWriter::new(File::create(output).with_context(|| format!("creating {}", output.display()))?);
    let written = io::copy(&mut rebuilt, &mut out)?;
    info!("Wrote {} bytes to {}", written, output.display());
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&str>();

    let received = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };
    info!("Received {}, draining requests", received);
}
