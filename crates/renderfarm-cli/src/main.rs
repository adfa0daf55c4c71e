//! renderfarm: coordinate a render job or work for one.

mod output;
mod pattern;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use renderfarm::{
    ConnectionConfig, DEFAULT_PORT, FarmServer, JobConfig, OverflowPolicy, RENDERFARM_VERSION,
    ServerConfig, WorkerConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::output::FrameSink;
use crate::render::CommandRenderer;

const MIB: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "renderfarm", about = "Distributed frame rendering over TCP", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hand out the frames of a scene to connecting workers
    Serve(ServeArgs),

    /// Connect to a coordinator and render the frames it assigns
    Work(WorkArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Scene file sent to every worker
    scene: PathBuf,

    /// First frame index
    #[arg(long, default_value_t = 0)]
    start: u32,

    /// Number of frames to render
    #[arg(long)]
    count: u32,

    #[arg(long, env = "RENDERFARM_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "RENDERFARM_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory receiving delivered frames and manifest.json
    #[arg(short, long, env = "RENDERFARM_OUTPUT", default_value = "frames")]
    output: PathBuf,

    /// File name for each frame; a run of `#` becomes the padded frame number
    #[arg(long, default_value = "frame_####.png")]
    output_pattern: String,

    /// Frames a worker may hold at once
    #[arg(long, default_value_t = 1)]
    pipeline_depth: usize,

    /// Largest accepted frame, in MiB
    #[arg(long, env = "RENDERFARM_MAX_FRAME_MIB", default_value_t = 256)]
    max_frame_mib: usize,

    /// Bound on each worker's outbound queue; a worker that falls behind it
    /// is dropped and its frames handed out again (unbounded if omitted)
    #[arg(long)]
    max_pending: Option<usize>,

    /// Keep accepting workers after the last frame is delivered
    #[arg(long)]
    keep_running: bool,
}

#[derive(Args)]
struct WorkArgs {
    /// Coordinator address
    #[arg(env = "RENDERFARM_COORDINATOR", default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    coordinator: String,

    /// Render command; `{scene}`, `{frame}` and `{output}` are substituted
    #[arg(long, env = "RENDERFARM_RENDER_COMMAND")]
    command: String,

    /// Scratch directory for the scene and rendered files
    #[arg(long, env = "RENDERFARM_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Where the command writes each frame, relative to the work directory
    #[arg(long, default_value = "out/frame_####.png")]
    output_pattern: String,

    /// Largest accepted frame, in MiB
    #[arg(long, env = "RENDERFARM_MAX_FRAME_MIB", default_value_t = 256)]
    max_frame_mib: usize,

    /// Bound on the outbound queue to the coordinator (unbounded if omitted)
    #[arg(long)]
    max_pending: Option<usize>,

    /// On a full outbound queue drop the oldest progress report instead of
    /// disconnecting; results are never dropped
    #[arg(long)]
    drop_oldest: bool,
}

fn overflow_policy(drop_oldest: bool) -> OverflowPolicy {
    if drop_oldest {
        OverflowPolicy::DropOldest
    } else {
        OverflowPolicy::Disconnect
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    info!(version = RENDERFARM_VERSION, "Starting renderfarm");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    match cli.command {
        Commands::Serve(args) => serve(args, shutdown).await,
        Commands::Work(args) => work(args, shutdown).await,
    }
}

async fn serve(args: ServeArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let scene = tokio::fs::read(&args.scene)
        .await
        .with_context(|| format!("failed to read scene {}", args.scene.display()))?;
    info!(path = %args.scene.display(), bytes = scene.len(), "Loaded scene");

    let connection = ConnectionConfig::default()
        .with_max_frame_length(args.max_frame_mib.saturating_mul(MIB))
        .with_max_pending(args.max_pending);
    let config = ServerConfig::default()
        .with_host(args.host)
        .with_port(args.port)
        .with_connection(connection);
    let job = JobConfig::new(scene, args.start, args.count)
        .with_pipeline_depth(args.pipeline_depth)
        .with_stop_when_complete(!args.keep_running);

    let sink = FrameSink::create(&args.output, args.output_pattern)
        .await
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let server = FarmServer::bind(config).await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(sink.consume(events_rx));
    let summary = server.run(job, events_tx, shutdown).await?;
    let mut sink = writer.await?;

    let manifest = sink.write_manifest(&summary).await?;
    info!(
        path = %manifest.display(),
        frames = sink.records().len(),
        "Manifest written"
    );
    if !summary.complete {
        warn!(
            frames_completed = summary.frames_completed,
            frames_total = args.count,
            "Stopped before every frame was delivered"
        );
    }
    Ok(())
}

async fn work(args: WorkArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let work_dir = args
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join(format!("renderfarm-{}", std::process::id())));
    info!(work_dir = %work_dir.display(), "Using work directory");

    let renderer = Arc::new(CommandRenderer::new(
        args.command,
        work_dir,
        args.output_pattern,
    ));
    let config = WorkerConfig::default().with_connection(
        ConnectionConfig::default()
            .with_max_frame_length(args.max_frame_mib.saturating_mul(MIB))
            .with_max_pending(args.max_pending)
            .with_overflow(overflow_policy(args.drop_oldest)),
    );

    let summary = renderfarm::connect(args.coordinator, renderer, config, shutdown).await?;
    info!(
        frames_delivered = summary.frames_delivered,
        frames_failed = summary.frames_failed,
        "Worker finished"
    );
    Ok(())
}

/// `RUST_LOG` wins; otherwise `RENDERFARM_LOG` picks the level for our crates.
/// `LOG_FORMAT=json` switches to JSON lines. Everything goes to stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RENDERFARM_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("renderfarm={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}
