use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use vigil::api::{self, AppState};
use vigil::classify::{FrameClassifier, RemoteClassifier, UnloadedClassifier};
use vigil::clip::ClipRecorder;
use vigil::db::{Database, EventRepository, SqliteEventRepository, SqliteStreamRepository};
use vigil::hub::BroadcastHub;
use vigil::ingest::default_decoder_factory;
use vigil::manager::StreamManager;
use vigil::VigilConfig;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Multi-stream real-time violence detection pipeline")]
#[command(version)]
#[command(
    long_about = "Monitors RTSP/RTMP/webcam/file streams with a temporal CNN classifier, \
records evidence clips around detected violence events and exposes control, live preview \
and event review over an HTTP + WebSocket API."
)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "vigil.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(
        long,
        value_name = "FORMAT",
        help = "Log output format: json, pretty, or compact"
    )]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    let config = match VigilConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let _log_guard = init_logging(&args, &config)?;

    info!("Starting vigil v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }
    config.ensure_directories()?;

    // Repository unreachable after retries is fatal at startup
    let db = match Database::open_with_retry(
        &config.storage.database_path(),
        5,
        Duration::from_secs(3),
    )
    .await
    {
        Ok(db) => db,
        Err(e) => {
            error!("Repository unreachable: {}", e);
            std::process::exit(1);
        }
    };

    let stream_repo = Arc::new(SqliteStreamRepository::new(db.clone()));
    let event_repo: Arc<dyn EventRepository> = Arc::new(SqliteEventRepository::new(db));
    let hub = BroadcastHub::new(1024);

    // A classifier construction failure leaves the API serving with the
    // model reported as not loaded; detectors simply stay idle.
    let classifier: Arc<dyn FrameClassifier> = match RemoteClassifier::new(
        &config.classifier.ml_service_url,
        Duration::from_secs(config.classifier.ml_service_timeout_seconds),
    ) {
        Ok(remote) => {
            let remote = Arc::new(remote);
            let probe = Arc::clone(&remote);
            tokio::spawn(async move {
                if probe.probe().await {
                    info!("Inference service reachable");
                } else {
                    warn!("Inference service not reachable yet; scores resume when it is");
                }
            });
            remote
        }
        Err(e) => {
            warn!("Classifier unavailable: {}; continuing without inference", e);
            Arc::new(UnloadedClassifier)
        }
    };

    let recorder = Arc::new(ClipRecorder::new(
        &config.storage.clips_dir,
        config.stream.target_fps,
    )?);

    let manager = Arc::new(StreamManager::new(
        config.clone(),
        stream_repo,
        Arc::clone(&event_repo),
        hub.clone(),
        Arc::clone(&classifier),
        recorder,
        None,
        default_decoder_factory(),
    ));
    manager.initialize().await?;

    let state = AppState {
        manager: Arc::clone(&manager),
        events: event_repo,
        hub,
        classifier,
        config: Arc::new(config),
    };

    api::serve(state, shutdown_signal()).await?;

    // Streams stop and in-flight events are force-finalized before exit
    manager.shutdown().await;
    info!("vigil exited cleanly");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn init_logging(
    args: &Args,
    config: &VigilConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    };

    let log_level = if args.debug || config.server.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        &config.log.level
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vigil={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
        None => fmt::layer().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter);

    // Optional additional log file target
    let guard = match &config.log.file {
        Some(file) => {
            let path = std::path::Path::new(file);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "vigil.log".to_string());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    };

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Vigil configuration file");
    println!("# These are the built-in defaults; override in TOML or env vars");
    println!();

    let default_config = VigilConfig::default();
    match toml::to_string_pretty(&default_config) {
        Ok(toml_str) => println!("{}", toml_str),
        Err(e) => eprintln!("Failed to render default config: {}", e),
    }
}
