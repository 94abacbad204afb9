//! Threadwatch: watch a catalog or thread from the command line.
//!
//! This is the application entry point. It loads configuration from TOML,
//! initializes tracing, builds the sync service and follows one descriptor,
//! logging every update until interrupted.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use threadwatch::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use threadwatch::sync::{ChannelListener, ContentDescriptor, SyncEvent, SyncService};

/// Threadwatch: follow an imageboard catalog or thread
#[derive(Parser, Debug)]
#[command(name = "threadwatch", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "threadwatch=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Exit after the first update
    #[arg(long)]
    once: bool,

    /// Site name as configured in a [[site]] section
    site: String,

    /// Board code
    board: String,

    /// Thread number; watches the board catalog when omitted
    thread: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(config = %args.config, "Loaded configuration");

    let service = SyncService::from_config(&config)?;

    let descriptor = match args.thread {
        Some(thread_no) => ContentDescriptor::thread(&args.site, &args.board, thread_no),
        None => ContentDescriptor::catalog(&args.site, &args.board),
    };

    let engine = service.engine(descriptor.clone()).await;
    let (listener, mut events) = ChannelListener::new();
    engine
        .add_listener(listener)
        .await
        .ok_or("engine stopped before it could be watched")?;
    engine.request_data(false).await;
    tracing::info!(%descriptor, "Watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SyncEvent::Data(thread) => {
                        tracing::info!(
                            posts = thread.post_count(),
                            deleted_posts = thread.deleted_posts().count(),
                            closed = thread.closed,
                            archived = thread.archived,
                            deleted = thread.deleted,
                            result = ?thread.last_result,
                            "Update"
                        );
                        // Catalogs are not auto-polled; keep them fresh here
                        if !descriptor.is_thread() {
                            engine.set_timer().await;
                        }
                    }
                    SyncEvent::Error { kind, message } => {
                        tracing::error!(%kind, %message, "Sync failed");
                    }
                }
                if args.once {
                    break;
                }
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
