//! vnsi-server: live TV and recording streaming backend speaking the VNSI protocol.
//!
//! Clients connect over TCP, list channels, timers, recordings and the
//! programme guide, and stream live channels or stored recordings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

mod demuxer;
mod live;
mod logging;
mod osd;
mod recording;
mod scan;
mod server;
mod store;

use live::{FileReplayInput, LiveSources, TunerPool};
use osd::HeadlessOsd;
use scan::{ScanCoordinator, UnsupportedScanner};
use server::{Server, ServerConfig, ServerContext, SessionSettings};
use store::{spawn_catalog_watcher, Catalog, MemoryStore, SetupStore};

const DEFAULT_LISTEN: &str = "0.0.0.0:34890";
const DEFAULT_CONFIG_FILE: &str = "vnsi-server.toml";
const CATALOG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 256;

/// vnsi-server - VNSI live TV and recording streaming server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Catalog of channels, timers, recordings and guide data (TOML)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// File persisting setup values and the channel filter (JSON)
    #[arg(long)]
    setup_file: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(short = 'c', long)]
    max_connections: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    streaming: StreamingSection,
    #[serde(default)]
    storage: StorageSection,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    listen: Option<String>,
    max_connections: usize,
    read_timeout_ms: u64,
    stream_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: None,
            max_connections: 64,
            read_timeout_ms: 10_000,
            stream_timeout_secs: 10,
        }
    }
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct StreamingSection {
    tuners: usize,
    live_buffer_kib: usize,
    replay_bitrate_kbps: u32,
    replay_loop: bool,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            tuners: 2,
            live_buffer_kib: 4096,
            replay_bitrate_kbps: 8000,
            replay_loop: true,
        }
    }
}

#[derive(Debug, serde::Deserialize, Default)]
struct StorageSection {
    catalog: Option<String>,
    setup_file: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(config) => {
                eprintln!("Loaded config from: {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let listen_addr = match (args.listen, file_config.server.listen.as_deref()) {
        (Some(addr), _) => addr,
        (None, Some(addr)) => addr.parse()?,
        (None, None) => DEFAULT_LISTEN.parse()?,
    };
    let max_connections = args
        .max_connections
        .unwrap_or(file_config.server.max_connections);
    let catalog_path = args
        .catalog
        .clone()
        .or_else(|| file_config.storage.catalog.as_ref().map(PathBuf::from));
    let setup_path = args
        .setup_file
        .clone()
        .or_else(|| file_config.storage.setup_file.as_ref().map(PathBuf::from));

    // Collaborator stores
    let catalog = match &catalog_path {
        Some(path) => {
            info!("Loading catalog: {:?}", path);
            Catalog::load(path).map_err(|e| {
                error!("Failed to load catalog {:?}: {}", path, e);
                e
            })?
        }
        None => {
            warn!("No catalog configured, starting empty");
            Catalog::default()
        }
    };
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let store = Arc::new(MemoryStore::new(catalog, events));
    let setup = Arc::new(match &setup_path {
        Some(path) => SetupStore::open(path)?,
        None => SetupStore::in_memory(),
    });

    // Live input
    let streaming = &file_config.streaming;
    info!(
        "{} tuners, replay at {} kbit/s{}",
        streaming.tuners,
        streaming.replay_bitrate_kbps,
        if streaming.replay_loop { " (looping)" } else { "" }
    );
    let sources = Arc::new(LiveSources::new(
        TunerPool::new(streaming.tuners.max(1)),
        Arc::new(FileReplayInput::new(streaming.replay_bitrate_kbps, streaming.replay_loop)),
        streaming.live_buffer_kib.max(1) * 1024,
    ));

    let settings = SessionSettings {
        read_timeout: Duration::from_millis(file_config.server.read_timeout_ms),
        stream_timeout: Duration::from_secs(file_config.server.stream_timeout_secs),
    };
    let ctx = ServerContext::new(
        Arc::clone(&store),
        setup,
        sources,
        ScanCoordinator::new(Arc::new(UnsupportedScanner)),
        Arc::new(HeadlessOsd::default()),
        settings,
    )?;

    let shutdown = CancellationToken::new();
    let watcher = catalog_path.map(|path| {
        spawn_catalog_watcher(Arc::clone(&store), path, CATALOG_POLL_INTERVAL, shutdown.clone())
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    let server = Server::bind(
        ServerConfig {
            listen_addr,
            max_connections,
        },
        ctx,
    )
    .await?;
    server.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    Ok(())
}
