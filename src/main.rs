//! brokermesh - standalone mesh node
//!
//! Usage:
//!   brokermesh [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -L, --listen <ADDR>    Cluster listen address (default: 0.0.0.0:7947)
//!   -n, --name <NAME>      Node name (default: host name)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use brokermesh::cluster::ClusterManager;
use brokermesh::config::Config;
use brokermesh::topic::{MemoryTopicStore, SubscriptionTree};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// brokermesh - MQTT broker cluster mesh node
#[derive(Parser, Debug)]
#[command(name = "brokermesh")]
#[command(version)]
#[command(about = "Cluster mesh layer for MQTT brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster listen address
    #[arg(short = 'L', long)]
    listen: Option<SocketAddr>,

    /// Node name announced to peers
    #[arg(short, long)]
    name: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(listen) = args.listen {
        config.cluster.listen = listen;
    }
    if let Some(name) = args.name {
        config.cluster.name = name;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let local = Arc::new(MemoryTopicStore::new());
    let cluster_topics = Arc::new(SubscriptionTree::new());
    let manager = match ClusterManager::new(config.cluster, local, cluster_topics) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Error initializing cluster: {}", e);
            std::process::exit(1);
        }
    };

    let signal_manager = manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                signal_manager.close();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    manager.start().await?;

    let stats = manager.stats();
    info!(
        "Final stats: {} delivered, {} forwarded, {} links accepted, {} dialed",
        stats.messages_sent, stats.messages_forwarded, stats.links_accepted, stats.links_dialed
    );
    Ok(())
}
