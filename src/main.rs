//! Process bootstrap: CLI parsing, config load, accept loop.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wirecraft::config::{self, AnchorConfig, DaemonConfig};
use wirecraft::net::Listener;
use wirecraft::{Daemon, Shutdown};

/// A daemon that serves deliberately pathological HTTP and WebSocket
/// traffic, driven by crafting specs in request paths.
#[derive(Debug, Parser)]
#[command(name = "wirecraft", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, e.g. 127.0.0.1:9999 (overrides config).
    #[arg(long)]
    bind: Option<String>,

    /// Refuse any spec that needs raw-crafting capability.
    #[arg(long)]
    nocraft: bool,

    /// Refuse any spec containing a pause.
    #[arg(long)]
    nohang: bool,

    /// Hexdump crafted wire bytes to the debug log.
    #[arg(long)]
    hexdump: bool,

    /// Maximum response body size, with optional k/m/g suffix.
    #[arg(long)]
    size_limit: Option<String>,

    /// Directory file-sourced bodies are confined to.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Anchor mapping, `pattern=spec`; may be given multiple times.
    #[arg(long = "anchor")]
    anchors: Vec<String>,

    /// Per-read/write deadline in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wirecraft=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("wirecraft v{} starting", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => DaemonConfig::default(),
    };
    apply_overrides(&mut cfg, &cli)?;
    if let Err(errors) = config::validate_config(&cfg) {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        return Err("configuration rejected".into());
    }

    tracing::info!(
        bind_address = %cfg.listener.bind_address,
        tls = cfg.listener.tls.is_some(),
        nocraft = cfg.craft.nocraft,
        nohang = cfg.craft.nohang,
        size_limit = cfg.craft.size_limit,
        anchors = cfg.anchors.len(),
        "Configuration loaded"
    );

    let listener = Listener::bind(&cfg.listener).await?;
    let daemon = Daemon::new(cfg)?;

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received");
            shutdown.trigger();
        }
    });

    daemon.run(listener, rx).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Fold CLI flags over the loaded config.
fn apply_overrides(cfg: &mut DaemonConfig, cli: &Cli) -> Result<(), String> {
    if let Some(bind) = &cli.bind {
        cfg.listener.bind_address = bind.clone();
    }
    if cli.nocraft {
        cfg.craft.nocraft = true;
    }
    if cli.nohang {
        cfg.craft.nohang = true;
    }
    if cli.hexdump {
        cfg.craft.hexdump = true;
    }
    if let Some(limit) = &cli.size_limit {
        cfg.craft.size_limit = config::parse_size(limit)?;
    }
    if let Some(dir) = &cli.static_dir {
        cfg.craft.sandbox_root = Some(dir.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        cfg.timeouts.request_ms = ms;
    }
    for anchor in &cli.anchors {
        let Some((pattern, spec)) = anchor.split_once('=') else {
            return Err(format!("anchor \"{}\" is not pattern=spec", anchor));
        };
        cfg.anchors.push(AnchorConfig {
            pattern: pattern.to_string(),
            spec: spec.to_string(),
        });
    }
    Ok(())
}
