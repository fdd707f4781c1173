//! appliance-lived binary entry point.
//!
//! Serves the dashboard's live event stream and browser terminal sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use appliance_live::config::TerminalBackend;
use appliance_live::{build_router, AppState, JwtValidator, LiveConfig, ShutdownCoordinator};

/// Live event hub and terminal bridge for the appliance dashboard.
#[derive(Parser, Debug)]
#[command(name = "appliance-lived")]
#[command(about = "Live event push and terminal sessions for the appliance dashboard")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long, env = "LIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind
    #[arg(long, env = "LIVE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "LIVE_PORT")]
    port: Option<u16>,

    /// HS256 secret used to verify identity tokens
    #[arg(long, env = "LIVE_JWT_SECRET")]
    jwt_secret: String,

    /// JSON file of terminal host entries keyed by host ref
    #[arg(long, env = "LIVE_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Terminal process backend
    #[arg(long, env = "LIVE_TERMINAL_BACKEND", value_enum)]
    backend: Option<TerminalBackend>,

    /// Per-connection push buffer (frames)
    #[arg(long, env = "LIVE_BUFFER_CAPACITY")]
    buffer_capacity: Option<usize>,

    /// Keepalive interval in seconds
    #[arg(long, env = "LIVE_KEEPALIVE_SECS")]
    keepalive_secs: Option<u64>,

    /// Terminal idle timeout in seconds, 0 disables it
    #[arg(long, env = "LIVE_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, env = "LIVE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(LiveConfig, String)> {
        let mut config = match &self.config {
            Some(path) => LiveConfig::from_file(path)?,
            None => LiveConfig::default(),
        };
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(hosts_file) = self.hosts_file {
            config.hosts_file = Some(hosts_file);
        }
        if let Some(backend) = self.backend {
            config.terminal.backend = backend;
        }
        if let Some(capacity) = self.buffer_capacity {
            config.hub.buffer_capacity = capacity;
        }
        if let Some(secs) = self.keepalive_secs {
            config.hub.keepalive_interval_secs = secs;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.terminal.idle_timeout_secs = secs;
        }
        Ok((config, self.jwt_secret))
    }
}

fn init_tracing(
    verbose: bool,
    log_dir: Option<&PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };
    let stdout = tracing_subscriber::fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "appliance-lived.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.verbose, args.log_dir.as_ref());

    let (config, jwt_secret) = args.into_config()?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let state = AppState::from_config(&config, Arc::new(JwtValidator::new(&jwt_secret)))?;
    info!(
        %addr,
        backend = ?config.terminal.backend,
        buffer_capacity = config.hub.buffer_capacity,
        "Starting appliance-lived"
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let background = vec![
        state.hub.spawn_bus_pump(&state.bus),
        state.hub.spawn_keepalive(),
    ];

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);

    // Push streams only end once the hub closes them, so close them before
    // axum starts waiting on open connections.
    let signals = coordinator.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });
    let stop = coordinator.token();
    let live = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            info!("Shutting down, closing live connections");
            live.hub.shutdown().await;
            live.sessions.shutdown_all().await;
        })
        .await
        .context("Server error")?;

    coordinator
        .drain(background, Some(Duration::from_secs(5)))
        .await;
    info!("Shutdown complete");
    Ok(())
}
