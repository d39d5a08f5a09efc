//! `voicebridge-engine`: subscribes to the signaling peer's management
//! channel and bridges each call to an AI provider. Grounded on `engine.py`'s
//! `async_run`/`shutdown` for the startup and signal-driven teardown
//! sequence.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use voicebridge_engine::call_log::CallFileLayer;
use voicebridge_engine::{AppConfig, Dispatcher, ManagementChannel};

#[derive(Parser)]
#[command(name = "voicebridge-engine")]
#[command(about = "Bridges SIP calls to a configurable AI voice provider")]
#[command(version)]
struct Cli {
    /// Path to the INI configuration file (falls back to $CONFIG_FILE).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity.
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    loglevel: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _appender_guard = init_logging(cli.loglevel);

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(async_run(cli.config));

    std::process::exit(exit_code);
}

fn init_logging(level: LogLevel) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(CallFileLayer::new("logs"));

    tracing::subscriber::set_global_default(registry).expect("set global tracing subscriber");
    guard
}

async fn async_run(config_path: Option<PathBuf>) -> i32 {
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return 1;
        }
    };

    let event_ip: IpAddr = match config.engine.event_ip.parse() {
        Ok(ip) => ip,
        Err(err) => {
            error!(%err, ip = %config.engine.event_ip, "invalid [engine] event_ip");
            return 1;
        }
    };
    let mi_ip: IpAddr = match config.opensips.ip.parse() {
        Ok(ip) => ip,
        Err(err) => {
            error!(%err, ip = %config.opensips.ip, "invalid [opensips] ip");
            return 1;
        }
    };

    let bind_addr = SocketAddr::new(event_ip, config.engine.event_port);
    let peer_addr = SocketAddr::new(mi_ip, config.opensips.port);

    let mgmt = match ManagementChannel::connect(bind_addr, peer_addr).await {
        Ok(mgmt) => Arc::new(mgmt),
        Err(err) => {
            error!(%err, "failed to bind management channel socket");
            return 1;
        }
    };

    if let Err(err) = mgmt.subscribe("E_UA_SESSION").await {
        error!(%err, "failed to subscribe to E_UA_SESSION events");
        return 1;
    }

    let local_addr = mgmt.local_addr().ok();
    info!(?local_addr, peer = %peer_addr, "management channel ready");

    let dispatcher = match Dispatcher::new(config, mgmt.clone()) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!(%err, "failed to initialize dispatcher");
            return 1;
        }
    };

    let events = mgmt.spawn_event_loop();
    let dispatch_task = tokio::spawn(dispatcher.clone().run(events));

    wait_for_shutdown_signal().await;
    info!("received shutdown signal, closing outstanding calls");

    dispatcher.shutdown().await;
    dispatch_task.abort();

    info!("shutdown complete");
    0
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
