#![forbid(unsafe_code)]

//! `bibot-mcp`: MCP router server binary.
//!
//! In `http` mode (default) it loads configuration, registers the built-in
//! tools, starts sidecar supervision, and serves the HTTP surface. In
//! `stdio` mode it serves the built-in tools as a sidecar over
//! stdin/stdout, logging to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use bibot_mcp::builtin::{builtin_server, BUILTIN_SERVER};
use bibot_mcp::http::serve_http;
use bibot_mcp::router::{RegisterOptions, Router};
use bibot_mcp::server::stdio::serve_stdio;
use bibot_mcp::sidecar::SidecarManager;
use bibot_mcp::transport::{InProcessTransport, Transport};
use bibot_mcp::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum ServeMode {
    /// Router with HTTP surface and sidecar supervision.
    Http,
    /// Built-in tools over stdin/stdout, for use as a sidecar.
    Stdio,
}

#[derive(Debug, Parser)]
#[command(name = "bibot-mcp", about = "MCP tool router", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// How to serve.
    #[arg(long, value_enum, default_value_t = ServeMode::Http)]
    transport: ServeMode,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format, args.transport)?;
    info!(transport = ?args.transport, "bibot-mcp bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(sidecars = config.sidecars.len(), "configuration loaded");

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    match args.transport {
        ServeMode::Stdio => run_stdio(ct).await,
        ServeMode::Http => run_http(&config, ct).await,
    }
}

async fn run_stdio(ct: CancellationToken) -> Result<()> {
    let server = Arc::new(builtin_server());
    serve_stdio(server, tokio::io::stdin(), tokio::io::stdout(), ct).await?;
    info!("stdio sidecar shut down");
    Ok(())
}

async fn run_http(config: &GlobalConfig, ct: CancellationToken) -> Result<()> {
    let router = Arc::new(Router::from_config(config));

    // ── Built-in tools ──────────────────────────────────
    let builtin: Transport = InProcessTransport::new(Arc::new(builtin_server())).into();
    router
        .register_server(BUILTIN_SERVER, Arc::new(builtin), RegisterOptions::default())
        .await
        .map_err(|err| AppError::Config(format!("failed to register built-in tools: {err}")))?;

    // ── Sidecars ────────────────────────────────────────
    let sidecars = SidecarManager::start(Arc::clone(&router), &config.sidecars);

    // ── HTTP surface ────────────────────────────────────
    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    let served = serve_http(Arc::clone(&router), listener, ct.clone()).await;
    if let Err(err) = &served {
        error!(%err, "http surface failed");
    }

    // ── Shutdown ────────────────────────────────────────
    sidecars.shutdown().await;
    router.close().await;
    info!("bibot-mcp shut down");
    served
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, mode: ServeMode) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries frames in stdio mode.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(mode == ServeMode::Http);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
