//! bb-authd - per-user authentication broker daemon.
//!
//! Binds the broker socket, runs the engine loop, and wires the
//! helper-backed polkit policy sessions. The daemon is strictly
//! single-threaded: all engine state lives on one task inside a
//! current-thread runtime, so the runtime is constructed manually rather
//! than through the multi-threaded `#[tokio::main]` default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bb_auth_core::paths;
use bb_auth_daemon::helper::HelperSessionFactory;
use bb_auth_daemon::{Agent, AgentHandle, IpcServer};

/// bb-auth - unified authentication broker
#[derive(Parser, Debug)]
#[command(name = "bb-authd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Override the broker socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let socket_path = args.socket.unwrap_or_else(paths::socket_path);
    info!("starting bb-auth daemon on {}", socket_path.display());

    let server = IpcServer::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    let (handle, rx) = AgentHandle::channel();
    let agent = Agent::new(
        handle.clone(),
        socket_path.clone(),
        Box::new(HelperSessionFactory),
    );

    let agent_task = tokio::spawn(agent.run(rx));
    let server_task = tokio::spawn(server.run(handle));

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    server_task.abort();
    agent_task.abort();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}
