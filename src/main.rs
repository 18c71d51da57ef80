//! warden daemon entry point: load configuration, bind the UDP port, serve
//! until interrupted. Exits 0 on clean shutdown, 1 on configuration or
//! bind failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use warden::config::Config;
use warden::handler::HandlerContext;
use warden::listener;
use warden::store::{SessionStore, SqliteUserStore};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("warden.toml"));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    let workers = config.auth.workers.max(1);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(err = format!("{err:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let users = SqliteUserStore::open(&config.database.uri)?;
    let sessions = Arc::new(SessionStore::new(config.session_ttl()));
    let ctx = Arc::new(HandlerContext {
        users: Arc::new(users),
        sessions: sessions.clone(),
    });

    let addr = ("0.0.0.0", config.auth.port);
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind udp port {}", config.auth.port))?;
    tracing::info!(
        port = config.auth.port,
        workers = config.auth.workers,
        ttl_seconds = config.auth.session_ttl_seconds,
        "listening"
    );

    let sweeper = tokio::spawn(listener::sweep_expired(sessions));

    let result = tokio::select! {
        result = listener::run(socket, ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };
    sweeper.abort();
    result
}
