use std::panic;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lesson_runner::{
    config::Config,
    constants::PENDING_CONNECTIONS,
    pipeline::{SessionRegistry, accepting::accept_connections, session::handle_sessions, shutdown_sessions},
    provider::Backends,
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let config = Config::parse();
    tracing::debug!("Configuration: {:?}", config);
    let default_timeout = config.default_timeout();
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let provider = Arc::new(Backends::from_config(config.clone())?);

    let sessions = SessionRegistry::default();
    let (session_tx, session_rx) = mpsc::channel(PENDING_CONNECTIONS);
    let accepting = accept_connections(listener, session_tx);
    handle_sessions(session_rx, provider, default_timeout, sessions.clone());

    tracing::info!("Lesson runner listening on {}", config.listen_addr);
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down {} session(s)", sessions.len());
    accepting.abort();
    shutdown_sessions(&sessions);
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("{} session(s) did not close in time", sessions.len());
    }

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
