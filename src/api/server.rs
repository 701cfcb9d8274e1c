use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{
    services::{
        cancel_transfer, chat_messages, health, list_transfers, metrics, pause_transfer,
        submit_transfer,
    },
    state::AppState,
};
use crate::chat::MemoryChat;
use crate::config::Config;
use crate::mirror::Mirror;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transfers", post(submit_transfer).get(list_transfers))
        .route("/transfers/{job_id}", delete(cancel_transfer))
        .route("/transfers/{job_id}/pause", post(pause_transfer))
        .route("/chats/{chat_id}/messages", get(chat_messages))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the command layer; `address` overrides `server.bind_addr`
pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Config::load().map_err(|e| format!("Failed to load config: {}", e))?;
    let address = address.unwrap_or(config.server.bind_addr);

    let chat = Arc::new(MemoryChat::new());
    let state = match Mirror::start(&config, chat.clone()).await {
        Ok(mirror) => AppState::new(config, chat, mirror),
        Err(e) => {
            // the subsystem stays disabled for the lifetime of the process
            error!(error = %e, "Transfer pipeline disabled");
            AppState::disabled(config, chat, e.to_string())
        }
    };
    let mirror = state.mirror.clone();

    let listener = TcpListener::bind(address).await?;
    info!(%address, "mirrorbox API listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mirror) = mirror {
        mirror.shutdown().await;
    }
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
