//! # parley-server
//!
//! Real-time backend for two-party chat.
//!
//! This binary provides:
//! - **REST API** (axum) for contacts, conversation history, sending and
//!   marking messages
//! - **Live connections** over WebSocket that push presence snapshots and
//!   new messages to each online user
//! - **Presence registry** tracking which users are online right now
//! - **Unseen counters** for messages that arrived while a user was away

mod api;
mod auth;
mod config;
mod error;
mod gateway;
mod presence;
mod router;
mod store;
mod unseen;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::auth::{SharedAuthenticator, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::store::MessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.token_issuer_pubkey == [0u8; 32] {
        tracing::warn!("TOKEN_ISSUER_PUBKEY not set; every credential will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = MessageStore::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Message store ready");

    let auth: SharedAuthenticator = Arc::new(TokenAuthenticator::new(
        config.token_issuer_pubkey,
        store.clone(),
    ));
    let state = AppState::new(&config, store, auth);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // Live connections are upgraded HTTP requests, so graceful shutdown
    // waits on them; closing them all lets the server drain.
    let presence = state.presence.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        let closed = presence.close_all().await;
        info!(closed, "Received Ctrl+C, closing live connections");
    };

    if let Err(e) = api::serve(state, config.http_addr, shutdown).await {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    info!("Server stopped");
    Ok(())
}
