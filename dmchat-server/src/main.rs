//! `dmchat-server`: reference direct-message server.
//!
//! Keeps messages in memory, acknowledges submissions on the delivery
//! channel and serves history pages over HTTP.
//!
//! ```bash
//! cargo run --bin dmchat-server -- --bind 127.0.0.1:8080 --page-size 5
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dmchat_proto::message::ConversationId;
use dmchat_server::config::{ServerCliArgs, ServerConfig};
use dmchat_server::server::{self, ServerState};
use dmchat_server::store::ConversationStore;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::load(&ServerCliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dmchat-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = ConversationStore::with_page_size(config.page_size);
    for seed in &config.conversations {
        store
            .create(&ConversationId::new(seed.id.as_str()), seed.title.as_str())
            .await;
    }
    tracing::info!(
        page_size = config.page_size,
        seeded = config.conversations.len(),
        "conversation store ready"
    );

    let (addr, task) =
        match server::start_server_with_state(&config.bind_addr, Arc::new(ServerState::new(store)))
            .await
        {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(addr = %config.bind_addr, error = %e, "cannot bind");
                return ExitCode::FAILURE;
            }
        };
    tracing::info!(%addr, "dmchat server listening");

    match task.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server task failed");
            ExitCode::FAILURE
        }
    }
}
