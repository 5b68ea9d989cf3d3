use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use judge_dispatch::config::ServerConfig;
use judge_dispatch::notify::RedisNotifier;
use judge_dispatch::queue::RedisTaskQueue;
use judge_dispatch::record::RedisRecordStore;
use judge_dispatch::report::CaseSummarizer;
use judge_dispatch::server::{self, ServerState};
use judge_dispatch::storage::StorageClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_dispatch=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;

    info!("Starting judge dispatch server...");

    let client = redis::Client::open(config.redis_url.clone())
        .context("Failed to create Redis client")?;
    let record_conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    let notify_conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis at {}", config.redis_url);

    let storage = StorageClient::from_env().await?;

    let state = Arc::new(ServerState::new(
        config.clone(),
        Arc::new(RedisTaskQueue::new(client)),
        Arc::new(RedisRecordStore::new(record_conn)),
        Arc::new(RedisNotifier::new(notify_conn)),
        Arc::new(CaseSummarizer),
        Arc::new(storage),
    ));

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening for worker connections on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
