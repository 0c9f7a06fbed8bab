//! Translation job server binary
//!
//! Run with: cargo run -p translation-jobs --bin translation-jobs-server

use translation_jobs::{config::JobsConfig, server::JobServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "translation_jobs=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = JobsConfig::load()?;

    tracing::info!("Configuration loaded");
    tracing::info!(
        "  - Chunking: target {} lines (min {}, max {})",
        config.chunking.target_lines,
        config.chunking.min_lines,
        config.chunking.max_lines
    );
    tracing::info!(
        "  - Concurrency: {} per job, {} chunks per tick, {}ms budget",
        config.scheduler.max_concurrent,
        config.scheduler.max_chunks_per_tick,
        config.scheduler.tick_budget_ms
    );
    tracing::info!(
        "  - Retries: {} (backoff {}ms..{}ms), stale after {}s",
        config.retry.max_retries,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.reconcile.stale_after_secs
    );
    tracing::info!("  - Worker: {}", config.worker.endpoint);
    if config.alignment.enabled {
        tracing::info!(
            "  - Alignment: {} ({} concurrent)",
            config.alignment.endpoint,
            config.alignment.max_concurrent
        );
    }

    // Create and start server
    let server = JobServer::new(config)?;

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
