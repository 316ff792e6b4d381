// Entry point for the agora messaging server
use agora::server::{config::ServerConfig, connection::Server, database::Database, users};
use agora::utils::performance;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();

    let database = Arc::new(Database::connect(&config.database_url).await?);

    info!("[SERVER] Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("[SERVER] Database migrations completed");

    // Performance logger in background
    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/agora_performance.log".to_string());
    let perf_db = database.clone();
    tokio::spawn(async move {
        performance::start_performance_logger(perf_db, &perf_log_path).await;
    });

    // Presence sweeper: clients ping on every list poll, so anyone silent
    // for a full TTL is gone, not just idle.
    let sweep_db = database.clone();
    let ttl = config.presence_ttl_ms;
    tokio::spawn(async move {
        let period = Duration::from_millis((ttl / 2).max(1000) as u64);
        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = users::sweep_stale_presence(sweep_db.clone(), ttl).await {
                warn!("[SERVER] Presence sweep failed: {}", e);
            }
        }
    });

    let addr = format!("{}:{}", config.host, config.port);
    let server = Server {
        db: database,
        config,
    };
    server.run(&addr).await?;
    Ok(())
}
