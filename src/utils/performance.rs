use crate::server::database::Database;
use chrono::Utc;
use log::{error, info, warn};
use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time;

const LOG_PERIOD: Duration = Duration::from_secs(120);

async fn count(db: &Database, query: &str) -> i64 {
    match sqlx::query_scalar::<_, i64>(query).fetch_one(&db.pool).await {
        Ok(n) => n,
        Err(e) => {
            warn!("Performance counter query failed: {}", e);
            -1
        }
    }
}

/// Append a platform health sample (online users, conversations, messages,
/// CPU) to `log_path` every couple of minutes.
pub async fn start_performance_logger(db: Arc<Database>, log_path: &str) {
    let mut system = System::new_all();

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if writeln!(file, "# Agora Server Performance Log").is_err()
            || writeln!(file, "# Timestamp, Online_Users, Conversations, Total_Messages, CPU_Usage").is_err()
        {
            error!("Failed to write header to performance log");
            return;
        }
        info!("Performance log initialized: {}", log_path);
    }

    loop {
        system.refresh_all();
        let cpu_usage =
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len() as f32;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        let online_users = count(&db, "SELECT COUNT(*) FROM users WHERE is_online = 1").await;
        let conversations = count(&db, "SELECT COUNT(*) FROM conversations").await;
        let total_messages = count(&db, "SELECT COUNT(*) FROM messages").await;

        info!(
            "Performance - Online Users: {}, Conversations: {}, Messages: {}, CPU: {:.1}%",
            online_users, conversations, total_messages, cpu_usage
        );

        if let Err(e) = writeln!(
            file,
            "{}, {}, {}, {}, {:.1}%",
            timestamp, online_users, conversations, total_messages, cpu_usage
        ) {
            error!("Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("Failed to flush performance log: {}", e);
        }

        time::sleep(LOG_PERIOD).await;
    }
}
