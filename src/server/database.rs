use log::{debug, info};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to {}", database_url);

        // Strip the sqlite scheme and any query parameters to get the file
        // path, so the parent directory can be created before SQLite opens it.
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    debug!("[DB] Creating data directory {:?}", parent);
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        info!("[DB] Connection pool ready");
        Ok(Self { pool })
    }

    /// In-memory database for tests and scenario runs. A single pooled
    /// connection keeps every caller on the same `:memory:` instance.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users (identity + presence)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                avatar_url TEXT,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Conversations: one row per unordered participant pair; the pair is
        // stored in canonical order so the unique constraint holds for both
        // lookup directions.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_min TEXT NOT NULL,
                user_max TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (user_min, user_max)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Messages: append-only; is_seen only ever goes 0 -> 1.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                is_seen INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Typing signals: overwritten on every debounce tick, read through a
        // freshness window, meaningless once stale.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS typing_signals (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                last_typed_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Notifications (fan-out target for message sends)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                link TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
