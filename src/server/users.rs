use crate::common::error::{ChatError, ChatResult};
use crate::common::models::UserProfile;
use crate::server::database::Database;
use chrono::Utc;
use log::{debug, info};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        username: row.get("username"),
        avatar_url: row.get("avatar_url"),
        is_online: row.get::<i64, _>("is_online") != 0,
        last_seen: row.get("last_seen"),
    }
}

pub async fn register(
    db: Arc<Database>,
    username: &str,
    avatar_url: Option<&str>,
) -> ChatResult<UserProfile> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ChatError::Validation("username must not be empty".into()));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    let res = sqlx::query(
        "INSERT INTO users (id, username, avatar_url, is_online, last_seen, created_at) VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(avatar_url)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await;

    match res {
        Ok(_) => {
            info!("[USERS] Registered {} as {}", username, id);
            get_profile(db, &id).await
        }
        Err(e) => {
            if e.as_database_error().map(|d| d.is_unique_violation()) == Some(true) {
                Err(ChatError::Validation(format!(
                    "username {} is already taken",
                    username
                )))
            } else {
                Err(e.into())
            }
        }
    }
}

pub async fn get_profile(db: Arc<Database>, user_id: &str) -> ChatResult<UserProfile> {
    let row = sqlx::query(
        "SELECT id, username, avatar_url, is_online, last_seen FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(&db.pool)
    .await?;
    match row {
        Some(row) => Ok(row_to_profile(&row)),
        None => Err(ChatError::NotFound(format!("unknown user {}", user_id))),
    }
}

pub async fn exists(db: &Database, user_id: &str) -> ChatResult<bool> {
    let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.is_some())
}

pub async fn list_all(db: Arc<Database>, exclude_user_id: &str) -> ChatResult<Vec<UserProfile>> {
    let rows = sqlx::query(
        "SELECT id, username, avatar_url, is_online, last_seen FROM users WHERE id != ? ORDER BY username ASC",
    )
    .bind(exclude_user_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(row_to_profile).collect())
}

pub async fn list_online(db: Arc<Database>, exclude_user_id: &str) -> ChatResult<Vec<UserProfile>> {
    let rows = sqlx::query(
        "SELECT id, username, avatar_url, is_online, last_seen FROM users WHERE is_online = 1 AND id != ? ORDER BY username ASC",
    )
    .bind(exclude_user_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(row_to_profile).collect())
}

/// Presence ping: refresh last_seen and flip the online flag. Issued by
/// clients on every conversation-list poll tick.
pub async fn ping_presence(db: Arc<Database>, user_id: &str) -> ChatResult<()> {
    let now = Utc::now().timestamp_millis();
    let res = sqlx::query("UPDATE users SET is_online = 1, last_seen = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(format!("unknown user {}", user_id)));
    }
    Ok(())
}

pub async fn set_offline(db: Arc<Database>, user_id: &str) -> ChatResult<()> {
    sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    debug!("[USERS] {} marked offline", user_id);
    Ok(())
}

/// Mark users offline when their last ping is older than the TTL. Run
/// periodically by the server; returns how many flags were cleared.
pub async fn sweep_stale_presence(db: Arc<Database>, ttl_ms: i64) -> ChatResult<u64> {
    let cutoff = Utc::now().timestamp_millis() - ttl_ms;
    let res = sqlx::query("UPDATE users SET is_online = 0 WHERE is_online = 1 AND last_seen < ?")
        .bind(cutoff)
        .execute(&db.pool)
        .await?;
    let swept = res.rows_affected();
    if swept > 0 {
        debug!("[USERS] Presence sweep marked {} users offline", swept);
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Arc<Database> {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn register_and_fetch_profile() {
        let db = setup().await;
        let alice = register(db.clone(), "alice", Some("avatars/alice.png"))
            .await
            .unwrap();
        assert_eq!(alice.username, "alice");
        assert!(alice.is_online);

        let fetched = get_profile(db, &alice.id).await.unwrap();
        assert_eq!(fetched.id, alice.id);
        assert_eq!(fetched.avatar_url.as_deref(), Some("avatars/alice.png"));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let db = setup().await;
        register(db.clone(), "alice", None).await.unwrap();
        let err = register(db, "alice", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let db = setup().await;
        let err = get_profile(db, "nope").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_excludes_self() {
        let db = setup().await;
        let alice = register(db.clone(), "alice", None).await.unwrap();
        let bob = register(db.clone(), "bob", None).await.unwrap();

        let seen_by_alice = list_all(db.clone(), &alice.id).await.unwrap();
        assert_eq!(seen_by_alice.len(), 1);
        assert_eq!(seen_by_alice[0].id, bob.id);

        let online = list_online(db, &bob.id).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, alice.id);
    }

    #[tokio::test]
    async fn presence_sweep_clears_stale_flags() {
        let db = setup().await;
        let alice = register(db.clone(), "alice", None).await.unwrap();

        // Backdate the last ping past the TTL, then sweep.
        sqlx::query("UPDATE users SET last_seen = last_seen - 60000 WHERE id = ?")
            .bind(&alice.id)
            .execute(&db.pool)
            .await
            .unwrap();
        let swept = sweep_stale_presence(db.clone(), 30_000).await.unwrap();
        assert_eq!(swept, 1);
        assert!(!get_profile(db.clone(), &alice.id).await.unwrap().is_online);

        // A fresh ping brings the user back online.
        ping_presence(db.clone(), &alice.id).await.unwrap();
        assert!(get_profile(db, &alice.id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn ping_for_unknown_user_fails() {
        let db = setup().await;
        let err = ping_presence(db, "ghost").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
