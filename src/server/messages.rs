use crate::common::error::{ChatError, ChatResult};
use crate::common::models::MessageRecord;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::{conversations, notifications};
use chrono::Utc;
use log::warn;
use sqlx::Row;
use std::sync::Arc;

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> MessageRecord {
    MessageRecord {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        is_seen: row.get::<i64, _>("is_seen") != 0,
    }
}

/// Append a message to a conversation. The message starts unseen; the
/// recipient's notification fan-out is fired afterwards and its failure is
/// never surfaced to the sender.
pub async fn append(
    db: Arc<Database>,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    config: &ServerConfig,
) -> ChatResult<MessageRecord> {
    let recipient = conversations::partner_of(&db, conversation_id, sender_id).await?;

    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::Validation("message content must not be empty".into()));
    }
    if content.len() > config.max_message_length {
        return Err(ChatError::Validation(format!(
            "message too long (max {} chars)",
            config.max_message_length
        )));
    }

    let now = Utc::now().timestamp_millis();
    let res = sqlx::query(
        "INSERT INTO messages (conversation_id, sender_id, content, created_at, is_seen) VALUES (?, ?, ?, ?, 0)",
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .bind(now)
    .execute(&db.pool)
    .await?;
    let id = res.last_insert_rowid();

    if let Err(e) = notifications::notify_message(db.clone(), &recipient, conversation_id).await {
        warn!("[MSG] Notification fan-out failed for {}: {}", recipient, e);
    }

    Ok(MessageRecord {
        id,
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        created_at: now,
        is_seen: false,
    })
}

/// Full ordered history of a conversation, oldest first. The order is
/// stable across calls: (created_at, id), with the rowid breaking
/// same-millisecond ties.
pub async fn list_for(
    db: Arc<Database>,
    conversation_id: &str,
    viewer_id: &str,
) -> ChatResult<Vec<MessageRecord>> {
    conversations::partner_of(&db, conversation_id, viewer_id).await?;

    let rows = sqlx::query(
        "SELECT id, conversation_id, sender_id, content, created_at, is_seen FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(conversation_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(row_to_record).collect())
}

/// Bulk-mark every message sent *to* the viewer as seen. Idempotent: the
/// update only touches rows still unseen, so calling it on every poll tick
/// has no effect beyond the one-directional flag transition.
pub async fn mark_seen(
    db: Arc<Database>,
    conversation_id: &str,
    viewer_id: &str,
) -> ChatResult<u64> {
    conversations::partner_of(&db, conversation_id, viewer_id).await?;

    let res = sqlx::query(
        "UPDATE messages SET is_seen = 1 WHERE conversation_id = ? AND sender_id != ? AND is_seen = 0",
    )
    .bind(conversation_id)
    .bind(viewer_id)
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected())
}

/// Most recent message of a conversation, if any.
pub async fn latest(db: &Database, conversation_id: &str) -> ChatResult<Option<MessageRecord>> {
    let row = sqlx::query(
        "SELECT id, conversation_id, sender_id, content, created_at, is_seen FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.as_ref().map(row_to_record))
}

/// Messages from the partner the viewer has not seen yet.
pub async fn unread_count(
    db: &Database,
    conversation_id: &str,
    viewer_id: &str,
) -> ChatResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND sender_id != ? AND is_seen = 0",
    )
    .bind(conversation_id)
    .bind(viewer_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::users;

    async fn setup() -> (Arc<Database>, ServerConfig, String, String, String) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db = Arc::new(db);
        let a = users::register(db.clone(), "alice", None).await.unwrap();
        let b = users::register(db.clone(), "bob", None).await.unwrap();
        let conv = conversations::get_or_create(db.clone(), &a.id, &b.id)
            .await
            .unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            max_message_length: 64,
            presence_ttl_ms: 30_000,
            log_level: "debug".into(),
        };
        (db, config, a.id, b.id, conv)
    }

    #[tokio::test]
    async fn append_starts_unseen_and_lists_in_order(){
        let (db, config, a, b, conv) = setup().await;

        let first = append(db.clone(), &conv, &a, "Bonjour", &config).await.unwrap();
        assert!(!first.is_seen);
        append(db.clone(), &conv, &b, "Salut", &config).await.unwrap();
        append(db.clone(), &conv, &a, "Ça va ?", &config).await.unwrap();

        let listed = list_for(db.clone(), &conv, &a).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].content, "Bonjour");
        assert_eq!(listed[0].sender_id, a);
        assert!(listed
            .windows(2)
            .all(|w| (w[0].created_at, w[0].id) <= (w[1].created_at, w[1].id)));

        // Stable across repeated reads with no new writes.
        let again = list_for(db, &conv, &b).await.unwrap();
        let ids: Vec<i64> = listed.iter().map(|m| m.id).collect();
        let ids_again: Vec<i64> = again.iter().map(|m| m.id).collect();
        assert_eq!(ids, ids_again);
    }

    #[tokio::test]
    async fn append_validates_content_and_sender() {
        let (db, config, a, _b, conv) = setup().await;

        let err = append(db.clone(), &conv, &a, "   ", &config).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let long = "x".repeat(65);
        let err = append(db.clone(), &conv, &a, &long, &config).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let mallory = users::register(db.clone(), "mallory", None).await.unwrap();
        let err = append(db.clone(), &conv, &mallory.id, "hi", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));

        let err = append(db, "no-such-conv", &a, "hi", &config).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn mark_seen_only_touches_partner_messages() {
        let (db, config, a, b, conv) = setup().await;

        append(db.clone(), &conv, &a, "one", &config).await.unwrap();
        append(db.clone(), &conv, &a, "two", &config).await.unwrap();
        append(db.clone(), &conv, &b, "reply", &config).await.unwrap();

        assert_eq!(unread_count(&db, &conv, &b).await.unwrap(), 2);

        let updated = mark_seen(db.clone(), &conv, &b).await.unwrap();
        assert_eq!(updated, 2);

        let listed = list_for(db.clone(), &conv, &b).await.unwrap();
        for m in &listed {
            if m.sender_id == a {
                assert!(m.is_seen);
            } else {
                // B's own message stays untouched until A views it.
                assert!(!m.is_seen);
            }
        }
        assert_eq!(unread_count(&db, &conv, &b).await.unwrap(), 0);

        // Idempotent: a second pass is a no-op.
        assert_eq!(mark_seen(db, &conv, &b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_access_requires_participation() {
        let (db, _config, _a, _b, conv) = setup().await;
        let outsider = users::register(db.clone(), "outsider", None).await.unwrap();

        let err = list_for(db.clone(), &conv, &outsider.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        let err = mark_seen(db, &conv, &outsider.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn send_fans_out_a_notification_for_the_recipient() {
        let (db, config, a, b, conv) = setup().await;
        append(db.clone(), &conv, &a, "ping", &config).await.unwrap();

        let pending = notifications::list_unread(db, &b).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, "message");
        assert_eq!(pending[0].link, conv);
    }
}
