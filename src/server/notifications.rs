use crate::common::error::ChatResult;
use crate::common::models::NotificationRecord;
use crate::server::database::Database;
use chrono::Utc;
use log::debug;
use sqlx::Row;
use std::sync::Arc;

/// Anti-spam window: an unread notification with the same (recipient, kind,
/// link) younger than this suppresses a new insert. The same policy covers
/// likes/follows/comments elsewhere in the platform.
pub const DEDUP_WINDOW_MS: i64 = 60_000;

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> NotificationRecord {
    NotificationRecord {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        kind: row.get("kind"),
        link: row.get("link"),
        is_read: row.get::<i64, _>("is_read") != 0,
        created_at: row.get("created_at"),
    }
}

/// Insert a notification unless a very recent unread one with the same kind
/// and link already exists. Returns whether a row was written.
pub async fn notify(
    db: Arc<Database>,
    recipient_id: &str,
    kind: &str,
    link: &str,
) -> ChatResult<bool> {
    let now = Utc::now().timestamp_millis();
    let duplicate = sqlx::query(
        "SELECT 1 FROM notifications WHERE recipient_id = ? AND kind = ? AND link = ? AND is_read = 0 AND created_at > ? LIMIT 1",
    )
    .bind(recipient_id)
    .bind(kind)
    .bind(link)
    .bind(now - DEDUP_WINDOW_MS)
    .fetch_optional(&db.pool)
    .await?;

    if duplicate.is_some() {
        debug!(
            "[NOTIFY] Suppressed duplicate {} notification for {} -> {}",
            kind, recipient_id, link
        );
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO notifications (recipient_id, kind, link, is_read, created_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(recipient_id)
    .bind(kind)
    .bind(link)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(true)
}

/// Fan-out hook for a message send: the link is the conversation id, so the
/// recipient's UI can deep-link straight into the chat.
pub async fn notify_message(
    db: Arc<Database>,
    recipient_id: &str,
    conversation_id: &str,
) -> ChatResult<bool> {
    notify(db, recipient_id, "message", conversation_id).await
}

pub async fn list_unread(db: Arc<Database>, recipient_id: &str) -> ChatResult<Vec<NotificationRecord>> {
    let rows = sqlx::query(
        "SELECT id, recipient_id, kind, link, is_read, created_at FROM notifications WHERE recipient_id = ? AND is_read = 0 ORDER BY created_at DESC",
    )
    .bind(recipient_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(row_to_record).collect())
}

/// Mark everything read for a recipient; returns rows affected.
pub async fn mark_all_read(db: Arc<Database>, recipient_id: &str) -> ChatResult<u64> {
    let res = sqlx::query("UPDATE notifications SET is_read = 1 WHERE recipient_id = ? AND is_read = 0")
        .bind(recipient_id)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
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
    async fn duplicate_within_window_is_suppressed() {
        let db = setup().await;
        assert!(notify_message(db.clone(), "bob", "c1").await.unwrap());
        assert!(!notify_message(db.clone(), "bob", "c1").await.unwrap());
        assert_eq!(list_unread(db, "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_link_or_recipient_is_not_a_duplicate() {
        let db = setup().await;
        assert!(notify_message(db.clone(), "bob", "c1").await.unwrap());
        assert!(notify_message(db.clone(), "bob", "c2").await.unwrap());
        assert!(notify_message(db.clone(), "carol", "c1").await.unwrap());
        assert_eq!(list_unread(db, "bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_notifications_no_longer_dedup() {
        let db = setup().await;
        assert!(notify_message(db.clone(), "bob", "c1").await.unwrap());
        assert_eq!(mark_all_read(db.clone(), "bob").await.unwrap(), 1);
        // The earlier one is read, so a fresh event notifies again.
        assert!(notify_message(db.clone(), "bob", "c1").await.unwrap());
        assert_eq!(list_unread(db, "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_unread_notification_no_longer_dedups() {
        let db = setup().await;
        assert!(notify_message(db.clone(), "bob", "c1").await.unwrap());
        sqlx::query("UPDATE notifications SET created_at = created_at - ?")
            .bind(DEDUP_WINDOW_MS + 1)
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(notify_message(db, "bob", "c1").await.unwrap());
    }
}
