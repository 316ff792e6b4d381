use crate::common::error::ChatResult;
use crate::server::conversations;
use crate::server::database::Database;
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;

/// Freshness window for the typing flag. Twice the client-side debounce
/// interval, so one missed debounce tick still keeps the flag alive.
pub const TYPING_WINDOW_MS: i64 = 3000;

/// A typing signal older than the window reads as "not typing".
pub fn is_fresh(last_typed_at: i64, now: i64) -> bool {
    now - last_typed_at < TYPING_WINDOW_MS
}

/// Record (or clear) the keystroke timestamp for (conversation, user).
/// `true` overwrites last_typed_at with now; `false` clears eagerly for a
/// snappier indicator, though staleness alone would also end the window.
pub async fn set_typing(
    db: Arc<Database>,
    conversation_id: &str,
    user_id: &str,
    is_typing: bool,
) -> ChatResult<()> {
    // Participant check doubles as the NotFound check for the conversation.
    conversations::partner_of(&db, conversation_id, user_id).await?;

    if is_typing {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR REPLACE INTO typing_signals (conversation_id, user_id, last_typed_at) VALUES (?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(now)
        .execute(&db.pool)
        .await?;
    } else {
        sqlx::query("DELETE FROM typing_signals WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id)
            .bind(user_id)
            .execute(&db.pool)
            .await?;
    }
    Ok(())
}

/// Liveness read: true while the user's last keystroke is inside the
/// freshness window. No participant check here; the conversation list
/// enrichment calls this for ids it already resolved.
pub async fn is_typing(db: &Database, conversation_id: &str, user_id: &str) -> ChatResult<bool> {
    let row = sqlx::query(
        "SELECT last_typed_at FROM typing_signals WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(&db.pool)
    .await?;
    match row {
        Some(row) => {
            let last: i64 = row.get("last_typed_at");
            Ok(is_fresh(last, Utc::now().timestamp_millis()))
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ChatError;
    use crate::server::users;

    async fn setup() -> (Arc<Database>, String, String, String) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db = Arc::new(db);
        let a = users::register(db.clone(), "alice", None).await.unwrap();
        let b = users::register(db.clone(), "bob", None).await.unwrap();
        let conv = conversations::get_or_create(db.clone(), &a.id, &b.id)
            .await
            .unwrap();
        (db, a.id, b.id, conv)
    }

    #[test]
    fn freshness_window_bounds() {
        assert!(is_fresh(1_000, 1_000));
        assert!(is_fresh(1_000, 1_000 + TYPING_WINDOW_MS - 1));
        assert!(!is_fresh(1_000, 1_000 + TYPING_WINDOW_MS));
        assert!(!is_fresh(1_000, 1_000 + TYPING_WINDOW_MS + 500));
    }

    #[tokio::test]
    async fn signal_reads_true_while_fresh() {
        let (db, a, b, conv) = setup().await;
        set_typing(db.clone(), &conv, &a, true).await.unwrap();

        assert!(is_typing(&db, &conv, &a).await.unwrap());
        // The partner has not typed anything.
        assert!(!is_typing(&db, &conv, &b).await.unwrap());
    }

    #[tokio::test]
    async fn eager_clear_drops_the_flag() {
        let (db, a, _b, conv) = setup().await;
        set_typing(db.clone(), &conv, &a, true).await.unwrap();
        set_typing(db.clone(), &conv, &a, false).await.unwrap();
        assert!(!is_typing(&db, &conv, &a).await.unwrap());
    }

    #[tokio::test]
    async fn stale_signal_reads_false() {
        let (db, a, _b, conv) = setup().await;
        set_typing(db.clone(), &conv, &a, true).await.unwrap();

        // Age the signal past the window instead of sleeping through it.
        sqlx::query("UPDATE typing_signals SET last_typed_at = last_typed_at - ?")
            .bind(TYPING_WINDOW_MS + 1)
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(!is_typing(&db, &conv, &a).await.unwrap());
    }

    #[tokio::test]
    async fn non_participants_cannot_signal() {
        let (db, _a, _b, conv) = setup().await;
        let outsider = users::register(db.clone(), "outsider", None).await.unwrap();
        let err = set_typing(db, &conv, &outsider.id, true).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
    }
}
