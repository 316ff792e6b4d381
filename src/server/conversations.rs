use crate::common::error::{ChatError, ChatResult};
use crate::common::models::ConversationEntry;
use crate::server::database::Database;
use crate::server::{messages, typing, users};
use chrono::Utc;
use log::info;
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

/// Canonical ordering of an unordered participant pair. All lookups and
/// inserts go through this, so the (user_min, user_max) unique constraint
/// covers both directions.
fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Look up or lazily create the single conversation for a pair of distinct
/// users. Safe under concurrent calls from both participants: the insert is
/// an idempotent upsert, so a race produces one winner and the loser
/// re-reads the winner's id.
pub async fn get_or_create(db: Arc<Database>, user_a: &str, user_b: &str) -> ChatResult<String> {
    if user_a == user_b {
        return Err(ChatError::Validation(
            "cannot start a conversation with yourself".into(),
        ));
    }
    for uid in [user_a, user_b] {
        if !users::exists(&db, uid).await? {
            return Err(ChatError::NotFound(format!("unknown user {}", uid)));
        }
    }

    let (min, max) = canonical_pair(user_a, user_b);

    if let Some(row) = sqlx::query("SELECT id FROM conversations WHERE user_min = ? AND user_max = ?")
        .bind(min)
        .bind(max)
        .fetch_optional(&db.pool)
        .await?
    {
        return Ok(row.get("id"));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    sqlx::query(
        "INSERT OR IGNORE INTO conversations (id, user_min, user_max, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(min)
    .bind(max)
    .bind(now)
    .execute(&db.pool)
    .await?;

    // Re-read after the upsert: either we inserted, or a concurrent caller
    // won the race and this returns their id.
    let row = sqlx::query("SELECT id FROM conversations WHERE user_min = ? AND user_max = ?")
        .bind(min)
        .bind(max)
        .fetch_optional(&db.pool)
        .await?;
    match row {
        Some(row) => {
            let winner: String = row.get("id");
            if winner == id {
                info!("[CONV] Created conversation {} for {} <-> {}", id, min, max);
            }
            Ok(winner)
        }
        None => Err(ChatError::Transient(
            "conversation vanished during creation".into(),
        )),
    }
}

/// The two participants of a conversation, or NotFound.
pub async fn participants(db: &Database, conversation_id: &str) -> ChatResult<(String, String)> {
    let row = sqlx::query("SELECT user_min, user_max FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(&db.pool)
        .await?;
    match row {
        Some(row) => Ok((row.get("user_min"), row.get("user_max"))),
        None => Err(ChatError::NotFound(format!(
            "unknown conversation {}",
            conversation_id
        ))),
    }
}

/// The partner of `viewer_id` in a conversation; Unauthorized when the
/// viewer is not a participant.
pub async fn partner_of(
    db: &Database,
    conversation_id: &str,
    viewer_id: &str,
) -> ChatResult<String> {
    let (min, max) = participants(db, conversation_id).await?;
    if viewer_id == min {
        Ok(max)
    } else if viewer_id == max {
        Ok(min)
    } else {
        Err(ChatError::Unauthorized(format!(
            "user {} is not a participant of conversation {}",
            viewer_id, conversation_id
        )))
    }
}

/// Every conversation the user participates in, enriched with the partner's
/// identity/presence, the latest message, the unread count and the typing
/// flag. Ordered by recency of the latest message, conversations without
/// messages by creation time.
pub async fn list_for_user(db: Arc<Database>, user_id: &str) -> ChatResult<Vec<ConversationEntry>> {
    if !users::exists(&db, user_id).await? {
        return Err(ChatError::NotFound(format!("unknown user {}", user_id)));
    }

    let rows = sqlx::query(
        "SELECT id, user_min, user_max, created_at FROM conversations WHERE user_min = ? OR user_max = ?",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let conversation_id: String = row.get("id");
        let user_min: String = row.get("user_min");
        let user_max: String = row.get("user_max");
        let partner_id = if user_min == user_id { &user_max } else { &user_min };

        let partner = users::get_profile(db.clone(), partner_id).await?;
        let last_message = messages::latest(&db, &conversation_id).await?;
        let unread_count = messages::unread_count(&db, &conversation_id, user_id).await?;
        let partner_typing = typing::is_typing(&db, &conversation_id, partner_id).await?;

        entries.push(ConversationEntry {
            conversation_id,
            partner,
            last_message,
            unread_count,
            partner_typing,
            created_at: row.get("created_at"),
        });
    }

    entries.sort_by(|a, b| b.recency().cmp(&a.recency()));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;

    async fn setup() -> (Arc<Database>, String, String) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db = Arc::new(db);
        let a = users::register(db.clone(), "alice", None).await.unwrap();
        let b = users::register(db.clone(), "bob", None).await.unwrap();
        (db, a.id, b.id)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            max_message_length: 2048,
            presence_ttl_ms: 30_000,
            log_level: "debug".into(),
        }
    }

    #[tokio::test]
    async fn same_conversation_for_both_directions() {
        let (db, a, b) = setup().await;
        let c1 = get_or_create(db.clone(), &a, &b).await.unwrap();
        let c2 = get_or_create(db.clone(), &b, &a).await.unwrap();
        assert_eq!(c1, c2);
    }

    #[tokio::test]
    async fn concurrent_creation_converges_to_one_id() {
        let (db, a, b) = setup().await;
        let (r1, r2) = tokio::join!(
            get_or_create(db.clone(), &a, &b),
            get_or_create(db.clone(), &b, &a)
        );
        assert_eq!(r1.unwrap(), r2.unwrap());
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (db, a, _) = setup().await;
        let err = get_or_create(db, &a, &a).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_participant_is_not_found() {
        let (db, a, _) = setup().await;
        let err = get_or_create(db, &a, "ghost").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn partner_lookup_rejects_outsiders() {
        let (db, a, b) = setup().await;
        let conv = get_or_create(db.clone(), &a, &b).await.unwrap();
        let mallory = users::register(db.clone(), "mallory", None).await.unwrap();

        assert_eq!(partner_of(&db, &conv, &a).await.unwrap(), b);
        let err = partner_of(&db, &conv, &mallory.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn list_is_enriched_and_ordered_by_recency() {
        let (db, a, b) = setup().await;
        let config = test_config();
        let carol = users::register(db.clone(), "carol", None).await.unwrap();

        let conv_ab = get_or_create(db.clone(), &a, &b).await.unwrap();
        let conv_ac = get_or_create(db.clone(), &a, &carol.id).await.unwrap();

        messages::append(db.clone(), &conv_ab, &b, "first", &config)
            .await
            .unwrap();
        // Backdate it so the later message clearly wins the ordering.
        sqlx::query("UPDATE messages SET created_at = created_at - 5000")
            .execute(&db.pool)
            .await
            .unwrap();
        messages::append(db.clone(), &conv_ac, &carol.id, "newer", &config)
            .await
            .unwrap();

        let entries = list_for_user(db.clone(), &a).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].conversation_id, conv_ac);
        assert_eq!(entries[0].partner.username, "carol");
        assert_eq!(entries[0].unread_count, 1);
        assert_eq!(
            entries[0].last_message.as_ref().unwrap().content,
            "newer"
        );
        assert_eq!(entries[1].conversation_id, conv_ab);
        assert_eq!(entries[1].unread_count, 1);
    }

    #[tokio::test]
    async fn empty_conversations_sort_by_creation_time() {
        let (db, a, b) = setup().await;
        let conv = get_or_create(db.clone(), &a, &b).await.unwrap();
        let entries = list_for_user(db, &a).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].conversation_id, conv);
        assert!(entries[0].last_message.is_none());
        assert_eq!(entries[0].unread_count, 0);
    }
}
