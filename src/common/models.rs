use serde::{Deserialize, Serialize};

/// Public identity of a user, including the presence fields the
/// conversation list renders next to the partner's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    /// Unix milliseconds of the last presence ping.
    pub last_seen: i64,
}

/// A persisted message. Immutable once created except for `is_seen`,
/// which only ever transitions false -> true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Server-assigned unix milliseconds; ordering within a conversation
    /// is (created_at, id).
    pub created_at: i64,
    pub is_seen: bool,
}

/// One row of the conversation list: derived per poll, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub conversation_id: String,
    pub partner: UserProfile,
    pub last_message: Option<MessageRecord>,
    /// Messages from the partner the viewer has not seen yet.
    pub unread_count: i64,
    pub partner_typing: bool,
    pub created_at: i64,
}

impl ConversationEntry {
    /// Recency key for the list ordering: latest message wins, empty
    /// conversations fall back to their creation time.
    pub fn recency(&self) -> i64 {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient_id: String,
    pub kind: String,
    /// What the notification points at, e.g. a conversation id.
    pub link: String,
    pub is_read: bool,
    pub created_at: i64,
}
