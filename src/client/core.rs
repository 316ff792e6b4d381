//! Client-side messaging orchestrator.
//!
//! Owns no durable state: it reconciles what the polling loops fetch from
//! the server with the optimistic local state the UI produced in between,
//! and exposes one coherent view (conversation list, active transcript,
//! typing flags) to the interface layer. One instance per user session,
//! created after login and torn down on logout.

use crate::client::services::chat_service::ChatService;
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::{ConversationEntry, MessageRecord};
use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Local debounce for typing signals: one `true` call per burst of edits,
/// one `false` call after this much silence. The server-side freshness
/// window is twice this, so a single missed tick does not flicker the flag.
pub const TYPING_DEBOUNCE_MS: u64 = 1500;

/// How far apart a server timestamp may be from the local one while still
/// counting as the persisted copy of an optimistic message.
const RECONCILE_WINDOW_MS: i64 = 10_000;

/// A message shown in the transcript before the server confirmed it.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub temp_id: i64,
    pub conversation_id: String,
    pub content: String,
    pub created_at: i64,
    /// Set when the durable append failed; the entry stays visible so the
    /// user can see what was lost instead of a silent drop.
    pub failed: bool,
}

/// Merged transcript row: either a persisted message or an optimistic one.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub id: i64,
    pub sender_id: String,
    pub content: String,
    pub created_at: i64,
    pub is_seen: bool,
    pub pending: bool,
    pub failed: bool,
}

/// The view-consistency state machine. Pure: every transition is a plain
/// method, the polling tasks drive it from outside through a lock.
pub struct SessionState {
    pub user_id: String,
    pub conversations: Vec<ConversationEntry>,
    pub active_conversation: Option<String>,
    pub active_messages: Vec<MessageRecord>,
    pub pending: Vec<PendingMessage>,
    next_temp_id: i64,
    poll_generation: u64,
    typing_generation: u64,
}

impl SessionState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversations: Vec::new(),
            active_conversation: None,
            active_messages: Vec::new(),
            pending: Vec::new(),
            next_temp_id: -1,
            poll_generation: 0,
            typing_generation: 0,
        }
    }

    /// Wholesale replacement from a list poll tick. The optimistic preview
    /// for the active conversation is re-applied afterwards, since the
    /// server cannot know about messages still in flight.
    pub fn replace_conversations(&mut self, entries: Vec<ConversationEntry>) {
        self.conversations = entries;
        self.reapply_preview();
    }

    fn reapply_preview(&mut self) {
        let Some(active) = self.active_conversation.clone() else {
            return;
        };
        let Some(newest) = self
            .pending
            .iter()
            .filter(|p| !p.failed && p.conversation_id == active)
            .last()
        else {
            return;
        };
        if let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|e| e.conversation_id == active)
        {
            let stale = entry
                .last_message
                .as_ref()
                .map(|m| m.created_at <= newest.created_at)
                .unwrap_or(true);
            if stale {
                entry.last_message = Some(MessageRecord {
                    id: newest.temp_id,
                    conversation_id: active.clone(),
                    sender_id: self.user_id.clone(),
                    content: newest.content.clone(),
                    created_at: newest.created_at,
                    is_seen: false,
                });
            }
        }
    }

    /// Switch (or leave) the active conversation. Bumps the poll generation
    /// so any in-flight fetch issued for the previous selection is dropped
    /// instead of merged, and returns the new generation for the next loop.
    pub fn select_conversation(&mut self, conversation_id: Option<String>) -> u64 {
        self.active_conversation = conversation_id;
        self.active_messages.clear();
        self.pending.clear();
        self.poll_generation += 1;
        self.poll_generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.poll_generation == generation
    }

    pub fn has_conversation(&self, conversation_id: &str) -> bool {
        self.conversations
            .iter()
            .any(|e| e.conversation_id == conversation_id)
    }

    /// Merge a fetched message batch, tagged with the conversation it was
    /// issued for. Returns None when the batch is stale (the selection has
    /// moved on), otherwise whether it contains unseen partner messages the
    /// caller should mark seen.
    pub fn apply_active_messages(
        &mut self,
        conversation_id: &str,
        messages: Vec<MessageRecord>,
    ) -> Option<bool> {
        if self.active_conversation.as_deref() != Some(conversation_id) {
            return None;
        }

        // An optimistic entry whose persisted twin showed up is done:
        // matched by sender + content + timestamp proximity, since the
        // temporary id never reaches the server.
        self.pending.retain(|p| {
            p.conversation_id != conversation_id
                || !messages.iter().any(|m| {
                    m.sender_id == self.user_id
                        && m.content == p.content
                        && (m.created_at - p.created_at).abs() <= RECONCILE_WINDOW_MS
                })
        });

        let has_unseen = messages
            .iter()
            .any(|m| m.sender_id != self.user_id && !m.is_seen);
        self.active_messages = messages;
        Some(has_unseen)
    }

    /// Append an optimistic message to the transcript and the preview line
    /// before the network call resolves. Returns the temporary id.
    pub fn push_optimistic(&mut self, content: &str, now_ms: i64) -> Option<i64> {
        let conversation_id = self.active_conversation.clone()?;
        let temp_id = self.next_temp_id;
        self.next_temp_id -= 1;
        self.pending.push(PendingMessage {
            temp_id,
            conversation_id,
            content: content.to_string(),
            created_at: now_ms,
            failed: false,
        });
        self.reapply_preview();
        Some(temp_id)
    }

    pub fn mark_send_failed(&mut self, temp_id: i64) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
            p.failed = true;
        }
    }

    /// The transcript the UI renders: server truth first, optimistic tail
    /// after it.
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        let mut rows: Vec<TranscriptMessage> = self
            .active_messages
            .iter()
            .map(|m| TranscriptMessage {
                id: m.id,
                sender_id: m.sender_id.clone(),
                content: m.content.clone(),
                created_at: m.created_at,
                is_seen: m.is_seen,
                pending: false,
                failed: false,
            })
            .collect();
        for p in &self.pending {
            if self.active_conversation.as_deref() == Some(p.conversation_id.as_str()) {
                rows.push(TranscriptMessage {
                    id: p.temp_id,
                    sender_id: self.user_id.clone(),
                    content: p.content.clone(),
                    created_at: p.created_at,
                    is_seen: false,
                    pending: true,
                    failed: p.failed,
                });
            }
        }
        rows
    }

    pub fn unread_total(&self) -> i64 {
        self.conversations.iter().map(|e| e.unread_count).sum()
    }

    pub fn partner_typing(&self) -> bool {
        match &self.active_conversation {
            Some(id) => self
                .conversations
                .iter()
                .find(|e| &e.conversation_id == id)
                .map(|e| e.partner_typing)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Start a new typing burst; older debounce timers become stale.
    pub fn bump_typing(&mut self) -> u64 {
        self.typing_generation += 1;
        self.typing_generation
    }

    pub fn typing_is_current(&self, generation: u64) -> bool {
        self.typing_generation == generation
    }

    pub fn poll_generation(&self) -> u64 {
        self.poll_generation
    }
}

/// Session-scoped coordinator: two repeating polls (conversation list and
/// active conversation), both cancel-and-restart, plus the user-initiated
/// operations. All store calls are fire-and-forget from the UI's point of
/// view; failures during polling are logged and retried next tick.
pub struct MessagingCore {
    host: String,
    user_id: String,
    poll_interval: Duration,
    service: Arc<Mutex<ChatService>>,
    state: Arc<Mutex<SessionState>>,
    list_poll: Option<JoinHandle<()>>,
    message_poll: Option<JoinHandle<()>>,
}

impl MessagingCore {
    pub fn new(host: &str, user_id: &str, poll_interval_ms: u64) -> Self {
        Self {
            host: host.to_string(),
            user_id: user_id.to_string(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            service: Arc::new(Mutex::new(ChatService::new())),
            state: Arc::new(Mutex::new(SessionState::new(user_id))),
            list_poll: None,
            message_poll: None,
        }
    }

    /// Shared handle on the underlying line-protocol client, for callers
    /// that need operations outside the orchestrated surface.
    pub fn service(&self) -> Arc<Mutex<ChatService>> {
        self.service.clone()
    }

    /// Mount the session: fetch the initial conversation list, honor an
    /// optional deep-linked conversation id (validated against the list
    /// before trusting it), and start the list poll.
    pub async fn start(&mut self, deep_link: Option<&str>) -> ChatResult<()> {
        if let Err(e) = self.refresh_conversations().await {
            warn!("[CORE] initial conversation fetch failed: {}", e);
        }

        if let Some(link) = deep_link {
            let known = self.state.lock().await.has_conversation(link);
            if known {
                self.open_conversation(link).await?;
            } else {
                warn!(
                    "[CORE] deep link {} does not belong to the current user; ignoring",
                    link
                );
            }
        }

        let service = self.service.clone();
        let state = self.state.clone();
        let host = self.host.clone();
        let user_id = self.user_id.clone();
        let interval = self.poll_interval;
        self.list_poll = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let fetched = {
                    let mut svc = service.lock().await;
                    // Presence piggybacks on the poll cadence.
                    if let Err(e) = svc.ping(&host, &user_id).await {
                        debug!("[CORE] presence ping failed: {}", e);
                    }
                    svc.get_conversations(&host, &user_id).await
                };
                match fetched {
                    Ok(entries) => state.lock().await.replace_conversations(entries),
                    Err(e) => warn!("[CORE] conversation list poll failed: {}", e),
                }
            }
        }));
        Ok(())
    }

    pub async fn refresh_conversations(&self) -> ChatResult<()> {
        let entries = {
            let mut svc = self.service.lock().await;
            svc.get_conversations(&self.host, &self.user_id).await?
        };
        self.state.lock().await.replace_conversations(entries);
        Ok(())
    }

    /// Activate a conversation: cancels the previous scoped poll, fetches
    /// the transcript immediately, then polls it until the selection moves.
    pub async fn open_conversation(&mut self, conversation_id: &str) -> ChatResult<()> {
        {
            let st = self.state.lock().await;
            if !st.has_conversation(conversation_id) {
                return Err(ChatError::Unauthorized(format!(
                    "conversation {} does not belong to the current user",
                    conversation_id
                )));
            }
        }

        if let Some(handle) = self.message_poll.take() {
            handle.abort();
        }
        let generation = self
            .state
            .lock()
            .await
            .select_conversation(Some(conversation_id.to_string()));

        poll_active_tick(
            &self.service,
            &self.state,
            &self.host,
            &self.user_id,
            conversation_id,
            generation,
        )
        .await;

        let service = self.service.clone();
        let state = self.state.clone();
        let host = self.host.clone();
        let user_id = self.user_id.clone();
        let conversation = conversation_id.to_string();
        let interval = self.poll_interval;
        self.message_poll = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if !state.lock().await.is_current(generation) {
                    break;
                }
                poll_active_tick(&service, &state, &host, &user_id, &conversation, generation)
                    .await;
            }
        }));
        Ok(())
    }

    /// Navigate away from the active conversation; its scoped poll stops,
    /// the list poll keeps running.
    pub async fn close_conversation(&mut self) {
        if let Some(handle) = self.message_poll.take() {
            handle.abort();
        }
        self.state.lock().await.select_conversation(None);
    }

    /// Optimistic send: the message appears in the transcript and the
    /// preview line before the append resolves; the follow-up refresh
    /// replaces the temporary entry with the server-assigned one. On
    /// failure the entry stays, flagged failed.
    pub async fn send(&self, content: &str) -> ChatResult<MessageRecord> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("message content must not be empty".into()));
        }

        let now = Utc::now().timestamp_millis();
        let (conversation_id, temp_id, generation) = {
            let mut st = self.state.lock().await;
            let conversation_id = st.active_conversation.clone().ok_or_else(|| {
                ChatError::Validation("no active conversation to send into".into())
            })?;
            let temp_id = match st.push_optimistic(content, now) {
                Some(id) => id,
                None => {
                    return Err(ChatError::Validation(
                        "no active conversation to send into".into(),
                    ))
                }
            };
            (conversation_id, temp_id, st.poll_generation())
        };

        let sent = {
            let mut svc = self.service.lock().await;
            svc.send_message(&self.host, &conversation_id, &self.user_id, content)
                .await
        };

        match sent {
            Ok(record) => {
                poll_active_tick(
                    &self.service,
                    &self.state,
                    &self.host,
                    &self.user_id,
                    &conversation_id,
                    generation,
                )
                .await;
                if let Err(e) = self.refresh_conversations().await {
                    warn!("[CORE] list refresh after send failed: {}", e);
                }
                Ok(record)
            }
            Err(e) => {
                self.state.lock().await.mark_send_failed(temp_id);
                Err(e)
            }
        }
    }

    /// Called on every compose-box change: establishes the typing flag for
    /// this burst (idempotent on the server) and restarts the local silence
    /// timer that will clear it.
    pub async fn compose_changed(&self) {
        let Some(conversation_id) = self.state.lock().await.active_conversation.clone() else {
            return;
        };

        {
            let mut svc = self.service.lock().await;
            if let Err(e) = svc
                .set_typing(&self.host, &conversation_id, &self.user_id, true)
                .await
            {
                debug!("[CORE] typing signal failed: {}", e);
            }
        }

        let generation = self.state.lock().await.bump_typing();
        let service = self.service.clone();
        let state = self.state.clone();
        let host = self.host.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(TYPING_DEBOUNCE_MS)).await;
            if !state.lock().await.typing_is_current(generation) {
                // A newer keystroke restarted the timer.
                return;
            }
            let mut svc = service.lock().await;
            if let Err(e) = svc
                .set_typing(&host, &conversation_id, &user_id, false)
                .await
            {
                debug!("[CORE] typing clear failed: {}", e);
            }
        });
    }

    /// Tear the session down on logout: both polls stop, presence goes
    /// offline best-effort. Nothing here can fail the caller.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.list_poll.take() {
            handle.abort();
        }
        if let Some(handle) = self.message_poll.take() {
            handle.abort();
        }
        self.state.lock().await.select_conversation(None);
        let mut svc = self.service.lock().await;
        if let Err(e) = svc.go_offline(&self.host, &self.user_id).await {
            debug!("[CORE] offline notice failed: {}", e);
        }
        debug!("[CORE] messaging session torn down for {}", self.user_id);
    }

    // Snapshots for the interface layer.

    pub async fn conversations(&self) -> Vec<ConversationEntry> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn transcript(&self) -> Vec<TranscriptMessage> {
        self.state.lock().await.transcript()
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.state.lock().await.active_conversation.clone()
    }

    pub async fn partner_typing(&self) -> bool {
        self.state.lock().await.partner_typing()
    }

    pub async fn unread_total(&self) -> i64 {
        self.state.lock().await.unread_total()
    }
}

/// One scoped poll tick: fetch the transcript the selection points at,
/// drop it if the selection moved while the request was in flight, and
/// clear the unread badge promptly when the batch holds unseen partner
/// messages.
async fn poll_active_tick(
    service: &Arc<Mutex<ChatService>>,
    state: &Arc<Mutex<SessionState>>,
    host: &str,
    user_id: &str,
    conversation_id: &str,
    generation: u64,
) {
    let fetched = {
        let mut svc = service.lock().await;
        svc.get_messages(host, conversation_id, user_id).await
    };
    let messages = match fetched {
        Ok(m) => m,
        Err(e) => {
            warn!("[CORE] message poll failed for {}: {}", conversation_id, e);
            return;
        }
    };

    let needs_mark_seen = {
        let mut st = state.lock().await;
        if !st.is_current(generation) {
            debug!("[CORE] dropping stale poll result for {}", conversation_id);
            return;
        }
        st.apply_active_messages(conversation_id, messages)
    };

    if needs_mark_seen == Some(true) {
        let refreshed = {
            let mut svc = service.lock().await;
            if let Err(e) = svc.mark_seen(host, conversation_id, user_id).await {
                warn!("[CORE] mark_seen failed for {}: {}", conversation_id, e);
            }
            svc.get_conversations(host, user_id).await
        };
        match refreshed {
            Ok(entries) => state.lock().await.replace_conversations(entries),
            Err(e) => warn!("[CORE] list refresh after mark_seen failed: {}", e),
        }
    }
}
