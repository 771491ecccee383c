//! Store contract: the relational backend with realtime push that the core
//! is written against. Production deployments point this at a remote
//! service; [`crate::storage::SqliteStore`] is the embedded implementation.

use crate::error::Result;
use crate::models::{CallSignal, CallStatus, Conversation, Message, SignalData, UserProfile};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Push event delivered to subscribers whenever a row changes. Events are
/// broadcast unfiltered; consumers scope them by table and column values.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    SignalInserted(CallSignal),
    SignalUpdated(CallSignal),
    MessageInserted(Message),
    MessageUpdated(Message),
    ParticipantChanged { conversation_id: String },
}

/// Mailbox table for call attempts.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Inserts a new signal row. Fails if the participants are not two
    /// distinct, known users.
    async fn insert_signal(&self, signal: CallSignal) -> Result<()>;

    async fn get_signal(&self, id: &str) -> Result<CallSignal>;

    /// Replaces the whole `signal_data` document. Refused once the signal
    /// has reached a terminal status.
    async fn update_signal_data(&self, id: &str, data: SignalData) -> Result<()>;

    /// Monotonic status transition. `started_at`/`ended_at` are set only
    /// when given and only if not already set. Refused on terminal rows.
    async fn update_signal_status(
        &self,
        id: &str,
        status: CallStatus,
        started_at: Option<i64>,
        ended_at: Option<i64>,
    ) -> Result<CallSignal>;

    fn subscribe_signals(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Conversations, participants and messages, plus the server-side operations
/// that need transactional guarantees (idempotent direct-conversation
/// creation, bulk read-marking).
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn upsert_user(&self, profile: UserProfile) -> Result<()>;

    async fn get_user(&self, user_id: &str) -> Result<UserProfile>;

    /// Conversations the user participates in, pinned first, then most
    /// recently updated, with rosters, last message and viewer unread count.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// Idempotent: the same conversation id comes back regardless of
    /// argument order or how many times it is called.
    async fn get_or_create_direct(&self, user_id: &str, other_user_id: &str) -> Result<String>;

    /// The creator becomes owner; every listed member joins as member.
    async fn create_group(&self, creator_id: &str, name: &str, member_ids: &[String]) -> Result<String>;

    async fn set_pinned(&self, conversation_id: &str, user_id: &str, pinned: bool) -> Result<()>;

    async fn set_muted(&self, conversation_id: &str, user_id: &str, muted: bool) -> Result<()>;

    /// Stores a draft message. The store assigns the id and timestamp,
    /// guarantees `read_by` contains the sender, bumps the conversation and
    /// unread counters, and returns the confirmed row.
    async fn insert_message(&self, draft: Message) -> Result<Message>;

    /// Newest first; callers reverse for display.
    async fn fetch_messages(&self, conversation_id: &str, limit: i64, offset: i64) -> Result<Vec<Message>>;

    /// Only the original sender may edit; enforced here, not in the UI.
    async fn edit_message(&self, actor_id: &str, message_id: &str, content: &str) -> Result<Message>;

    /// Sender-only soft delete: content cleared, row retained.
    async fn delete_message(&self, actor_id: &str, message_id: &str) -> Result<Message>;

    async fn toggle_reaction(&self, actor_id: &str, message_id: &str, emoji: &str) -> Result<Message>;

    /// Bulk read-marking: zeroes the viewer's unread counter and adds them
    /// to `read_by` on every message in the conversation.
    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()>;

    fn subscribe_chat(&self) -> broadcast::Receiver<StoreEvent>;
}
