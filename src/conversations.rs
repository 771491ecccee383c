//! Conversation store: the viewer's conversation list, kept in sync through
//! push events.
//!
//! Subscription is broad (every message/participant event triggers a full
//! list refresh). Conversation lists are small per user, so this is a
//! deliberate scalability simplification, not a correctness requirement.

use crate::error::Result;
use crate::models::Conversation;
use crate::notify::{ErrorReporter, NoticeKind};
use crate::store::{ChatStore, StoreEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub struct ConversationStore {
    store: Arc<dyn ChatStore>,
    viewer: String,
    list: watch::Receiver<Vec<Conversation>>,
    task: tokio::task::JoinHandle<()>,
}

impl ConversationStore {
    pub fn spawn(store: Arc<dyn ChatStore>, viewer: &str, reporter: ErrorReporter) -> Self {
        let (tx, rx) = watch::channel(Vec::new());
        let events = store.subscribe_chat();
        let task = tokio::spawn(refresh_loop(
            store.clone(),
            viewer.to_string(),
            tx,
            events,
            reporter,
        ));
        Self {
            store,
            viewer: viewer.to_string(),
            list: rx,
            task,
        }
    }

    /// Pinned first, then most recently updated; refreshed on every push
    /// event.
    pub fn watch(&self) -> watch::Receiver<Vec<Conversation>> {
        self.list.clone()
    }

    pub async fn list(&self) -> Result<Vec<Conversation>> {
        self.store.list_conversations(&self.viewer).await
    }

    /// Same conversation id regardless of which side asks first.
    pub async fn get_or_create_direct(&self, other_user_id: &str) -> Result<String> {
        self.store.get_or_create_direct(&self.viewer, other_user_id).await
    }

    pub async fn create_group(&self, name: &str, member_ids: &[String]) -> Result<String> {
        self.store.create_group(&self.viewer, name, member_ids).await
    }

    pub async fn set_pinned(&self, conversation_id: &str, pinned: bool) -> Result<()> {
        self.store.set_pinned(conversation_id, &self.viewer, pinned).await
    }

    pub async fn set_muted(&self, conversation_id: &str, muted: bool) -> Result<()> {
        self.store.set_muted(conversation_id, &self.viewer, muted).await
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh_loop(
    store: Arc<dyn ChatStore>,
    viewer: String,
    tx: watch::Sender<Vec<Conversation>>,
    mut events: broadcast::Receiver<StoreEvent>,
    reporter: ErrorReporter,
) {
    refresh(&*store, &viewer, &tx, &reporter).await;
    loop {
        match events.recv().await {
            Ok(StoreEvent::MessageInserted(_))
            | Ok(StoreEvent::MessageUpdated(_))
            | Ok(StoreEvent::ParticipantChanged { .. }) => {
                refresh(&*store, &viewer, &tx, &reporter).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("conversation subscription lagged, {missed} events dropped");
                refresh(&*store, &viewer, &tx, &reporter).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn refresh(
    store: &dyn ChatStore,
    viewer: &str,
    tx: &watch::Sender<Vec<Conversation>>,
    reporter: &ErrorReporter,
) {
    match store.list_conversations(viewer).await {
        Ok(list) => {
            tx.send_replace(list);
        }
        // Reported once per distinct signature, not on every retry.
        Err(e) => reporter.report(NoticeKind::Chat, &e),
    }
}
