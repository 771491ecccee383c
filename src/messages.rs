//! Message stream: one conversation's paginated history with optimistic
//! send, edit, soft delete and reaction toggling, reconciled against
//! push-delivered inserts and updates.

use crate::error::Result;
use crate::identity::IdentityProvider;
use crate::models::{Message, MessageKind, UserProfile};
use crate::notify::{ErrorReporter, NoticeKind};
use crate::pending::{PendingOps, PendingEntity};
use crate::store::{ChatStore, StoreEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

struct StreamState {
    /// Ascending by creation for display; may hold staged temp entries.
    messages: Vec<Message>,
    pending: PendingOps,
    /// Server rows currently held, i.e. the offset for the next page.
    server_loaded: i64,
    reached_start: bool,
}

pub struct MessageStream {
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    conversation_id: String,
    me: String,
    page_size: i64,
    state: Arc<Mutex<StreamState>>,
    revision: Arc<watch::Sender<u64>>,
    revision_rx: watch::Receiver<u64>,
    reporter: ErrorReporter,
    task: tokio::task::JoinHandle<()>,
}

impl MessageStream {
    /// Loads the first page, marks the conversation read for the viewer, and
    /// spawns the scoped push listener.
    pub async fn open(
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityProvider>,
        conversation_id: &str,
        page_size: i64,
        reporter: ErrorReporter,
    ) -> Result<Self> {
        let me = identity.user_id();
        // Subscribe before the initial fetch so nothing slips between them;
        // the listener skips rows it has already seen.
        let events = store.subscribe_chat();

        let page = store.fetch_messages(conversation_id, page_size, 0).await?;
        let fetched = page.len() as i64;
        let mut initial: Vec<Message> = page.into_iter().rev().collect();
        decorate(&*identity, &mut initial).await;

        store.mark_read(conversation_id, &me).await?;

        let state = Arc::new(Mutex::new(StreamState {
            messages: initial,
            pending: PendingOps::new(),
            server_loaded: fetched,
            reached_start: fetched < page_size,
        }));
        let (revision, revision_rx) = watch::channel(0u64);
        let revision = Arc::new(revision);

        let ctx = ListenerCtx {
            store: store.clone(),
            identity: identity.clone(),
            conversation_id: conversation_id.to_string(),
            me: me.clone(),
            state: state.clone(),
            revision: revision.clone(),
        };
        let task = tokio::spawn(listen(ctx, events));

        Ok(Self {
            store,
            identity,
            conversation_id: conversation_id.to_string(),
            me,
            page_size,
            state,
            revision,
            revision_rx,
            reporter,
            task,
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn reached_start(&self) -> bool {
        self.state.lock().reached_start
    }

    /// Bumped on every visible change; UIs watch this to re-render.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.revision_rx.clone()
    }

    /// Loads the next older page and prepends it. Returns how many rows the
    /// store returned.
    pub async fn load_more(&self) -> Result<usize> {
        let offset = self.state.lock().server_loaded;
        let page = self
            .store
            .fetch_messages(&self.conversation_id, self.page_size, offset)
            .await?;
        let fetched = page.len();
        let mut older: Vec<Message> = page.into_iter().rev().collect();
        decorate(&*self.identity, &mut older).await;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            older.retain(|m| !st.messages.iter().any(|e| e.id == m.id));
            older.append(&mut st.messages);
            st.messages = older;
            st.server_loaded += fetched as i64;
            if (fetched as i64) < self.page_size {
                st.reached_start = true;
            }
        }
        self.bump();
        Ok(fetched)
    }

    /// Optimistic send: the message shows immediately under a temp id, then
    /// is replaced by the confirmed row, or rolled back with a notice.
    pub async fn send(
        &self,
        kind: MessageKind,
        content: Option<String>,
        metadata: serde_json::Value,
        reply_to_id: Option<String>,
    ) -> Result<Message> {
        let draft = Message::outgoing(&self.conversation_id, &self.me, kind, content, metadata, reply_to_id);
        let temp_id = {
            let mut guard = self.state.lock();
            let temp_id = guard.pending.stage();
            let mut staged = draft.clone();
            staged.id = temp_id.clone();
            guard.messages.push(staged);
            temp_id
        };
        self.bump();

        match self.store.insert_message(draft).await {
            Ok(confirmed) => {
                {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    // The push listener may have delivered (and counted) the
                    // confirmed row already.
                    let already_counted = st.messages.iter().any(|m| m.id == confirmed.id);
                    st.pending.confirm(&mut st.messages, &temp_id, confirmed.clone());
                    if !already_counted {
                        st.server_loaded += 1;
                    }
                }
                self.bump();
                Ok(confirmed)
            }
            Err(e) => {
                {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    st.pending.rollback(&mut st.messages, &temp_id);
                }
                self.bump();
                self.reporter
                    .notify(NoticeKind::Chat, format!("message failed to send: {e}"));
                Err(e)
            }
        }
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> Result<Message> {
        let updated = self.store.edit_message(&self.me, message_id, content).await?;
        self.replace_local(updated.clone());
        Ok(updated)
    }

    pub async fn soft_delete(&self, message_id: &str) -> Result<Message> {
        let updated = self.store.delete_message(&self.me, message_id).await?;
        self.replace_local(updated.clone());
        Ok(updated)
    }

    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<Message> {
        let updated = self.store.toggle_reaction(&self.me, message_id, emoji).await?;
        self.replace_local(updated.clone());
        Ok(updated)
    }

    fn replace_local(&self, updated: Message) {
        {
            let mut guard = self.state.lock();
            if let Some(slot) = guard.messages.iter_mut().find(|m| m.id == updated.id) {
                let sender = slot.sender.take();
                *slot = updated;
                slot.sender = sender;
            }
        }
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl Drop for MessageStream {
    // Leaving the conversation view unsubscribes the push listener.
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Attaches resolved sender profiles, falling back to a placeholder when the
/// lookup fails.
async fn decorate(identity: &dyn IdentityProvider, messages: &mut [Message]) {
    let mut profiles: HashMap<String, UserProfile> = HashMap::new();
    for msg in messages.iter() {
        if !profiles.contains_key(&msg.sender_id) {
            let profile = match identity.profile(&msg.sender_id).await {
                Ok(profile) => profile,
                Err(_) => UserProfile::placeholder(&msg.sender_id),
            };
            profiles.insert(msg.sender_id.clone(), profile);
        }
    }
    for msg in messages.iter_mut() {
        msg.sender = profiles.get(&msg.sender_id).cloned();
    }
}

struct ListenerCtx {
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    conversation_id: String,
    me: String,
    state: Arc<Mutex<StreamState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl ListenerCtx {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Our own insert came back over push: reconcile against the staged temp
    /// message instead of duplicating.
    fn apply_own_insert(&self, msg: Message) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.messages.iter().any(|m| m.id == msg.id) {
            return;
        }
        let staged = st.messages.iter().position(|m| {
            PendingOps::is_temp(m.entity_id())
                && m.kind == msg.kind
                && m.content == msg.content
        });
        match staged {
            Some(pos) => st.messages[pos] = msg,
            None => st.messages.push(msg),
        }
        st.server_loaded += 1;
    }
}

async fn listen(ctx: ListenerCtx, mut events: broadcast::Receiver<StoreEvent>) {
    loop {
        match events.recv().await {
            Ok(StoreEvent::MessageInserted(msg)) if msg.conversation_id == ctx.conversation_id => {
                if msg.sender_id == ctx.me {
                    ctx.apply_own_insert(msg);
                } else {
                    // Resolve the sender before showing anything.
                    let profile = match ctx.identity.profile(&msg.sender_id).await {
                        Ok(profile) => profile,
                        Err(_) => UserProfile::placeholder(&msg.sender_id),
                    };
                    let mut decorated = msg;
                    decorated.sender = Some(profile);
                    {
                        let mut guard = ctx.state.lock();
                        let st = &mut *guard;
                        if !st.messages.iter().any(|m| m.id == decorated.id) {
                            st.messages.push(decorated);
                            st.server_loaded += 1;
                        }
                    }
                    // An inbound message while the stream is open counts as
                    // read immediately.
                    if let Err(e) = ctx.store.mark_read(&ctx.conversation_id, &ctx.me).await {
                        log::warn!("failed to mark {} read: {e}", ctx.conversation_id);
                    }
                }
                ctx.bump();
            }
            Ok(StoreEvent::MessageUpdated(msg)) if msg.conversation_id == ctx.conversation_id => {
                {
                    let mut guard = ctx.state.lock();
                    if let Some(slot) = guard.messages.iter_mut().find(|m| m.id == msg.id) {
                        let sender = slot.sender.take();
                        *slot = msg;
                        slot.sender = sender;
                    }
                }
                ctx.bump();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("message subscription lagged, {missed} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
