//! UnityNets Core Library
//!
//! Call signaling and realtime chat synchronization: the peer-to-peer call
//! handshake over a shared signal table, the media connection lifecycle, and
//! conversation/message sync with optimistic local mutations reconciled
//! against push events.

pub mod call;
pub mod config;
pub mod conversations;
pub mod error;
pub mod identity;
pub mod messages;
pub mod models;
pub mod notify;
pub mod pending;
pub mod peer;
pub mod signal;
pub mod storage;
pub mod store;

use std::sync::Arc;
use tokio::sync::mpsc;

pub use call::{ActiveCallInfo, CallCommand, CallController, CallPhase, CallSnapshot};
pub use config::RtcConfig;
pub use conversations::ConversationStore;
pub use error::{Error, Result};
pub use identity::{IdentityProvider, StaticIdentity};
pub use messages::MessageStream;
pub use models::*;
pub use notify::{ErrorReporter, Notice, NoticeKind};
pub use peer::{MediaSource, PeerEvent, PeerSession, StaticMediaSource};
pub use signal::{SignalChannel, SignalEvent};
pub use storage::SqliteStore;
pub use store::{ChatStore, SignalStore, StoreEvent};

/// Everything wired together for one signed-in user: a call controller, the
/// conversation list, and per-conversation message streams, sharing one
/// notice channel.
pub struct RealtimeClient {
    config: RtcConfig,
    chat: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    reporter: ErrorReporter,
    calls: CallController,
    conversations: ConversationStore,
}

impl RealtimeClient {
    /// Builds the client and returns it together with the receiver for
    /// user-facing notices.
    pub fn new(
        config: RtcConfig,
        signal_store: Arc<dyn SignalStore>,
        chat_store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityProvider>,
        media: Arc<dyn MediaSource>,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (reporter, notices) = ErrorReporter::channel();
        let signals = SignalChannel::new(signal_store);
        let calls = CallController::spawn(
            config.clone(),
            signals,
            identity.clone(),
            media,
            reporter.clone(),
        );
        let conversations =
            ConversationStore::spawn(chat_store.clone(), &identity.user_id(), reporter.clone());

        (
            Self {
                config,
                chat: chat_store,
                identity,
                reporter,
                calls,
                conversations,
            },
            notices,
        )
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Opens the message stream for one conversation. Dropping the stream
    /// unsubscribes it.
    pub async fn open_messages(&self, conversation_id: &str) -> Result<MessageStream> {
        MessageStream::open(
            self.chat.clone(),
            self.identity.clone(),
            conversation_id,
            self.config.message_page_size,
            self.reporter.clone(),
        )
        .await
    }
}
