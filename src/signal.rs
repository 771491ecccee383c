//! Signal channel: the durable, observable mailbox two call parties use to
//! exchange session descriptions and ICE candidates before any direct path
//! between them exists.

use crate::error::{Error, Result};
use crate::models::{CallSignal, CallStatus, CallType, CandidateEntry, SignalData};
use crate::store::{SignalStore, StoreEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Role-scoped view of signal traffic for one user. Receivers ring on new
/// inserts; callers react to accept/terminal updates; both sides consume
/// candidate appends.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Incoming(CallSignal),
    Updated(CallSignal),
}

#[derive(Clone)]
pub struct SignalChannel {
    store: Arc<dyn SignalStore>,
}

impl SignalChannel {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }

    /// Starts a call attempt: one new row, status `ringing`. A failure here
    /// means the call could not be started at all.
    pub async fn create(
        &self,
        conversation_id: &str,
        caller_id: &str,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<CallSignal> {
        let signal = CallSignal {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type,
            status: CallStatus::Ringing,
            signal_data: SignalData::default(),
            started_at: None,
            ended_at: None,
            created_at: Utc::now().timestamp_millis(),
        };
        self.store.insert_signal(signal.clone()).await?;
        Ok(signal)
    }

    pub async fn get(&self, id: &str) -> Result<CallSignal> {
        self.store.get_signal(id).await
    }

    /// Merges the offer into `signal_data`. The store has no partial-JSON
    /// merge, so the whole document is re-read immediately before writing;
    /// concurrent candidate appends from the other side survive.
    pub async fn write_offer(&self, id: &str, offer: RTCSessionDescription) -> Result<()> {
        let mut data = self.store.get_signal(id).await?.signal_data;
        data.offer = Some(offer);
        self.store.update_signal_data(id, data).await
    }

    /// Same read-modify-write discipline as [`write_offer`]. An answer is
    /// only valid once an offer exists.
    ///
    /// [`write_offer`]: SignalChannel::write_offer
    pub async fn write_answer(&self, id: &str, answer: RTCSessionDescription) -> Result<()> {
        let mut data = self.store.get_signal(id).await?.signal_data;
        if data.offer.is_none() {
            return Err(Error::AnswerBeforeOffer(id.to_string()));
        }
        data.answer = Some(answer);
        self.store.update_signal_data(id, data).await
    }

    pub async fn append_candidate(
        &self,
        id: &str,
        by: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let mut data = self.store.get_signal(id).await?.signal_data;
        data.candidates.push(CandidateEntry {
            by: by.to_string(),
            candidate,
        });
        self.store.update_signal_data(id, data).await
    }

    /// Receiver answered: status `accepted`, `started_at` stamped once.
    pub async fn accept(&self, id: &str) -> Result<CallSignal> {
        self.store
            .update_signal_status(id, CallStatus::Accepted, Some(Utc::now().timestamp_millis()), None)
            .await
    }

    /// Moves the signal into a terminal status and stamps `ended_at`. The
    /// store refuses the transition if the signal is already terminal.
    pub async fn finish(&self, id: &str, status: CallStatus) -> Result<CallSignal> {
        debug_assert!(status.is_terminal());
        self.store
            .update_signal_status(id, status, None, Some(Utc::now().timestamp_millis()))
            .await
    }

    /// Spawns a forwarder that narrows the store's raw push feed down to
    /// events relevant to `user_id`, in arrival order.
    pub fn subscribe_for(&self, user_id: &str) -> mpsc::UnboundedReceiver<SignalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.store.subscribe_signals();
        let user = user_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::SignalInserted(signal)) => {
                        if signal.receiver_id == user && signal.status == CallStatus::Ringing {
                            if tx.send(SignalEvent::Incoming(signal)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(StoreEvent::SignalUpdated(signal)) => {
                        if signal.caller_id == user || signal.receiver_id == user {
                            if tx.send(SignalEvent::Updated(signal)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("signal subscription lagged, {missed} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}
