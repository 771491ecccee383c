//! Data models for the UnityNets realtime core

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub trust_score: Option<f64>,
}

impl UserProfile {
    /// Fallback profile shown when a lookup fails; a message or call is never
    /// displayed without some resolvable sender metadata.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            avatar_url: None,
            trust_score: None,
        }
    }
}

// ============================================================================
// Call signaling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(CallType::Voice),
            "video" => Some(CallType::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Rejected,
    Ended,
    Missed,
}

impl CallStatus {
    /// Terminal signals are immutable; no further transition is applied.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended | CallStatus::Missed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(CallStatus::Ringing),
            "accepted" => Some(CallStatus::Accepted),
            "rejected" => Some(CallStatus::Rejected),
            "ended" => Some(CallStatus::Ended),
            "missed" => Some(CallStatus::Missed),
            _ => None,
        }
    }
}

/// One ICE candidate contributed by either side of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub by: String,
    pub candidate: RTCIceCandidateInit,
}

/// The negotiation payload carried by a call signal: at most one offer, at
/// most one answer, and an append-only candidate list. The whole document is
/// rewritten on every change (the store has no partial-JSON merge), so
/// writers re-read it immediately before writing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalData {
    pub offer: Option<RTCSessionDescription>,
    pub answer: Option<RTCSessionDescription>,
    #[serde(default)]
    pub candidates: Vec<CandidateEntry>,
}

impl SignalData {
    /// Reconciles a rewrite of the whole document against what is already
    /// stored. Offer and answer are write-once (the first value stands);
    /// candidate lists union in arrival order, each entry exactly once. Two
    /// parties re-reading then rewriting concurrently converge instead of
    /// clobbering each other.
    pub fn merge(current: SignalData, incoming: SignalData) -> SignalData {
        let mut candidates = current.candidates;
        for entry in incoming.candidates {
            let seen = candidates
                .iter()
                .any(|e| e.by == entry.by && e.candidate.candidate == entry.candidate.candidate);
            if !seen {
                candidates.push(entry);
            }
        }
        SignalData {
            offer: current.offer.or(incoming.offer),
            answer: current.answer.or(incoming.answer),
            candidates,
        }
    }
}

/// One row per call attempt, the durable mailbox both parties signal through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSignal {
    pub id: String,
    pub conversation_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub signal_data: SignalData,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub created_at: i64,
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Admin,
    Owner,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Member => "member",
            ParticipantRole::Admin => "admin",
            ParticipantRole::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(ParticipantRole::Member),
            "admin" => Some(ParticipantRole::Admin),
            "owner" => Some(ParticipantRole::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub role: ParticipantRole,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub unread_count: i32,
    pub last_read_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub updated_at: i64,
    pub last_message: Option<Message>,
    pub participants: Vec<Participant>,
    /// Unread counter for the viewer the list was fetched for.
    pub unread_count: i32,
}

impl Conversation {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_pinned_for(&self, user_id: &str) -> bool {
        self.participant(user_id).map(|p| p.is_pinned).unwrap_or(false)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Voice,
    File,
    CallStarted,
    CallEnded,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
            MessageKind::CallStarted => "call_started",
            MessageKind::CallEnded => "call_ended",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "voice" => Some(MessageKind::Voice),
            "file" => Some(MessageKind::File),
            "call_started" => Some(MessageKind::CallStarted),
            "call_ended" => Some(MessageKind::CallEnded),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    /// Cleared to `None` when the message is soft-deleted.
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    pub reply_to_id: Option<String>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub is_forwarded: bool,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub deleted_at: Option<i64>,
    /// Resolved sender metadata, attached when the message is delivered to a
    /// viewer. Not persisted.
    #[serde(skip)]
    pub sender: Option<UserProfile>,
}

impl Message {
    /// A draft for an outgoing message. The store assigns the final id and
    /// timestamp; `read_by` starts with the sender.
    pub fn outgoing(
        conversation_id: &str,
        sender_id: &str,
        kind: MessageKind,
        content: Option<String>,
        metadata: serde_json::Value,
        reply_to_id: Option<String>,
    ) -> Self {
        let mut read_by = BTreeSet::new();
        read_by.insert(sender_id.to_string());
        Self {
            id: String::new(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            kind,
            content,
            metadata,
            read_by,
            reactions: BTreeMap::new(),
            reply_to_id,
            is_edited: false,
            is_deleted: false,
            is_pinned: false,
            is_forwarded: false,
            created_at: Utc::now().timestamp_millis(),
            edited_at: None,
            deleted_at: None,
            sender: None,
        }
    }

    /// Adds or removes `user_id` under `emoji`; returns whether the reaction
    /// was added. An emoji key never survives with an empty member set.
    pub fn toggle_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        let set = self.reactions.entry(emoji.to_string()).or_default();
        let added = if set.contains(user_id) {
            set.remove(user_id);
            false
        } else {
            set.insert(user_id.to_string());
            true
        };
        if self.reactions.get(emoji).map(|s| s.is_empty()).unwrap_or(false) {
            self.reactions.remove(emoji);
        }
        added
    }

    /// Soft delete: the row stays for ordering and counts, the content goes.
    pub fn tombstone(&mut self, at: i64) {
        self.content = None;
        self.is_deleted = true;
        self.deleted_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Rejected,
            CallStatus::Ended,
            CallStatus::Missed,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CallStatus::parse("bogus"), None);
    }

    #[test]
    fn concurrent_signal_rewrites_converge() {
        let offer: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "offer", "sdp": "v=0\r\n" })).unwrap();
        let answer: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "answer", "sdp": "v=0\r\n" })).unwrap();
        let entry = |by: &str, tag: &str| CandidateEntry {
            by: by.to_string(),
            candidate: RTCIceCandidateInit {
                candidate: format!("candidate:{tag}"),
                ..Default::default()
            },
        };

        let base = SignalData {
            offer: Some(offer),
            answer: None,
            candidates: vec![entry("alice", "a0")],
        };
        // Two writers that both started from `base`: one contributed the
        // answer, the other a new candidate.
        let mut with_answer = base.clone();
        with_answer.answer = Some(answer);
        let mut with_candidate = base.clone();
        with_candidate.candidates.push(entry("bob", "b0"));

        let merged = SignalData::merge(with_answer, with_candidate);
        assert!(merged.offer.is_some());
        assert!(merged.answer.is_some());
        let tags: Vec<&str> = merged.candidates.iter().map(|c| c.candidate.candidate.as_str()).collect();
        assert_eq!(tags, vec!["candidate:a0", "candidate:b0"]);

        // Merging the result with itself changes nothing.
        let again = SignalData::merge(merged.clone(), merged.clone());
        assert_eq!(again.candidates.len(), 2);
    }

    #[test]
    fn outgoing_message_is_read_by_sender() {
        let msg = Message::outgoing("c1", "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None);
        assert!(msg.read_by.contains("alice"));
        assert_eq!(msg.read_by.len(), 1);
    }

    #[test]
    fn reaction_toggle_returns_to_original_state() {
        let mut msg = Message::outgoing("c1", "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None);
        let before = msg.reactions.clone();

        assert!(msg.toggle_reaction("👍", "bob"));
        assert_eq!(msg.reactions.get("👍").map(|s| s.len()), Some(1));

        assert!(!msg.toggle_reaction("👍", "bob"));
        assert_eq!(msg.reactions, before);
    }

    #[test]
    fn no_empty_reaction_sets_survive() {
        let mut msg = Message::outgoing("c1", "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None);
        msg.toggle_reaction("🎉", "alice");
        msg.toggle_reaction("🎉", "bob");
        msg.toggle_reaction("🎉", "alice");
        assert_eq!(msg.reactions.get("🎉").map(|s| s.len()), Some(1));
        msg.toggle_reaction("🎉", "bob");
        assert!(!msg.reactions.contains_key("🎉"));
    }

    #[test]
    fn tombstone_clears_content_keeps_row() {
        let mut msg = Message::outgoing("c1", "alice", MessageKind::Text, Some("secret".into()), serde_json::Value::Null, None);
        msg.tombstone(42);
        assert!(msg.is_deleted);
        assert_eq!(msg.content, None);
        assert_eq!(msg.deleted_at, Some(42));
        assert_eq!(msg.conversation_id, "c1");
    }
}
