//! Error types for the UnityNets realtime core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media error: {0}")]
    Media(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call signal not found: {0}")]
    SignalNotFound(String),

    #[error("Call signal already terminal: {0}")]
    SignalTerminal(String),

    #[error("Answer written before offer on signal {0}")]
    AnswerBeforeOffer(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Caller and receiver must be distinct users")]
    InvalidParticipants,
}

impl Error {
    /// Stable short code, used to de-duplicate repeated user notifications.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Media(_) => "media",
            Error::Signal(_) => "signal",
            Error::Store(_) => "store",
            Error::Connection(_) => "connection",
            Error::Json(_) => "json",
            Error::Sqlite(_) => "sqlite",
            Error::CallInProgress => "call_in_progress",
            Error::NoActiveCall => "no_active_call",
            Error::SignalNotFound(_) => "signal_not_found",
            Error::SignalTerminal(_) => "signal_terminal",
            Error::AnswerBeforeOffer(_) => "answer_before_offer",
            Error::ConversationNotFound(_) => "conversation_not_found",
            Error::MessageNotFound(_) => "message_not_found",
            Error::UserNotFound(_) => "user_not_found",
            Error::Forbidden(_) => "forbidden",
            Error::InvalidParticipants => "invalid_participants",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Connection(e.to_string())
    }
}
