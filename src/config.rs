//! Configuration for the realtime core

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN servers used for candidate gathering. No TURN relay is
    /// configured, so clients behind symmetric NAT may fail to connect.
    pub stun_servers: Vec<String>,
    /// Messages fetched per history page.
    pub message_page_size: i64,
    /// How long an unanswered call rings before it resolves as missed.
    /// `None` disables the timeout.
    pub ring_timeout_secs: Option<u64>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            message_page_size: 50,
            ring_timeout_secs: Some(60),
        }
    }
}
