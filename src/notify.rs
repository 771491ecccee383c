//! User-facing notices and de-duplicated error reporting.
//!
//! Background refresh loops can hit the same failure over and over; the
//! reporter surfaces each distinct error signature once instead of flooding
//! the user with identical notices on every retry.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Media,
    Signal,
    Chat,
    Info,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

#[derive(Clone)]
pub struct ErrorReporter {
    sender: mpsc::UnboundedSender<Notice>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl ErrorReporter {
    pub fn new(sender: mpsc::UnboundedSender<Notice>) -> Self {
        Self {
            sender,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Reports a recoverable background error, at most once per distinct
    /// signature (code plus message).
    pub fn report(&self, kind: NoticeKind, error: &Error) {
        let signature = format!("{}:{}", error.code(), error);
        if self.seen.lock().insert(signature) {
            self.send(kind, error.to_string());
        }
    }

    /// Sends a notice unconditionally. Used for one-shot failures the user
    /// acted on directly (a failed send, a failed call).
    pub fn notify(&self, kind: NoticeKind, message: impl Into<String>) {
        self.send(kind, message.into());
    }

    fn send(&self, kind: NoticeKind, message: String) {
        // A closed receiver just means the UI went away.
        let _ = self.sender.send(Notice { kind, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_errors_are_reported_once() {
        let (reporter, mut notices) = ErrorReporter::channel();

        let err = Error::Store("connection refused".to_string());
        reporter.report(NoticeKind::Chat, &err);
        reporter.report(NoticeKind::Chat, &err);
        reporter.report(NoticeKind::Chat, &err);

        let first = notices.try_recv().unwrap();
        assert!(first.message.contains("connection refused"));
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn distinct_signatures_pass_through() {
        let (reporter, mut notices) = ErrorReporter::channel();

        reporter.report(NoticeKind::Chat, &Error::Store("timeout".to_string()));
        reporter.report(NoticeKind::Chat, &Error::Store("refused".to_string()));

        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn notify_is_never_deduplicated() {
        let (reporter, mut notices) = ErrorReporter::channel();

        reporter.notify(NoticeKind::Info, "send failed");
        reporter.notify(NoticeKind::Info, "send failed");

        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_ok());
    }
}
