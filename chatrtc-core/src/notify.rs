//! User-visible notifications and call events

use crate::types::{CallEvent, ErrorKind, Notice};
use tokio::sync::broadcast;

/// Fan-out of [`CallEvent`]s to every subscriber
///
/// Cloning shares the underlying channel. Sending never fails: with no
/// subscriber the event is only logged.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<CallEvent>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: CallEvent) {
        tracing::trace!(?event, "Call event");
        let _ = self.sender.send(event);
    }

    /// Degraded-but-continuing warning
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(notice = %message, "User warning");
        self.emit(CallEvent::Notice(Notice::Warning { message }));
    }

    /// Blocking error
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>, retryable: bool) {
        let message = message.into();
        tracing::error!(?kind, retryable, notice = %message, "User error");
        self.emit(CallEvent::Notice(Notice::Error {
            kind,
            message,
            retryable,
        }));
    }

    /// Positive confirmation
    pub fn success(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(notice = %message, "User notice");
        self.emit(CallEvent::Notice(Notice::Success { message }));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_notices_reach_subscribers() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.warn("audio only");
        notifier.error(ErrorKind::PermissionDenied, "blocked", true);

        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::Notice(Notice::Warning {
                message: "audio only".to_string()
            })
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            CallEvent::Notice(Notice::Error {
                kind: ErrorKind::PermissionDenied,
                retryable: true,
                ..
            })
        ));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let notifier = Notifier::default();
        notifier.success("connected");
    }
}
