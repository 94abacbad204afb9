//! Engine listeners.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::post::MaterializedThread;
use crate::error::ErrorKind;

/// Handle returned when a listener is registered; used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the outcome of every synchronization cycle.
///
/// Callbacks run on the engine task and must not block.
pub trait SyncListener: Send + Sync {
    fn on_data(&self, thread: Arc<MaterializedThread>);
    fn on_error(&self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Data(Arc<MaterializedThread>),
    Error { kind: ErrorKind, message: String },
}

/// Listener that forwards events into a channel for async consumers.
pub struct ChannelListener {
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events: tx }), rx)
    }

    fn forward(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Listener receiver dropped, discarding event");
        }
    }
}

impl SyncListener for ChannelListener {
    fn on_data(&self, thread: Arc<MaterializedThread>) {
        self.forward(SyncEvent::Data(thread));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.forward(SyncEvent::Error {
            kind,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_ids_are_unique() {
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_errors() {
        let (listener, mut events) = ChannelListener::new();

        listener.on_error(ErrorKind::Parse, "bad payload");

        match events.recv().await {
            Some(SyncEvent::Error { kind, message }) => {
                assert_eq!(kind, ErrorKind::Parse);
                assert_eq!(message, "bad payload");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (listener, events) = ChannelListener::new();
        drop(events);
        listener.on_error(ErrorKind::Transport, "offline");
    }
}
