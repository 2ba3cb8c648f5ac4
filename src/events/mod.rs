//! Event system for real-time state notifications
//!
//! Session, recording and capture state changes are broadcast here so the
//! presentation layer (or the CLI) can render them without polling.

pub mod types;

pub use types::AvatarEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting avatar events
///
/// # Example
///
/// ```no_run
/// use avatar_stream::events::{AvatarEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(AvatarEvent::RecordingStateChanged { recording: true });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("Received event: {:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<AvatarEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published with no subscriber are dropped.
    pub fn publish(&self, event: AvatarEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    ///
    /// A subscriber that falls behind by more than the channel capacity
    /// receives `Lagged` and misses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
