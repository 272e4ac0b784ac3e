//! Fire-and-forget notifications of the sequence thread.

use super::item::ItemState;
use std::time::Duration;
use tokio::sync::broadcast;

/// Progress and state notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// Status message changed.
    Message(String),
    /// Overall progress changed.
    Progress {
        /// Current value.
        value: usize,
        /// Maximum value.
        maximum: usize,
    },
    /// An item changed state.
    ItemState {
        /// Item key.
        key: String,
        /// New state.
        state: ItemState,
    },
    /// Strip scan progress of a top level item.
    ItemProgress {
        /// Item key.
        key: String,
        /// Strips started.
        value: usize,
        /// Strips selected.
        maximum: usize,
    },
    /// The contacted strip changed, empty if none.
    StripChanged(String),
    /// Strip scan time estimate.
    Estimate {
        /// Time since the first strip.
        elapsed: Duration,
        /// Expected time to completion.
        remaining: Duration,
    },
    /// Remeasure/recontact counters changed.
    StatisticsChanged,
    /// A row was inserted for `namespace/type/name`.
    DataChanged {
        /// Data namespace.
        namespace: String,
        /// Measurement type.
        kind: String,
        /// Item full name.
        name: String,
    },
    /// The run finished.
    Finished,
}

/// Sending half of the sequence notifications.
///
/// Sending never blocks, events are dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<SequenceEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// New sink with its own channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn emit(&self, event: SequenceEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a status message.
    pub fn message(&self, message: impl Into<String>) {
        self.emit(SequenceEvent::Message(message.into()));
    }

    /// Publish overall progress.
    pub fn progress(&self, value: usize, maximum: usize) {
        self.emit(SequenceEvent::Progress { value, maximum });
    }
}
