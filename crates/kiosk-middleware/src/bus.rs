//! Fan-out of kernel [`Event`]s to async observers.
//!
//! One [`tokio::sync::broadcast`] channel per lane: each subscriber gets its
//! own copy of every event, and a slow subscriber only loses its own backlog.
//!
//! # Topics
//!
//! | Lane | Carries |
//! |:--|:--|
//! | [`Topic::StateChanges`] | Observed display/process state changed value |
//! | [`Topic::Repairs`] | Reconciliation repairs and load-triggered restarts |
//! | [`Topic::Presence`] | Accepted (debounced) wake requests |

use kiosk_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per lane before a lagging subscriber starts losing them.
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Observed display power or process liveness changed value.
    StateChanges,
    /// Corrective actions: drift repairs and forced restarts.
    Repairs,
    /// Debounced presence wake requests.
    Presence,
}

impl Topic {
    /// The lane an event payload belongs on.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::DisplayObserved { .. } | EventPayload::ProcessObserved { .. } => {
                Topic::StateChanges
            }
            EventPayload::Repair { .. } | EventPayload::LoadRestart { .. } => Topic::Repairs,
            EventPayload::WakeRequested { .. } => Topic::Presence,
        }
    }
}

/// Handle to the bus.  Clones publish to and subscribe on the same lanes.
#[derive(Clone, Debug)]
pub struct EventBus {
    state_changes: broadcast::Sender<Event>,
    repairs: broadcast::Sender<Event>,
    presence: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` bounds each lane separately.
    pub fn new(capacity: usize) -> Self {
        let (state_changes, _) = broadcast::channel(capacity);
        let (repairs, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            state_changes,
            repairs,
            presence,
        }
    }

    /// Send `event` on `topic` and return how many subscribers got it.
    /// Zero subscribers is normal: the kernel publishes unconditionally.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.lane(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => {
                trace!(?topic, "no subscribers; event dropped");
                0
            }
        }
    }

    /// Publish `event` on the lane matching its payload.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.lane(topic).subscribe(),
        }
    }

    fn lane(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::StateChanges => &self.state_changes,
            Topic::Repairs => &self.repairs,
            Topic::Presence => &self.presence,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Subscription to one lane, from [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event on the lane.  `Lagged(n)` means `n` events were skipped
    /// for this subscriber; receiving again continues with the oldest one
    /// still buffered.  `Closed` means every bus handle is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
