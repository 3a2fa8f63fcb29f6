//! Headless, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Publishing never blocks, which matters because most events
//! are raised from the bus worker's callers and the telemetry poller, both
//! plain OS threads.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Safety`] | Safety-state transitions, emergency stops, confirmed stalls |
//! | [`Topic::Calibration`] | Per-joint calibration commits and failures |
//! | [`Topic::Health`] | Drift detection and homing-offset compensation |

use armguard_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Safety,
    Calibration,
    Health,
}

impl Topic {
    /// The lane a payload belongs on.
    pub fn for_payload(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::SafetyTransition { .. }
            | EventPayload::EmergencyStop { .. }
            | EventPayload::StallConfirmed { .. } => Topic::Safety,
            EventPayload::CalibrationCommitted { .. } | EventPayload::CalibrationFailed { .. } => {
                Topic::Calibration
            }
            EventPayload::DriftDetected { .. } | EventPayload::HomingCompensated { .. } => {
                Topic::Health
            }
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    safety: broadcast::Sender<Event>,
    calibration: broadcast::Sender<Event>,
    health: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (safety, _) = broadcast::channel(capacity);
        let (calibration, _) = broadcast::channel(capacity);
        let (health, _) = broadcast::channel(capacity);
        Self {
            safety,
            calibration,
            health,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Returns `0` when nobody is listening; that is a normal condition.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(?topic, source = %event.source, "event dropped: no subscribers");
                0
            }
        }
    }

    /// Publish to the topic implied by the event's payload.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Build an [`Event`] from `source` and `payload` and publish it.
    pub fn emit(&self, source: &str, payload: EventPayload) -> usize {
        self.publish(Event::new(source, payload))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Safety => &self.safety,
            Topic::Calibration => &self.calibration,
            Topic::Health => &self.health,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Drain everything currently buffered without waiting.
    ///
    /// Lag is logged and skipped, so this suits synchronous callers such as
    /// the CLI shell.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(_) => return events,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armguard_types::JointId;

    fn stall_event(joint: u8) -> Event {
        Event::new(
            "armguard-kernel::stall",
            EventPayload::StallConfirmed {
                joint: JointId(joint),
                position: 1500,
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(stall_event(1)), 0);
    }

    #[test]
    fn payloads_route_to_their_topic() {
        assert_eq!(
            Topic::for_payload(&EventPayload::HomingCompensated {
                joint: JointId(1),
                old_offset: 0,
                new_offset: 150
            }),
            Topic::Health
        );
        assert_eq!(
            Topic::for_payload(&EventPayload::EmergencyStop {
                disabled: vec![],
                unreachable: vec![]
            }),
            Topic::Safety
        );
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub1 = bus.subscribe_to(Topic::Safety);
        let mut sub2 = bus.subscribe_to(Topic::Safety);

        let event = stall_event(2);
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(sub1.recv().await?.id, event.id);
        assert_eq!(sub2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut health = bus.subscribe_to(Topic::Health);
        let _safety = bus.subscribe_to(Topic::Safety);

        bus.publish(stall_event(3));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), health.recv()).await;
        assert!(result.is_err(), "Health subscriber must not see a Safety event");
    }

    #[test]
    fn drain_collects_buffered_events_and_survives_lag() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_to(Topic::Safety);
        for joint in 0..10 {
            bus.publish(stall_event(joint));
        }
        let events = sub.drain();
        assert_eq!(events.len(), 4);
        assert!(sub.drain().is_empty());
        assert_eq!(sub.topic(), Topic::Safety);
    }
}
