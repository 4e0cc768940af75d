//! Event bus with named channels.
//!
//! Every event goes out on one broadcast sender; subscribers filter by
//! channel name. Publishing never blocks and never fails the caller.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::types::{CollisionEvent, ConsensusDecision, Timestamp, Transition};

pub const CHANNEL_LIFECYCLE: &str = "asset-lifecycle";
pub const CHANNEL_COLLISION: &str = "trade-collision";
pub const CHANNEL_CONSENSUS: &str = "consensus-decision";
pub const CHANNEL_CONTROL: &str = "system-control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Started,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Lifecycle(Transition),
    Collision(CollisionEvent),
    ConsensusDecision(ConsensusDecision),
    Control { kind: ControlKind, at: Timestamp },
}

impl BusEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            BusEvent::Lifecycle(_) => CHANNEL_LIFECYCLE,
            BusEvent::Collision(_) => CHANNEL_COLLISION,
            BusEvent::ConsensusDecision(_) => CHANNEL_CONSENSUS,
            BusEvent::Control { .. } => CHANNEL_CONTROL,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    stats: Arc<EngineStats>,
}

impl EventBus {
    pub fn new(capacity: usize, stats: Arc<EngineStats>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx, stats }
    }

    pub fn publish(&self, event: BusEvent) {
        let channel = event.channel();
        if self.tx.send(event).is_err() {
            // No subscriber at all; the event is still logged by its producer.
            EngineStats::incr(&self.stats.events_unobserved);
            log(
                Level::Trace,
                Domain::Bus,
                "unobserved",
                obj(&[("channel", v_str(channel))]),
            );
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lifecycle;

    fn transition() -> Transition {
        Transition {
            asset: "X".to_string(),
            from: Lifecycle::Prospective,
            to: Lifecycle::Active,
            trailing_pnl_pct: 0.0,
            position_multiplier: 1.0,
            at: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let stats = Arc::new(EngineStats::new());
        let bus = EventBus::new(32, stats.clone());
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::Lifecycle(transition()));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel(), CHANNEL_LIFECYCLE);
        assert_eq!(stats.snapshot().events_unobserved, 0);
    }

    #[test]
    fn test_publish_without_subscribers_is_counted() {
        let stats = Arc::new(EngineStats::new());
        let bus = EventBus::new(32, stats.clone());
        bus.publish(BusEvent::Control { kind: ControlKind::Shutdown, at: 5 });
        assert_eq!(stats.snapshot().events_unobserved, 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let v = serde_json::to_value(BusEvent::Control { kind: ControlKind::Started, at: 9 }).unwrap();
        assert_eq!(v["type"], "control");
        assert_eq!(v["kind"], "started");
    }
}
