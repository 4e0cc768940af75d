//! Collision detector: pairs a discovery signal with a baseline signal for the
//! same asset and direction when their timestamps fall within the window.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;

use crate::error::ValidationError;
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::types::{CollisionEvent, Direction, Signal, SignalSource, Timestamp};

type BufferKey = (String, Direction);

/// A buffered signal and the instant its window closes.
#[derive(Debug)]
struct Pending {
    signal: Signal,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct KeyBuffer {
    discovery: Vec<Pending>,
    baseline: Vec<Pending>,
}

impl KeyBuffer {
    fn is_empty(&self) -> bool {
        self.discovery.is_empty() && self.baseline.is_empty()
    }

    fn contains(&self, id: &str) -> bool {
        self.discovery
            .iter()
            .chain(self.baseline.iter())
            .any(|p| p.signal.id == id)
    }

    fn len(&self) -> usize {
        self.discovery.len() + self.baseline.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Collided(CollisionEvent),
    Buffered,
    /// Arrived after its own window had already closed.
    Stale,
    /// Same content hash is pending or was already consumed.
    Replayed,
    /// Matched, but the asset holds no live slot so nothing executed.
    NotLive,
}

pub struct CollisionDetector {
    window_ms: u64,
    buffers: DashMap<BufferKey, KeyBuffer>,
    /// Consumed signal id -> instant after which a replay is stale anyway.
    consumed: DashMap<String, Timestamp>,
    stats: Arc<EngineStats>,
}

impl CollisionDetector {
    pub fn new(window_ms: u64, stats: Arc<EngineStats>) -> Self {
        Self {
            window_ms,
            buffers: DashMap::new(),
            consumed: DashMap::new(),
            stats,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Ingest one signal observed at `now`.
    pub fn on_signal(&self, signal: Signal, now: Timestamp) -> Result<SignalOutcome, ValidationError> {
        EngineStats::incr(&self.stats.signals_received);
        if let Err(e) = signal.validate() {
            EngineStats::incr(&self.stats.signals_invalid);
            logging::log_rejected(Domain::Collision, "signal", &e.to_string());
            return Err(e);
        }
        if signal.timestamp.saturating_add(self.window_ms) <= now {
            EngineStats::incr(&self.stats.signals_stale);
            log(
                Level::Debug,
                Domain::Collision,
                "stale",
                obj(&[("signal_id", v_str(&signal.id)), ("asset", v_str(&signal.asset))]),
            );
            return Ok(SignalOutcome::Stale);
        }
        if signal.timestamp > now.saturating_add(self.window_ms) {
            let e = ValidationError::FromTheFuture {
                timestamp: signal.timestamp,
                now,
                window_ms: self.window_ms,
            };
            EngineStats::incr(&self.stats.signals_invalid);
            logging::log_rejected(Domain::Collision, "signal", &e.to_string());
            return Err(e);
        }
        if self.consumed.contains_key(&signal.id) {
            return Ok(self.replayed(&signal));
        }

        // A signal stamped slightly ahead of the clock still lives one window
        // from arrival, not from its stamp.
        let expires_at = signal.timestamp.min(now).saturating_add(self.window_ms);
        let key = (signal.asset.clone(), signal.direction);
        let matched = {
            let mut entry = self.buffers.entry(key.clone()).or_default();
            // Consumed ids are written under this guard, so a replay racing
            // the collision that consumed it sees either the buffer or the mark.
            if self.consumed.contains_key(&signal.id) || entry.contains(&signal.id) {
                drop(entry);
                return Ok(self.replayed(&signal));
            }
            let buf = entry.value_mut();
            let (own, opposite) = match signal.source {
                SignalSource::Discovery => (&mut buf.discovery, &mut buf.baseline),
                SignalSource::Baseline => (&mut buf.baseline, &mut buf.discovery),
            };
            let window = self.window_ms;
            let candidate = opposite
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    c.signal.timestamp.abs_diff(signal.timestamp) <= window && c.expires_at > now
                })
                .min_by_key(|(_, c)| c.signal.timestamp)
                .map(|(i, _)| i);
            match candidate {
                Some(i) => {
                    let partner = opposite.remove(i);
                    self.consumed.insert(partner.signal.id.clone(), partner.expires_at);
                    self.consumed.insert(signal.id.clone(), expires_at);
                    Some(partner.signal)
                }
                None => {
                    own.push(Pending {
                        signal: signal.clone(),
                        expires_at,
                    });
                    None
                }
            }
        };

        let Some(partner) = matched else {
            log(
                Level::Trace,
                Domain::Collision,
                "buffered",
                obj(&[
                    ("signal_id", v_str(&signal.id)),
                    ("asset", v_str(&signal.asset)),
                    ("source", v_str(signal.source.as_str())),
                    ("expires_at", json!(expires_at)),
                ]),
            );
            return Ok(SignalOutcome::Buffered);
        };
        self.buffers.remove_if(&key, |_, b| b.is_empty());

        let (discovery, baseline) = match signal.source {
            SignalSource::Discovery => (signal, partner),
            SignalSource::Baseline => (partner, signal),
        };
        let event = CollisionEvent {
            asset: discovery.asset.clone(),
            direction: discovery.direction,
            discovery,
            baseline,
            window_ms: self.window_ms,
            executed_at: now,
            position_multiplier: 0.0,
        };
        EngineStats::incr(&self.stats.collisions);
        logging::log_collision(
            &event.asset,
            event.direction.as_str(),
            &event.discovery.id,
            &event.baseline.id,
            event.delta_ms(),
        );
        Ok(SignalOutcome::Collided(event))
    }

    /// Purge every pending signal whose window closed at or before `now`.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let mut expired = 0usize;
        self.buffers.retain(|_, buf| {
            for list in [&mut buf.discovery, &mut buf.baseline] {
                list.retain(|p| {
                    let live = now < p.expires_at;
                    if !live {
                        expired += 1;
                        log(
                            Level::Debug,
                            Domain::Collision,
                            "expired",
                            obj(&[("signal_id", v_str(&p.signal.id)), ("asset", v_str(&p.signal.asset))]),
                        );
                    }
                    live
                });
            }
            !buf.is_empty()
        });
        self.consumed.retain(|_, until| *until > now);
        EngineStats::add(&self.stats.signals_expired, expired as u64);
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.buffers
            .iter()
            .map(|e| e.len())
            .sum()
    }

    pub fn is_pending(&self, signal_id: &str) -> bool {
        self.buffers.iter().any(|e| e.contains(signal_id))
    }

    fn replayed(&self, signal: &Signal) -> SignalOutcome {
        EngineStats::incr(&self.stats.signals_replayed);
        log(
            Level::Debug,
            Domain::Collision,
            "replayed",
            obj(&[("signal_id", v_str(&signal.id)), ("asset", v_str(&signal.asset))]),
        );
        SignalOutcome::Replayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const W: u64 = 5_000;

    fn detector() -> (CollisionDetector, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        (CollisionDetector::new(W, stats.clone()), stats)
    }

    fn sig(asset: &str, dir: Direction, source: SignalSource, ts: u64) -> Signal {
        Signal::new(asset, dir, source, 0.8, ts, None)
    }

    #[test]
    fn test_end_to_end_window_scenario() {
        let (det, stats) = detector();
        let d = sig("X", Direction::Buy, SignalSource::Discovery, 100);
        let b = sig("X", Direction::Buy, SignalSource::Baseline, 103);
        assert_eq!(det.on_signal(d.clone(), 100).unwrap(), SignalOutcome::Buffered);
        let SignalOutcome::Collided(event) = det.on_signal(b.clone(), 103).unwrap() else {
            panic!("expected collision");
        };
        assert_eq!(event.executed_at, 103);
        assert_eq!(event.discovery.id, d.id);
        assert_eq!(event.baseline.id, b.id);
        assert_eq!(event.window_ms, W);

        let sell = sig("X", Direction::Sell, SignalSource::Discovery, 104);
        assert_eq!(det.on_signal(sell.clone(), 104).unwrap(), SignalOutcome::Buffered);
        assert_eq!(det.sweep(5_103), 0);
        assert!(det.is_pending(&sell.id));
        assert_eq!(det.sweep(5_104), 1);
        assert!(!det.is_pending(&sell.id));
        let snap = stats.snapshot();
        assert_eq!(snap.collisions, 1);
        assert_eq!(snap.signals_expired, 1);
    }

    #[test]
    fn test_replay_yields_no_second_collision() {
        let (det, stats) = detector();
        let d = sig("X", Direction::Buy, SignalSource::Discovery, 1_000);
        let b = sig("X", Direction::Buy, SignalSource::Baseline, 1_200);
        det.on_signal(d.clone(), 1_000).unwrap();
        assert!(matches!(det.on_signal(b.clone(), 1_200).unwrap(), SignalOutcome::Collided(_)));
        assert_eq!(det.on_signal(d, 1_300).unwrap(), SignalOutcome::Replayed);
        assert_eq!(det.on_signal(b, 1_300).unwrap(), SignalOutcome::Replayed);
        assert_eq!(det.pending_count(), 0);
        assert_eq!(stats.snapshot().signals_replayed, 2);
    }

    #[test]
    fn test_duplicate_pending_signal_is_replay() {
        let (det, _) = detector();
        let d = sig("X", Direction::Buy, SignalSource::Discovery, 1_000);
        det.on_signal(d.clone(), 1_000).unwrap();
        assert_eq!(det.on_signal(d, 1_001).unwrap(), SignalOutcome::Replayed);
        assert_eq!(det.pending_count(), 1);
    }

    #[test]
    fn test_opposite_directions_never_collide() {
        let (det, _) = detector();
        det.on_signal(sig("X", Direction::Buy, SignalSource::Discovery, 1_000), 1_000).unwrap();
        let out = det.on_signal(sig("X", Direction::Sell, SignalSource::Baseline, 1_001), 1_001).unwrap();
        assert_eq!(out, SignalOutcome::Buffered);
        assert_eq!(det.pending_count(), 2);
    }

    #[test]
    fn test_same_source_never_collides() {
        let (det, _) = detector();
        det.on_signal(sig("X", Direction::Buy, SignalSource::Baseline, 1_000), 1_000).unwrap();
        let out = det.on_signal(sig("X", Direction::Buy, SignalSource::Baseline, 1_002), 1_002).unwrap();
        assert_eq!(out, SignalOutcome::Buffered);
    }

    #[test]
    fn test_earliest_candidate_wins() {
        let (det, _) = detector();
        let late = sig("X", Direction::Buy, SignalSource::Baseline, 2_000);
        let early = sig("X", Direction::Buy, SignalSource::Baseline, 1_000);
        det.on_signal(late.clone(), 2_000).unwrap();
        det.on_signal(early.clone(), 2_000).unwrap();
        let SignalOutcome::Collided(event) = det
            .on_signal(sig("X", Direction::Buy, SignalSource::Discovery, 2_500), 2_500)
            .unwrap()
        else {
            panic!("expected collision");
        };
        assert_eq!(event.baseline.id, early.id);
        assert!(det.is_pending(&late.id));
    }

    #[test]
    fn test_stale_and_invalid_are_rejected() {
        let (det, stats) = detector();
        let old = sig("X", Direction::Buy, SignalSource::Discovery, 1_000);
        assert_eq!(det.on_signal(old, 6_000).unwrap(), SignalOutcome::Stale);
        let mut bad = sig("X", Direction::Buy, SignalSource::Discovery, 1_000);
        bad.confidence = 2.0;
        assert!(det.on_signal(bad, 1_000).is_err());
        assert_eq!(det.pending_count(), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.signals_stale, 1);
        assert_eq!(snap.signals_invalid, 1);
        assert_eq!(snap.signals_received, 2);
    }

    #[test]
    fn test_far_future_signal_is_rejected() {
        let (det, stats) = detector();
        let now = 1_000_000;
        let err = det
            .on_signal(sig("X", Direction::Buy, SignalSource::Discovery, u64::MAX - 1), now)
            .unwrap_err();
        assert!(matches!(err, ValidationError::FromTheFuture { .. }));
        assert_eq!(det.pending_count(), 0);
        assert_eq!(det.sweep(now + 1_000_000_000), 0);
        assert_eq!(stats.snapshot().signals_invalid, 1);
    }

    #[test]
    fn test_slightly_ahead_signal_expires_one_window_after_arrival() {
        let (det, _) = detector();
        let now = 10_000;
        let ahead = sig("X", Direction::Buy, SignalSource::Discovery, now + W);
        assert_eq!(det.on_signal(ahead.clone(), now).unwrap(), SignalOutcome::Buffered);
        assert_eq!(det.sweep(now + W - 1), 0);
        assert!(det.is_pending(&ahead.id));
        assert_eq!(det.sweep(now + W), 1);
        assert!(!det.is_pending(&ahead.id));
    }

    #[test]
    fn test_concurrent_replays_collide_once() {
        for round in 0..50u64 {
            let (det, stats) = detector();
            let det = Arc::new(det);
            let ts = 1_000 + round;
            let d = sig("X", Direction::Buy, SignalSource::Discovery, ts);
            let b = sig("X", Direction::Buy, SignalSource::Baseline, ts + 1);
            let mut handles = Vec::new();
            for i in 0..8 {
                let det = det.clone();
                let s = if i % 2 == 0 { d.clone() } else { b.clone() };
                handles.push(std::thread::spawn(move || det.on_signal(s, ts + 2).unwrap()));
            }
            let collided = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| matches!(o, SignalOutcome::Collided(_)))
                .count();
            assert_eq!(collided, 1);
            assert_eq!(det.pending_count(), 0);
            assert!(!det.is_pending(&d.id));
            assert!(!det.is_pending(&b.id));
            // A late copy after the collision settles is still a replay.
            assert_eq!(det.on_signal(d, ts + 3).unwrap(), SignalOutcome::Replayed);
            assert_eq!(stats.snapshot().collisions, 1);
        }
    }

    #[test]
    fn test_concurrent_pairs_each_collide_once() {
        let (det, stats) = detector();
        let det = Arc::new(det);
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let det = det.clone();
            handles.push(std::thread::spawn(move || {
                let asset = format!("A{}", i % 2);
                let ts = 1_000 + i;
                let src = if i % 4 < 2 { SignalSource::Discovery } else { SignalSource::Baseline };
                det.on_signal(Signal::new(&asset, Direction::Buy, src, 0.9, ts, None), 1_010)
                    .unwrap()
            }));
        }
        let collided = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, SignalOutcome::Collided(_)))
            .count();
        // Each asset gets two discovery and two baseline signals.
        assert_eq!(collided, 4);
        assert_eq!(det.pending_count(), 0);
        assert_eq!(stats.snapshot().collisions, 4);
    }

    proptest! {
        #[test]
        fn window_decides_collision(t1 in 1u64..100_000, t2 in 1u64..100_000) {
            let (det, _) = detector();
            let d = sig("X", Direction::Buy, SignalSource::Discovery, t1);
            let b = sig("X", Direction::Buy, SignalSource::Baseline, t2);
            if t1.abs_diff(t2) <= W {
                let now = t1.min(t2);
                det.on_signal(d, now).unwrap();
                let out = det.on_signal(b, now).unwrap();
                prop_assert!(matches!(out, SignalOutcome::Collided(_)));
                prop_assert_eq!(det.pending_count(), 0);
            } else {
                // Each arrives at its own stamp; the later one would be too far
                // ahead of the earlier clock.
                det.on_signal(d, t1).unwrap();
                let out = det.on_signal(b, t2).unwrap();
                prop_assert_eq!(out, SignalOutcome::Buffered);
                prop_assert_eq!(det.sweep(t1.max(t2) + W), 2);
            }
        }
    }
}
