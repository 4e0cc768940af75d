//! Signal producers and the task loop that drives them.
//!
//! A producer is evaluated once per tick on its own tokio task. Failures and
//! panics stay inside the task: they are logged, counted, and the tick's
//! emission is skipped.

pub mod baseline;
pub mod discovery;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::archive::{ArchiveOutcome, PatternArchive};
use crate::config::now_ms;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::types::{Category, Direction, Pattern, Signal, Timestamp};

pub use baseline::BaselineProducer;
pub use discovery::{DiscoveryProducer, FeatureScorer, LinearScorer, Score};
pub use registry::{FeatureFeeds, LinearScorerFactory, ProducerRegistry, ScorerFactory};

/// What one evaluation produced. Both halves are optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emission {
    pub pattern: Option<Pattern>,
    pub signal: Option<Signal>,
}

#[async_trait]
pub trait Producer: Send {
    fn id(&self) -> &str;

    /// Discovery producers carry their domain; baseline producers have none.
    fn category(&self) -> Option<Category>;

    async fn tick(&mut self, now: Timestamp) -> Result<Emission>;
}

/// Fires once when confidence reaches the threshold in a direction, then
/// stays quiet until confidence drops back or the direction flips.
#[derive(Debug, Clone)]
pub struct EdgeTrigger {
    threshold: f64,
    fired: Option<Direction>,
}

impl EdgeTrigger {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, fired: None }
    }

    pub fn update(&mut self, direction: Option<Direction>, confidence: f64) -> Option<Direction> {
        match direction {
            Some(d) if confidence >= self.threshold => {
                if self.fired == Some(d) {
                    None
                } else {
                    self.fired = Some(d);
                    Some(d)
                }
            }
            _ => {
                self.fired = None;
                None
            }
        }
    }
}

/// Shared sinks every producer task publishes into.
#[derive(Clone)]
pub struct ProducerContext {
    pub archive: Arc<PatternArchive>,
    pub signals: mpsc::Sender<Signal>,
    pub stats: Arc<EngineStats>,
    pub interval_ms: u64,
}

pub fn spawn_producer(
    mut producer: Box<dyn Producer>,
    ctx: ProducerContext,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(ctx.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let id = producer.id().to_string();
        let category = producer.category().map(|c| c.as_str()).unwrap_or("baseline");
        log(
            Level::Debug,
            Domain::Producer,
            "producer_started",
            obj(&[("producer_id", v_str(&id)), ("category", v_str(category))]),
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            let now = now_ms();
            let emission = match AssertUnwindSafe(producer.tick(now)).catch_unwind().await {
                Ok(Ok(emission)) => emission,
                Ok(Err(e)) => {
                    report_failure(&ctx.stats, &id, &e.to_string());
                    continue;
                }
                Err(_) => {
                    report_failure(&ctx.stats, &id, "panic during evaluation");
                    continue;
                }
            };
            if !dispatch(emission, &ctx, now).await {
                break;
            }
        }
        log(
            Level::Debug,
            Domain::Producer,
            "producer_stopped",
            obj(&[("producer_id", v_str(&id))]),
        );
    })
}

/// Returns false once the signal channel is closed.
async fn dispatch(emission: Emission, ctx: &ProducerContext, now: Timestamp) -> bool {
    if let Some(pattern) = emission.pattern {
        match ctx.archive.archive(pattern, now) {
            Ok(ArchiveOutcome::Dropped(e)) => log(
                Level::Warn,
                Domain::Producer,
                "pattern_dropped",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
            Ok(_) | Err(_) => {}
        }
    }
    if let Some(signal) = emission.signal {
        // Backpressure: wait for room rather than drop.
        if ctx.signals.send(signal).await.is_err() {
            return false;
        }
    }
    true
}

fn report_failure(stats: &EngineStats, producer_id: &str, error: &str) {
    EngineStats::incr(&stats.producer_errors);
    log(
        Level::Error,
        Domain::Producer,
        "evaluation_failed",
        obj(&[
            ("producer_id", v_str(producer_id)),
            ("error", v_str(error)),
            ("errors_total", json!(stats.producer_errors.load(std::sync::atomic::Ordering::Relaxed))),
        ]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::reliability::writer::{spawn_writer, WriterConfig};
    use crate::storage::PatternStore;
    use crate::types::SignalSource;
    use anyhow::anyhow;

    #[test]
    fn test_edge_trigger_fires_once_per_crossing() {
        let mut t = EdgeTrigger::new(0.6);
        assert_eq!(t.update(Some(Direction::Buy), 0.5), None);
        assert_eq!(t.update(Some(Direction::Buy), 0.7), Some(Direction::Buy));
        assert_eq!(t.update(Some(Direction::Buy), 0.9), None);
        assert_eq!(t.update(Some(Direction::Sell), 0.9), Some(Direction::Sell));
        assert_eq!(t.update(Some(Direction::Sell), 0.3), None);
        assert_eq!(t.update(Some(Direction::Sell), 0.8), Some(Direction::Sell));
        assert_eq!(t.update(None, 1.0), None);
    }

    /// Errors on odd ticks, panics on the fourth, emits otherwise.
    struct Unreliable {
        n: u64,
    }

    #[async_trait]
    impl Producer for Unreliable {
        fn id(&self) -> &str {
            "unreliable"
        }

        fn category(&self) -> Option<Category> {
            None
        }

        async fn tick(&mut self, now: Timestamp) -> Result<Emission> {
            self.n += 1;
            if self.n == 4 {
                panic!("boom");
            }
            if self.n % 2 == 1 {
                return Err(anyhow!("scorer unavailable"));
            }
            let signal = Signal::new("X", Direction::Buy, SignalSource::Baseline, 0.9, now + self.n, None);
            Ok(Emission { pattern: None, signal: Some(signal) })
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sqlite").to_string_lossy().to_string();
        let cfg = EngineConfig { sqlite_path: path.clone(), ..Default::default() };
        let stats = Arc::new(EngineStats::new());
        let store = PatternStore::open(&path).unwrap();
        let wcfg = WriterConfig { capacity: 16, watermark: 8, retry: cfg.retry_config() };
        let (queue, writer) = spawn_writer(store, wcfg, stats.clone()).unwrap();
        let archive = Arc::new(PatternArchive::new(&cfg, queue, stats.clone()).unwrap());

        let (sig_tx, mut sig_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = ProducerContext { archive, signals: sig_tx, stats: stats.clone(), interval_ms: 1 };
        let handle = spawn_producer(Box::new(Unreliable { n: 0 }), ctx, stop_rx);

        // ticks 2 and 6 emit; 1, 3, 5 error; 4 panics
        let first = sig_rx.recv().await.unwrap();
        let second = sig_rx.recv().await.unwrap();
        assert_ne!(first.id, second.id);
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(stats.snapshot().producer_errors >= 4);
        writer.shutdown().await.unwrap();
    }
}
