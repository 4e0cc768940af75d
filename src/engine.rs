//! Engine wiring: owns every component, the background tasks, and the
//! shutdown sequence.
//!
//! Tasks:
//! - detector: consumes the producer signal channel
//! - sweeper: window expiry, consensus lapses, lifecycle evaluation, retention
//! - pump: drains lifecycle transitions onto the bus, the store, and the registry
//! - writer: the single store writer (OS thread, see `reliability::writer`)

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::archive::{PatternArchive, PatternCursor};
use crate::bus::{BusEvent, ControlKind, EventBus};
use crate::collision::{CollisionDetector, SignalOutcome};
use crate::config::{now_ms, EngineConfig};
use crate::consensus::{AssetRegistrar, ConsensusEngine};
use crate::error::{EngineError, ValidationError};
use crate::lifecycle::{LifecycleConfig, LifecycleMachine, LifecycleSummary};
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::metrics::{EngineStats, StatsSnapshot};
use crate::producers::{FeatureFeeds, LinearScorerFactory, ProducerContext, ProducerRegistry, ScorerFactory};
use crate::reliability::writer::{spawn_writer, WriteQueue, WriterConfig, WriterHandle};
use crate::storage::PatternStore;
use crate::types::{
    AssetState, Category, CollisionEvent, ConsensusBallot, ConsensusDecision, FeatureBundle, Lifecycle,
    MarketTick, Signal, Timestamp, Transition,
};

struct Workers {
    detector: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    pump: JoinHandle<()>,
    writer: WriterHandle,
}

pub struct Engine {
    stats: Arc<EngineStats>,
    bus: EventBus,
    queue: WriteQueue,
    archive: Arc<PatternArchive>,
    detector: Arc<CollisionDetector>,
    consensus: Arc<ConsensusEngine>,
    lifecycle: Arc<LifecycleMachine>,
    registry: Arc<ProducerRegistry>,
    stop: watch::Sender<bool>,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Option<Workers>>,
}

impl Engine {
    /// Start with the default linear scorers.
    pub async fn start(cfg: EngineConfig) -> Result<Engine> {
        Self::start_with_scorers(cfg, Arc::new(LinearScorerFactory::default())).await
    }

    /// Validate config, open the store, and spawn every background task.
    /// Any failure here is fatal and nothing is left running.
    pub async fn start_with_scorers(cfg: EngineConfig, scorers: Arc<dyn ScorerFactory>) -> Result<Engine> {
        cfg.validate()?;
        let stats = Arc::new(EngineStats::new());

        let store = PatternStore::open(&cfg.sqlite_path)
            .with_context(|| format!("opening pattern store at {}", cfg.sqlite_path))?;
        let writer_cfg = WriterConfig {
            capacity: cfg.queue_capacity,
            watermark: cfg.backlog_watermark,
            retry: cfg.retry_config(),
        };
        let (queue, writer) = spawn_writer(store, writer_cfg, stats.clone())?;
        let archive = match PatternArchive::new(&cfg, queue.clone(), stats.clone()) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e.context("opening archive reader"));
            }
        };

        let bus = EventBus::new(cfg.bus_capacity, stats.clone());
        let detector = Arc::new(CollisionDetector::new(cfg.collision_window_ms, stats.clone()));
        let (lifecycle, outbox) = LifecycleMachine::new(LifecycleConfig::from(&cfg), stats.clone());
        let lifecycle = Arc::new(lifecycle);
        let registrar: Arc<dyn AssetRegistrar> = lifecycle.clone();
        let consensus = Arc::new(ConsensusEngine::new(&cfg, registrar, stats.clone()));

        let (sig_tx, sig_rx) = mpsc::channel(cfg.signal_channel_capacity);
        let ctx = ProducerContext {
            archive: archive.clone(),
            signals: sig_tx,
            stats: stats.clone(),
            interval_ms: cfg.eval_interval_ms,
        };
        let registry = Arc::new(ProducerRegistry::new(&cfg, ctx, Arc::new(FeatureFeeds::new()), scorers));

        let (stop, stop_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));

        let detector_task = tokio::spawn(run_detector(
            sig_rx,
            stop_rx.clone(),
            detector.clone(),
            lifecycle.clone(),
            bus.clone(),
            archive.clone(),
        ));
        let sweeper_task = tokio::spawn(run_sweeper(
            cfg.sweep_interval_ms,
            cfg.retention_sweep_secs,
            stop_rx.clone(),
            detector.clone(),
            consensus.clone(),
            lifecycle.clone(),
            archive.clone(),
            bus.clone(),
        ));
        let pump_task = tokio::spawn(run_lifecycle_pump(
            outbox,
            stop_rx,
            stopping.clone(),
            bus.clone(),
            archive.clone(),
            registry.clone(),
        ));

        log(
            Level::Info,
            Domain::System,
            "engine_started",
            obj(&[
                ("sqlite_path", v_str(&cfg.sqlite_path)),
                ("window_ms", json!(cfg.collision_window_ms)),
                ("capacity", json!(cfg.active_capacity)),
                ("team_size", json!(cfg.team_size)),
                ("quorum", json!(cfg.quorum)),
            ]),
        );
        bus.publish(BusEvent::Control {
            kind: ControlKind::Started,
            at: now_ms(),
        });

        Ok(Engine {
            stats,
            bus,
            queue,
            archive,
            detector,
            consensus,
            lifecycle,
            registry,
            stop,
            stopping,
            workers: Mutex::new(Some(Workers {
                detector: detector_task,
                sweeper: sweeper_task,
                pump: pump_task,
                writer,
            })),
        })
    }

    fn refuse_if_stopping(&self) -> Result<(), EngineError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Route a market tick to the asset's baseline producer.
    /// Returns false when the asset has no running producers.
    pub fn ingest_tick(&self, tick: MarketTick) -> Result<bool, EngineError> {
        self.refuse_if_stopping()?;
        if let Err(e) = tick.validate() {
            logging::log_rejected(Domain::Producer, "tick", &e.to_string());
            return Err(e.into());
        }
        Ok(self.registry.route_tick(tick))
    }

    /// Replace the latest bundle for the bundle's category. Producers score a
    /// given bundle timestamp once.
    pub fn ingest_features(&self, bundle: FeatureBundle) -> Result<(), EngineError> {
        self.refuse_if_stopping()?;
        let invalid = if bundle.timestamp == 0 {
            Some(ValidationError::MissingField("timestamp"))
        } else if bundle.features.values().any(|v| !v.is_finite()) {
            Some(ValidationError::NonFinite("features"))
        } else {
            None
        };
        if let Some(e) = invalid {
            logging::log_rejected(Domain::Producer, "features", &e.to_string());
            return Err(e.into());
        }
        self.registry.feeds().publish(bundle);
        Ok(())
    }

    pub fn submit_signal(&self, signal: Signal) -> Result<SignalOutcome, EngineError> {
        self.submit_signal_at(signal, now_ms())
    }

    /// Feed an externally produced signal straight into the detector.
    ///
    /// A pair that matches on an asset without a live slot is still consumed
    /// but comes back as [`SignalOutcome::NotLive`] and is never published.
    pub fn submit_signal_at(&self, signal: Signal, now: Timestamp) -> Result<SignalOutcome, EngineError> {
        if self.stopping.load(Ordering::SeqCst) {
            EngineStats::incr(&self.stats.signals_after_shutdown);
            logging::log_rejected(Domain::Collision, "signal", "shutting_down");
            return Err(EngineError::ShuttingDown);
        }
        Ok(match self.detector.on_signal(signal, now)? {
            SignalOutcome::Collided(event) => {
                match execute_collision(event, &self.lifecycle, &self.bus, &self.archive) {
                    Some(event) => SignalOutcome::Collided(event),
                    None => SignalOutcome::NotLive,
                }
            }
            other => other,
        })
    }

    pub fn cast_ballot(&self, ballot: ConsensusBallot) -> Result<Vec<ConsensusDecision>, EngineError> {
        self.cast_ballot_at(ballot, now_ms())
    }

    /// Every decision the ballot caused is published before returning.
    /// Approvals register the asset; its producers start once the pump sees
    /// the activation.
    pub fn cast_ballot_at(&self, ballot: ConsensusBallot, now: Timestamp) -> Result<Vec<ConsensusDecision>, EngineError> {
        let decisions = self.consensus.cast(ballot, now)?;
        for d in &decisions {
            self.bus.publish(BusEvent::ConsensusDecision(d.clone()));
        }
        Ok(decisions)
    }

    pub fn record_outcome(&self, asset: &str, pnl_pct: f64) -> Result<Option<Transition>, EngineError> {
        self.record_outcome_at(asset, pnl_pct, now_ms())
    }

    /// Fold a closed trade's P&L into the asset's trailing figure.
    pub fn record_outcome_at(&self, asset: &str, pnl_pct: f64, now: Timestamp) -> Result<Option<Transition>, EngineError> {
        self.refuse_if_stopping()?;
        self.lifecycle.record_outcome(asset, pnl_pct, now)
    }

    /// Archived patterns with decay applied as of now, most recent insert last.
    pub fn list_patterns(&self, category: Option<Category>, min_value: Option<f64>) -> PatternCursor {
        self.archive.list_patterns(category, min_value, now_ms())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    pub fn backlog_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Wait until everything enqueued so far has reached the store.
    pub async fn flush(&self) -> Result<()> {
        self.queue.sync().await
    }

    pub fn asset_states(&self) -> Vec<AssetState> {
        self.lifecycle.asset_states()
    }

    pub fn position_multiplier(&self, asset: &str) -> f64 {
        self.lifecycle.position_multiplier(asset)
    }

    pub fn summary(&self) -> LifecycleSummary {
        self.lifecycle.summary()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn running_assets(&self) -> Vec<String> {
        self.registry.running_assets()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown. Ingress is refused first, then producers stop,
    /// in-flight signals finish, pending transitions are persisted, and the
    /// write queue drains. Calling it twice is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let workers = match self.workers.lock() {
            Ok(mut w) => w.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(workers) = workers else {
            return Ok(());
        };
        log(Level::Info, Domain::System, "shutdown_begin", obj(&[]));

        self.stopping.store(true, Ordering::SeqCst);
        self.consensus.begin_shutdown();
        self.bus.publish(BusEvent::Control {
            kind: ControlKind::Shutdown,
            at: now_ms(),
        });
        let _ = self.stop.send(true);

        // Sweeper and pump are the only sources of producer activation.
        let _ = workers.sweeper.await;
        let _ = workers.pump.await;
        self.registry.shutdown_all().await;
        let _ = workers.detector.await;

        let backlog = self.queue.depth();
        workers.writer.shutdown().await?;
        logging::log_summary("shutdown_complete", &self.stats.snapshot(), backlog);
        Ok(())
    }
}

/// Size the collision against the lifecycle book, then hand it to the bus and
/// the collision log. Collisions on assets without a live slot stop here.
fn execute_collision(
    mut event: CollisionEvent,
    lifecycle: &LifecycleMachine,
    bus: &EventBus,
    archive: &PatternArchive,
) -> Option<CollisionEvent> {
    event.position_multiplier = lifecycle.on_collision(&event)?;
    bus.publish(BusEvent::Collision(event.clone()));
    if let Err(e) = archive.record_collision(&event) {
        logging::log_rejected(Domain::Collision, "collision_record", &e.to_string());
    }
    Some(event)
}

fn handle_signal(
    signal: Signal,
    detector: &CollisionDetector,
    lifecycle: &LifecycleMachine,
    bus: &EventBus,
    archive: &PatternArchive,
) {
    // Rejections are counted and logged by the detector itself.
    if let Ok(SignalOutcome::Collided(event)) = detector.on_signal(signal, now_ms()) {
        execute_collision(event, lifecycle, bus, archive);
    }
}

async fn run_detector(
    mut signals: mpsc::Receiver<Signal>,
    mut stop: watch::Receiver<bool>,
    detector: Arc<CollisionDetector>,
    lifecycle: Arc<LifecycleMachine>,
    bus: EventBus,
    archive: Arc<PatternArchive>,
) {
    loop {
        tokio::select! {
            maybe = signals.recv() => match maybe {
                Some(signal) => handle_signal(signal, &detector, &lifecycle, &bus, &archive),
                None => return,
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    // Finish what producers already handed over; nothing new is accepted.
    signals.close();
    let mut drained = 0u64;
    while let Some(signal) = signals.recv().await {
        handle_signal(signal, &detector, &lifecycle, &bus, &archive);
        drained += 1;
    }
    log(
        Level::Debug,
        Domain::Collision,
        "detector_drained",
        obj(&[("signals", json!(drained))]),
    );
}

#[allow(clippy::too_many_arguments)]
async fn run_sweeper(
    sweep_interval_ms: u64,
    retention_sweep_secs: u64,
    mut stop: watch::Receiver<bool>,
    detector: Arc<CollisionDetector>,
    consensus: Arc<ConsensusEngine>,
    lifecycle: Arc<LifecycleMachine>,
    archive: Arc<PatternArchive>,
    bus: EventBus,
) {
    let mut ticker = interval(Duration::from_millis(sweep_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let retention_every_ms = retention_sweep_secs.saturating_mul(1000);
    let mut last_retention = now_ms();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
        let now = now_ms();
        detector.sweep(now);
        for decision in consensus.sweep(now) {
            bus.publish(BusEvent::ConsensusDecision(decision));
        }
        lifecycle.evaluate(now);

        if retention_every_ms > 0 && now.saturating_sub(last_retention) >= retention_every_ms {
            last_retention = now;
            if let Err(e) = archive.sweep_retention(now) {
                log(
                    Level::Warn,
                    Domain::Archive,
                    "retention_failed",
                    obj(&[("error", v_str(&e.to_string()))]),
                );
            }
        }
    }
}

async fn run_lifecycle_pump(
    mut outbox: mpsc::UnboundedReceiver<Transition>,
    mut stop: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    bus: EventBus,
    archive: Arc<PatternArchive>,
    registry: Arc<ProducerRegistry>,
) {
    loop {
        tokio::select! {
            maybe = outbox.recv() => match maybe {
                Some(t) => apply_transition(t, &stopping, &bus, &archive, &registry).await,
                None => return,
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    while let Ok(t) = outbox.try_recv() {
        apply_transition(t, &stopping, &bus, &archive, &registry).await;
    }
}

async fn apply_transition(
    t: Transition,
    stopping: &AtomicBool,
    bus: &EventBus,
    archive: &PatternArchive,
    registry: &ProducerRegistry,
) {
    if let Err(e) = archive.record_transition(&t) {
        logging::log_rejected(Domain::Lifecycle, "transition_record", &e.to_string());
    }
    match t.to {
        Lifecycle::Active if t.from == Lifecycle::Prospective => {
            if !stopping.load(Ordering::SeqCst) {
                registry.activate(&t.asset);
            }
        }
        Lifecycle::Hibernated => {
            if let Err(e) = archive.retain_asset(&t.asset) {
                logging::log_rejected(Domain::Lifecycle, "retain_asset", &e.to_string());
            }
            registry.release(&t.asset).await;
        }
        _ => {}
    }
    bus.publish(BusEvent::Lifecycle(t));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, SignalSource};

    fn config(dir: &tempfile::TempDir) -> EngineConfig {
        EngineConfig {
            sqlite_path: dir.path().join("engine.sqlite").to_string_lossy().to_string(),
            sweep_interval_ms: 20,
            eval_interval_ms: 20,
            ..Default::default()
        }
    }

    fn ballot(team: &str, voter: &str, asset: &str, confidence: f64, ts: u64) -> ConsensusBallot {
        ConsensusBallot {
            team_id: team.to_string(),
            voter_id: voter.to_string(),
            proposed_asset: asset.to_string(),
            confidence,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_invalid_config_refuses_to_start() {
        let cfg = EngineConfig {
            quorum: 5,
            ..Default::default()
        };
        assert!(Engine::start(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            sqlite_path: dir.path().join("missing").join("deeper").join("x.sqlite").to_string_lossy().to_string(),
            ..Default::default()
        };
        assert!(Engine::start(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_approval_activates_producers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(config(&dir)).await.unwrap();
        let now = now_ms();
        engine.cast_ballot_at(ballot("t1", "a", "X", 0.8, now), now).unwrap();
        let decisions = engine.cast_ballot_at(ballot("t1", "b", "X", 0.75, now), now).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(engine.position_multiplier("X"), 1.0);

        for _ in 0..100 {
            if engine.running_assets() == vec!["X".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.running_assets(), vec!["X".to_string()]);
        engine.shutdown().await.unwrap();
        assert!(engine.running_assets().is_empty());
    }

    #[tokio::test]
    async fn test_ingress_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(config(&dir)).await.unwrap();
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();

        let now = now_ms();
        let signal = Signal::new("X", Direction::Buy, SignalSource::Discovery, 0.9, now, None);
        assert!(matches!(engine.submit_signal_at(signal, now), Err(EngineError::ShuttingDown)));
        assert!(matches!(
            engine.cast_ballot_at(ballot("t", "a", "X", 0.9, now), now),
            Err(EngineError::ShuttingDown)
        ));
        assert_eq!(engine.stats().signals_after_shutdown, 1);
    }

    #[tokio::test]
    async fn test_non_finite_features_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(config(&dir)).await.unwrap();
        let mut features = std::collections::BTreeMap::new();
        features.insert("f".to_string(), f64::NAN);
        let bundle = FeatureBundle {
            category: Category::Market,
            timestamp: 1,
            features,
        };
        assert!(matches!(engine.ingest_features(bundle), Err(EngineError::Validation(_))));
        let unstamped = FeatureBundle {
            category: Category::Market,
            timestamp: 0,
            features: std::collections::BTreeMap::new(),
        };
        assert!(matches!(
            engine.ingest_features(unstamped),
            Err(EngineError::Validation(ValidationError::MissingField("timestamp")))
        ));
        engine.shutdown().await.unwrap();
    }
}
