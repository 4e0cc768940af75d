//! Asset lifecycle state machine.
//!
//! The book behind one mutex is the only place asset state and the capacity
//! count change. Every transition is pushed to an outbox; the engine drains it
//! to publish, persist, and spawn or release producers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::consensus::AssetRegistrar;
use crate::error::{EngineError, RegistrationRejection, ValidationError};
use crate::logging::{self, Domain};
use crate::metrics::EngineStats;
use crate::types::{AssetState, CollisionEvent, Lifecycle, Timestamp, Transition};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub capacity: usize,
    pub probation1_pnl_pct: f64,
    pub probation2_pnl_pct: f64,
    pub hibernation_pnl_pct: f64,
    pub hibernation_sustain_ms: u64,
}

impl From<&EngineConfig> for LifecycleConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            capacity: cfg.active_capacity,
            probation1_pnl_pct: cfg.probation1_pnl_pct,
            probation2_pnl_pct: cfg.probation2_pnl_pct,
            hibernation_pnl_pct: cfg.hibernation_pnl_pct,
            hibernation_sustain_ms: cfg.hibernation_sustain_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleSummary {
    pub active: usize,
    pub probation1: usize,
    pub probation2: usize,
    pub hibernated: usize,
    pub occupied: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct AssetRecord {
    state: AssetState,
    /// First instant of the current uninterrupted run below the hibernation floor.
    below_floor_since: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct Book {
    assets: HashMap<String, AssetRecord>,
    occupied: usize,
}

pub struct LifecycleMachine {
    cfg: LifecycleConfig,
    book: Mutex<Book>,
    outbox: mpsc::UnboundedSender<Transition>,
    stats: Arc<EngineStats>,
}

impl LifecycleMachine {
    pub fn new(cfg: LifecycleConfig, stats: Arc<EngineStats>) -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                cfg,
                book: Mutex::new(Book::default()),
                outbox,
                stats,
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one trade outcome into the asset's trailing P&L and advance at most one level.
    pub fn record_outcome(&self, asset: &str, pnl_pct: f64, now: Timestamp) -> Result<Option<Transition>, EngineError> {
        if !pnl_pct.is_finite() {
            return Err(ValidationError::NonFinite("pnl_pct").into());
        }
        let mut book = self.lock();
        let record = book
            .assets
            .get_mut(asset)
            .ok_or_else(|| EngineError::UnknownAsset(asset.to_string()))?;
        if !record.state.lifecycle.occupies_capacity() {
            return Ok(None);
        }
        let st = &mut record.state;
        st.trailing_pnl_pct += pnl_pct;
        st.trade_count += 1;
        if pnl_pct > 0.0 {
            st.win_count += 1;
        } else if pnl_pct < 0.0 {
            st.loss_count += 1;
        }
        st.worst_pnl_pct = st.worst_pnl_pct.min(st.trailing_pnl_pct);
        Ok(self.step(&mut book, asset, now))
    }

    /// Size a collision for execution. Only assets holding a capacity slot
    /// trade; anything else gets `None` and the collision goes no further.
    pub fn on_collision(&self, event: &CollisionEvent) -> Option<f64> {
        let mut book = self.lock();
        let lifecycle = book.assets.get(&event.asset).map(|r| r.state.lifecycle);
        if !lifecycle.is_some_and(|l| l.occupies_capacity()) {
            EngineStats::incr(&self.stats.collisions_not_live);
            let state = lifecycle.map_or("unknown", |l| l.as_str());
            logging::log_rejected(Domain::Lifecycle, "collision", state);
            return None;
        }
        let st = &mut book.assets.get_mut(&event.asset)?.state;
        st.execution_count += 1;
        st.last_execution_at = Some(event.executed_at);
        Some(st.lifecycle.position_multiplier())
    }

    /// Periodic re-evaluation: one level per asset at most. Drives hibernation
    /// once the sustain period elapses without new trades.
    pub fn evaluate(&self, now: Timestamp) -> Vec<Transition> {
        let mut book = self.lock();
        let mut assets: Vec<String> = book
            .assets
            .iter()
            .filter(|(_, r)| r.state.lifecycle.occupies_capacity())
            .map(|(a, _)| a.clone())
            .collect();
        assets.sort();
        assets
            .iter()
            .filter_map(|a| self.step(&mut book, a, now))
            .collect()
    }

    fn step(&self, book: &mut Book, asset: &str, now: Timestamp) -> Option<Transition> {
        let cfg = &self.cfg;
        let record = book.assets.get_mut(asset)?;
        let pnl = record.state.trailing_pnl_pct;

        if pnl < cfg.hibernation_pnl_pct {
            let since = *record.below_floor_since.get_or_insert(now);
            record.state.hibernation_eligible_at = Some(since.saturating_add(cfg.hibernation_sustain_ms));
        } else {
            record.below_floor_since = None;
            record.state.hibernation_eligible_at = None;
        }

        let from = record.state.lifecycle;
        let to = match from {
            Lifecycle::Active if pnl < cfg.probation1_pnl_pct => Lifecycle::Probation1,
            Lifecycle::Probation1 if pnl < cfg.probation2_pnl_pct => Lifecycle::Probation2,
            Lifecycle::Probation1 if pnl >= cfg.probation1_pnl_pct => Lifecycle::Active,
            Lifecycle::Probation2
                if record
                    .state
                    .hibernation_eligible_at
                    .is_some_and(|at| now >= at) =>
            {
                Lifecycle::Hibernated
            }
            Lifecycle::Probation2 if pnl >= cfg.probation2_pnl_pct => Lifecycle::Active,
            _ => return None,
        };

        let st = &mut record.state;
        st.lifecycle = to;
        match to {
            Lifecycle::Probation1 if from == Lifecycle::Active => st.probation_entered_at = Some(now),
            Lifecycle::Active => st.probation_entered_at = None,
            _ => {}
        }
        if to == Lifecycle::Hibernated {
            book.occupied = book.occupied.saturating_sub(1);
        }
        Some(self.emit(asset, from, to, pnl, now))
    }

    fn emit(&self, asset: &str, from: Lifecycle, to: Lifecycle, pnl: f64, now: Timestamp) -> Transition {
        let t = Transition {
            asset: asset.to_string(),
            from,
            to,
            trailing_pnl_pct: pnl,
            position_multiplier: to.position_multiplier(),
            at: now,
        };
        EngineStats::incr(&self.stats.transitions);
        logging::log_transition(asset, from.as_str(), to.as_str(), pnl, t.position_multiplier);
        // The receiver only disappears once the engine is gone.
        let _ = self.outbox.send(t.clone());
        t
    }

    /// Sizing lookup for trade executors; unknown assets size to zero.
    pub fn position_multiplier(&self, asset: &str) -> f64 {
        self.lock()
            .assets
            .get(asset)
            .map(|r| r.state.lifecycle.position_multiplier())
            .unwrap_or(0.0)
    }

    pub fn state(&self, asset: &str) -> Option<AssetState> {
        self.lock().assets.get(asset).map(|r| r.state.clone())
    }

    pub fn asset_states(&self) -> Vec<AssetState> {
        let mut states: Vec<AssetState> = self.lock().assets.values().map(|r| r.state.clone()).collect();
        states.sort_by(|a, b| a.asset.cmp(&b.asset));
        states
    }

    pub fn occupied(&self) -> usize {
        self.lock().occupied
    }

    pub fn summary(&self) -> LifecycleSummary {
        let book = self.lock();
        let mut s = LifecycleSummary {
            occupied: book.occupied,
            capacity: self.cfg.capacity,
            ..Default::default()
        };
        for r in book.assets.values() {
            match r.state.lifecycle {
                Lifecycle::Active => s.active += 1,
                Lifecycle::Probation1 => s.probation1 += 1,
                Lifecycle::Probation2 => s.probation2 += 1,
                Lifecycle::Hibernated => s.hibernated += 1,
                Lifecycle::Prospective => {}
            }
        }
        s
    }
}

impl AssetRegistrar for LifecycleMachine {
    fn register(&self, asset: &str, now: Timestamp) -> Result<(), RegistrationRejection> {
        let mut book = self.lock();
        if book
            .assets
            .get(asset)
            .is_some_and(|r| r.state.lifecycle.occupies_capacity())
        {
            return Err(RegistrationRejection::AlreadyLive);
        }
        if book.occupied >= self.cfg.capacity {
            return Err(RegistrationRejection::CapacityExhausted);
        }
        // A hibernated asset that comes back starts a fresh lifecycle.
        let mut state = AssetState::new(asset);
        state.lifecycle = Lifecycle::Active;
        state.activated_at = Some(now);
        book.assets.insert(
            asset.to_string(),
            AssetRecord {
                state,
                below_floor_since: None,
            },
        );
        book.occupied += 1;
        self.emit(asset, Lifecycle::Prospective, Lifecycle::Active, 0.0, now);
        Ok(())
    }
}
