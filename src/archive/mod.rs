//! Pattern archive: threshold gate in front of the durability queue, plus
//! decay-weighted reads and the retention sweep.

pub mod cursor;
pub mod decay;

use anyhow::Result;
use rusqlite::Connection;
use serde_json::json;
use std::sync::{Arc, Mutex};

use crate::config::{EngineConfig, MINUTE_MS};
use crate::error::{EnqueueError, ValidationError};
use crate::logging::{self, log, obj, v_num, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::reliability::writer::{WriteOp, WriteQueue};
use crate::storage::{open_reader, PageQuery};
use crate::types::{Category, CollisionEvent, Pattern, Timestamp, Transition};

pub use cursor::PatternCursor;
pub use decay::DecayCurve;

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveOutcome {
    Accepted,
    BelowThreshold { effective_value: f64 },
    /// Passed the threshold but the write queue refused it.
    Dropped(EnqueueError),
}

#[derive(Debug, Clone)]
pub struct PatternFilter {
    pub category: Option<Category>,
    pub asset: Option<String>,
    /// Compared against the decayed value, not the stored one.
    pub min_value: Option<f64>,
    pub include_retained: bool,
    pub page_size: Option<usize>,
}

impl Default for PatternFilter {
    fn default() -> Self {
        Self {
            category: None,
            asset: None,
            min_value: None,
            include_retained: true,
            page_size: None,
        }
    }
}

pub struct PatternArchive {
    queue: WriteQueue,
    reader: Arc<Mutex<Connection>>,
    curve: DecayCurve,
    min_value: f64,
    retention_ms: u64,
    page_size: usize,
    stats: Arc<EngineStats>,
}

impl PatternArchive {
    pub fn new(cfg: &EngineConfig, queue: WriteQueue, stats: Arc<EngineStats>) -> Result<Self> {
        let reader = open_reader(&cfg.sqlite_path)?;
        Ok(Self {
            queue,
            reader: Arc::new(Mutex::new(reader)),
            curve: DecayCurve::new(cfg.decay_half_life_minutes),
            min_value: cfg.archive_min_value,
            retention_ms: (cfg.retention_minutes * MINUTE_MS as f64) as u64,
            page_size: cfg.page_size,
            stats,
        })
    }

    pub fn curve(&self) -> DecayCurve {
        self.curve
    }

    /// Gate a freshly produced pattern. Only accepted patterns reach the queue.
    pub fn archive(&self, pattern: Pattern, now: Timestamp) -> Result<ArchiveOutcome, ValidationError> {
        if let Err(e) = pattern.validate() {
            EngineStats::incr(&self.stats.patterns_rejected);
            logging::log_rejected(Domain::Archive, "pattern", &e.to_string());
            return Err(e);
        }
        let age = decay::age_minutes(pattern.created_at, now);
        let effective_value = self.curve.effective_value(pattern.value, age);
        if effective_value < self.min_value {
            EngineStats::incr(&self.stats.patterns_rejected);
            log(
                Level::Debug,
                Domain::Archive,
                "below_threshold",
                obj(&[
                    ("pattern_id", v_str(&pattern.id)),
                    ("effective_value", v_num(effective_value)),
                    ("threshold", v_num(self.min_value)),
                ]),
            );
            return Ok(ArchiveOutcome::BelowThreshold { effective_value });
        }
        match self.queue.enqueue(WriteOp::UpsertPattern(pattern)) {
            Ok(()) => {
                EngineStats::incr(&self.stats.patterns_accepted);
                Ok(ArchiveOutcome::Accepted)
            }
            Err(e) => Ok(ArchiveOutcome::Dropped(e)),
        }
    }

    pub fn query(&self, filter: &PatternFilter, now: Timestamp) -> PatternCursor {
        let query = PageQuery {
            category: filter.category,
            asset: filter.asset.clone(),
            include_retained: filter.include_retained,
            created_before: None,
        };
        PatternCursor::new(
            self.reader.clone(),
            query,
            filter.min_value,
            filter.page_size.unwrap_or(self.page_size),
            self.curve,
            now,
        )
    }

    pub fn list_patterns(&self, category: Option<Category>, min_value: Option<f64>, now: Timestamp) -> PatternCursor {
        let filter = PatternFilter {
            category,
            min_value,
            ..Default::default()
        };
        self.query(&filter, now)
    }

    /// Enqueue batched deletes for every non-retained pattern past the
    /// retention ceiling. Returns how many ids were enqueued.
    pub fn sweep_retention(&self, now: Timestamp) -> Result<usize> {
        let cutoff = now.saturating_sub(self.retention_ms);
        let query = PageQuery {
            category: None,
            asset: None,
            include_retained: false,
            created_before: Some(cutoff),
        };
        let mut cursor = PatternCursor::new(self.reader.clone(), query, None, self.page_size, self.curve, now);
        let mut batch = Vec::with_capacity(self.page_size);
        let mut swept = 0usize;
        for item in cursor.by_ref() {
            batch.push(item.pattern.id);
            if batch.len() >= self.page_size {
                swept += self.flush_deletes(&mut batch)?;
            }
        }
        swept += self.flush_deletes(&mut batch)?;
        if let Some(e) = cursor.take_error() {
            return Err(e);
        }
        if swept > 0 {
            log(
                Level::Info,
                Domain::Archive,
                "retention_sweep",
                obj(&[("swept", json!(swept)), ("cutoff", json!(cutoff))]),
            );
        }
        Ok(swept)
    }

    fn flush_deletes(&self, batch: &mut Vec<String>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let ids = std::mem::take(batch);
        let n = ids.len();
        self.queue.enqueue(WriteOp::DeletePatterns { ids })?;
        EngineStats::add(&self.stats.patterns_swept, n as u64);
        Ok(n)
    }

    /// Exempt every pattern of a hibernated asset from retention.
    pub fn retain_asset(&self, asset: &str) -> Result<(), EnqueueError> {
        self.queue.enqueue(WriteOp::MarkRetained { asset: asset.to_string() })
    }

    pub fn record_collision(&self, event: &CollisionEvent) -> Result<(), EnqueueError> {
        self.queue.enqueue(WriteOp::RecordCollision(event.clone()))
    }

    pub fn record_transition(&self, transition: &Transition) -> Result<(), EnqueueError> {
        self.queue.enqueue(WriteOp::RecordTransition(transition.clone()))
    }
}
