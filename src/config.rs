use std::str::FromStr;

use crate::error::EngineError;
use crate::reliability::retry::RetryConfig;

pub const MINUTE_MS: u64 = 60_000;
pub const DAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sqlite_path: String,
    /// Max |Δt| between a discovery and a baseline signal that still collide.
    pub collision_window_ms: u64,
    pub sweep_interval_ms: u64,
    pub eval_interval_ms: u64,
    pub signal_channel_capacity: usize,
    pub bus_capacity: usize,
    pub active_capacity: usize,
    pub team_size: usize,
    pub quorum: usize,
    pub approval_confidence: f64,
    pub proposal_window_ms: u64,
    pub probation1_pnl_pct: f64,
    pub probation2_pnl_pct: f64,
    pub hibernation_pnl_pct: f64,
    pub hibernation_sustain_ms: u64,
    pub decay_half_life_minutes: f64,
    pub archive_min_value: f64,
    pub retention_minutes: f64,
    pub retention_sweep_secs: u64,
    pub page_size: usize,
    pub queue_capacity: usize,
    pub backlog_watermark: usize,
    pub write_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    pub discovery_threshold: f64,
    pub baseline_threshold: f64,
    pub sma_short: usize,
    pub sma_long: usize,
    /// Relative SMA spread that maps to full baseline confidence.
    pub sma_spread_scale: f64,
    pub summary_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "./collision.sqlite".to_string(),
            collision_window_ms: 5_000,
            sweep_interval_ms: 250,
            eval_interval_ms: 1_000,
            signal_channel_capacity: 1_024,
            bus_capacity: 1_024,
            active_capacity: 15,
            team_size: 3,
            quorum: 2,
            approval_confidence: 0.70,
            proposal_window_ms: 5 * MINUTE_MS,
            probation1_pnl_pct: -5.0,
            probation2_pnl_pct: -10.0,
            hibernation_pnl_pct: -15.0,
            hibernation_sustain_ms: 90 * DAY_MS,
            decay_half_life_minutes: 720.0,
            archive_min_value: 50.0,
            retention_minutes: (90 * DAY_MS / MINUTE_MS) as f64,
            retention_sweep_secs: 3_600,
            page_size: 256,
            queue_capacity: 10_000,
            backlog_watermark: 1_000,
            write_retries: 3,
            retry_base_ms: 50,
            retry_max_ms: 2_000,
            retry_jitter: 0.3,
            discovery_threshold: 0.65,
            baseline_threshold: 0.60,
            sma_short: 10,
            sma_long: 30,
            sma_spread_scale: 0.01,
            summary_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            collision_window_ms: env_or("COLLISION_WINDOW_MS", d.collision_window_ms),
            sweep_interval_ms: env_or("SWEEP_INTERVAL_MS", d.sweep_interval_ms),
            eval_interval_ms: env_or("EVAL_INTERVAL_MS", d.eval_interval_ms),
            signal_channel_capacity: env_or("SIGNAL_CHANNEL_CAP", d.signal_channel_capacity),
            bus_capacity: env_or("BUS_CAP", d.bus_capacity),
            active_capacity: env_or("ACTIVE_CAPACITY", d.active_capacity),
            team_size: env_or("TEAM_SIZE", d.team_size),
            quorum: env_or("QUORUM", d.quorum),
            approval_confidence: env_or("APPROVAL_CONFIDENCE", d.approval_confidence),
            proposal_window_ms: env_or("PROPOSAL_WINDOW_MS", d.proposal_window_ms),
            probation1_pnl_pct: env_or("PROBATION1_PNL_PCT", d.probation1_pnl_pct),
            probation2_pnl_pct: env_or("PROBATION2_PNL_PCT", d.probation2_pnl_pct),
            hibernation_pnl_pct: env_or("HIBERNATION_PNL_PCT", d.hibernation_pnl_pct),
            hibernation_sustain_ms: env_or::<u64>("HIBERNATION_SUSTAIN_DAYS", 90) * DAY_MS,
            decay_half_life_minutes: env_or("DECAY_HALF_LIFE_MIN", d.decay_half_life_minutes),
            archive_min_value: env_or("ARCHIVE_MIN_VALUE", d.archive_min_value),
            retention_minutes: env_or("RETENTION_MIN", d.retention_minutes),
            retention_sweep_secs: env_or("RETENTION_SWEEP_SECS", d.retention_sweep_secs),
            page_size: env_or("PAGE_SIZE", d.page_size),
            queue_capacity: env_or("WRITE_QUEUE_CAP", d.queue_capacity),
            backlog_watermark: env_or("BACKLOG_WATERMARK", d.backlog_watermark),
            write_retries: env_or("WRITE_RETRIES", d.write_retries),
            retry_base_ms: env_or("RETRY_BASE_MS", d.retry_base_ms),
            retry_max_ms: env_or("RETRY_MAX_MS", d.retry_max_ms),
            retry_jitter: env_or("RETRY_JITTER", d.retry_jitter),
            discovery_threshold: env_or("DISCOVERY_TH", d.discovery_threshold),
            baseline_threshold: env_or("BASELINE_TH", d.baseline_threshold),
            sma_short: env_or("SMA_SHORT", d.sma_short),
            sma_long: env_or("SMA_LONG", d.sma_long),
            sma_spread_scale: env_or("SMA_SPREAD_SCALE", d.sma_spread_scale),
            summary_secs: env_or("SUMMARY_SECS", d.summary_secs),
        }
    }

    /// Reject configurations the engine cannot honor. Called before anything starts.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));
        if self.sqlite_path.trim().is_empty() {
            return fail("SQLITE_PATH is empty");
        }
        if self.collision_window_ms == 0 || self.sweep_interval_ms == 0 || self.eval_interval_ms == 0 {
            return fail("window and interval durations must be positive");
        }
        if self.active_capacity == 0 {
            return fail("ACTIVE_CAPACITY must be at least 1");
        }
        if self.quorum == 0 || self.quorum > self.team_size {
            return fail("QUORUM must be within 1..=TEAM_SIZE");
        }
        if !(0.0..=1.0).contains(&self.approval_confidence) {
            return fail("APPROVAL_CONFIDENCE must be within [0, 1]");
        }
        if !(self.probation1_pnl_pct > self.probation2_pnl_pct
            && self.probation2_pnl_pct > self.hibernation_pnl_pct)
        {
            return fail("P&L thresholds must satisfy probation1 > probation2 > hibernation");
        }
        if !(self.decay_half_life_minutes > 0.0) || !(self.retention_minutes > 0.0) {
            return fail("half-life and retention must be positive");
        }
        if self.queue_capacity == 0 || self.backlog_watermark >= self.queue_capacity {
            return fail("BACKLOG_WATERMARK must be below WRITE_QUEUE_CAP");
        }
        if self.sma_short == 0 || self.sma_short >= self.sma_long {
            return fail("SMA_SHORT must be positive and below SMA_LONG");
        }
        if self.page_size == 0 || self.signal_channel_capacity == 0 || self.bus_capacity == 0 {
            return fail("page size and channel capacities must be positive");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.write_retries,
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
            jitter_factor: self.retry_jitter,
        }
    }
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
