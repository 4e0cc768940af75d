//! Data model shared by producers, detector, consensus and the archive.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Milliseconds since epoch.
pub type Timestamp = u64;

// =============================================================================
// Enumerations
// =============================================================================

/// The five fixed domains a discovery producer can specialize in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Market,
    Code,
    Logistics,
    Policy,
    Corporate,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Market,
        Category::Code,
        Category::Logistics,
        Category::Policy,
        Category::Corporate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Market => "market",
            Category::Code => "code",
            Category::Logistics => "logistics",
            Category::Policy => "policy",
            Category::Corporate => "corporate",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// Positive score is a buy, negative a sell, zero (or NaN) has no direction.
    pub fn from_score(score: f64) -> Option<Direction> {
        if score > 0.0 {
            Some(Direction::Buy)
        } else if score < 0.0 {
            Some(Direction::Sell)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Discovery,
    Baseline,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Discovery => "discovery",
            SignalSource::Baseline => "baseline",
        }
    }
}

// =============================================================================
// Patterns
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub producer_id: String,
    #[serde(default)]
    pub asset: Option<String>,
    /// Raw score on a 0-100 scale before decay.
    pub value: f64,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    pub category: Category,
    pub signal_type: String,
    pub created_at: Timestamp,
}

impl Pattern {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.producer_id.is_empty() {
            return Err(ValidationError::MissingField("producer_id"));
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFinite("value"));
        }
        if self.features.values().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite("features"));
        }
        if self.created_at == 0 {
            return Err(ValidationError::MissingField("created_at"));
        }
        Ok(())
    }
}

/// A stored pattern as seen at read time; the decay fields are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedPattern {
    pub pattern: Pattern,
    pub age_minutes: f64,
    pub decay_factor: f64,
    pub effective_value: f64,
    pub retained: bool,
}

// =============================================================================
// Signals and collisions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub asset: String,
    pub direction: Direction,
    pub source: SignalSource,
    pub confidence: f64,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub origin_pattern_id: Option<String>,
}

impl Signal {
    pub fn new(
        asset: &str,
        direction: Direction,
        source: SignalSource,
        confidence: f64,
        timestamp: Timestamp,
        origin_pattern_id: Option<String>,
    ) -> Self {
        let id = signal_id(asset, direction, source, confidence, timestamp, origin_pattern_id.as_deref());
        Self {
            id,
            asset: asset.to_string(),
            direction,
            source,
            confidence,
            timestamp,
            origin_pattern_id,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.asset.trim().is_empty() {
            return Err(ValidationError::MissingField("asset"));
        }
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if !self.confidence.is_finite() {
            return Err(ValidationError::NonFinite("confidence"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        if self.timestamp == 0 {
            return Err(ValidationError::MissingField("timestamp"));
        }
        Ok(())
    }
}

/// Content hash of a signal, so a replayed signal carries the same id.
pub fn signal_id(
    asset: &str,
    direction: Direction,
    source: SignalSource,
    confidence: f64,
    timestamp: Timestamp,
    origin_pattern_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset.as_bytes());
    hasher.update(direction.as_str().as_bytes());
    hasher.update(source.as_str().as_bytes());
    hasher.update(format!("{:.6}", confidence).as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(origin_pattern_id.unwrap_or("").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Deterministic pattern id: producer, asset scope and emission time.
pub fn pattern_id(producer_id: &str, ts: Timestamp, seq: u64) -> String {
    format!("P-{}-{}-{}", producer_id, ts, seq)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionEvent {
    pub asset: String,
    pub direction: Direction,
    pub discovery: Signal,
    pub baseline: Signal,
    pub window_ms: u64,
    pub executed_at: Timestamp,
    /// Sizing applied at execution; zero until the lifecycle book has seen it.
    #[serde(default)]
    pub position_multiplier: f64,
}

impl CollisionEvent {
    pub fn delta_ms(&self) -> u64 {
        self.discovery.timestamp.abs_diff(self.baseline.timestamp)
    }
}

// =============================================================================
// Inbound data
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub asset: String,
    pub timestamp: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl MarketTick {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.asset.trim().is_empty() {
            return Err(ValidationError::MissingField("asset"));
        }
        let prices = [self.open, self.high, self.low, self.close, self.volume];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(ValidationError::NonFinite("ohlcv"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBundle {
    pub category: Category,
    pub timestamp: Timestamp,
    pub features: BTreeMap<String, f64>,
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Prospective,
    Active,
    Probation1,
    Probation2,
    Hibernated,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Prospective => "prospective",
            Lifecycle::Active => "active",
            Lifecycle::Probation1 => "probation1",
            Lifecycle::Probation2 => "probation2",
            Lifecycle::Hibernated => "hibernated",
        }
    }

    pub fn occupies_capacity(&self) -> bool {
        matches!(self, Lifecycle::Active | Lifecycle::Probation1 | Lifecycle::Probation2)
    }

    pub fn position_multiplier(&self) -> f64 {
        match self {
            Lifecycle::Active => 1.0,
            Lifecycle::Probation1 => 0.5,
            Lifecycle::Probation2 => 0.25,
            Lifecycle::Prospective | Lifecycle::Hibernated => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetState {
    pub asset: String,
    pub lifecycle: Lifecycle,
    pub trailing_pnl_pct: f64,
    pub activated_at: Option<Timestamp>,
    pub probation_entered_at: Option<Timestamp>,
    /// Set while probation2 P&L sits below the hibernation floor.
    pub hibernation_eligible_at: Option<Timestamp>,
    pub trade_count: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub worst_pnl_pct: f64,
    /// Collisions executed while live.
    pub execution_count: u64,
    pub last_execution_at: Option<Timestamp>,
}

impl AssetState {
    pub fn new(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            lifecycle: Lifecycle::Prospective,
            trailing_pnl_pct: 0.0,
            activated_at: None,
            probation_entered_at: None,
            hibernation_eligible_at: None,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            worst_pnl_pct: 0.0,
            execution_count: 0,
            last_execution_at: None,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.win_count as f64 / self.trade_count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub asset: String,
    pub from: Lifecycle,
    pub to: Lifecycle,
    pub trailing_pnl_pct: f64,
    pub position_multiplier: f64,
    pub at: Timestamp,
}

// =============================================================================
// Consensus
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusBallot {
    pub team_id: String,
    pub voter_id: String,
    pub proposed_asset: String,
    pub confidence: f64,
    pub timestamp: Timestamp,
}

impl ConsensusBallot {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.team_id.trim().is_empty() {
            return Err(ValidationError::MissingField("team_id"));
        }
        if self.voter_id.trim().is_empty() {
            return Err(ValidationError::MissingField("voter_id"));
        }
        if self.proposed_asset.trim().is_empty() {
            return Err(ValidationError::MissingField("proposed_asset"));
        }
        if !self.confidence.is_finite() {
            return Err(ValidationError::NonFinite("confidence"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoQuorum,
    WindowLapsed,
    CapacityExhausted,
    AlreadyLive,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NoQuorum => "no_quorum",
            RejectionReason::WindowLapsed => "window_lapsed",
            RejectionReason::CapacityExhausted => "capacity_exhausted",
            RejectionReason::AlreadyLive => "already_live",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusDecision {
    pub team_id: String,
    pub asset: String,
    pub outcome: DecisionOutcome,
    pub approvals: usize,
    pub ballots: usize,
    pub decided_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_id_is_stable_for_same_content() {
        let a = Signal::new("X", Direction::Buy, SignalSource::Discovery, 0.8, 100, None);
        let b = Signal::new("X", Direction::Buy, SignalSource::Discovery, 0.8, 100, None);
        let c = Signal::new("X", Direction::Buy, SignalSource::Baseline, 0.8, 100, None);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn test_signal_validation() {
        let mut s = Signal::new("X", Direction::Sell, SignalSource::Baseline, 0.5, 10, None);
        assert!(s.validate().is_ok());
        s.confidence = 1.5;
        assert_eq!(s.validate(), Err(ValidationError::ConfidenceOutOfRange(1.5)));
        s.confidence = f64::NAN;
        assert_eq!(s.validate(), Err(ValidationError::NonFinite("confidence")));
        s.confidence = 0.5;
        s.asset = " ".to_string();
        assert_eq!(s.validate(), Err(ValidationError::MissingField("asset")));
    }

    #[test]
    fn test_lifecycle_multipliers() {
        assert_eq!(Lifecycle::Active.position_multiplier(), 1.0);
        assert_eq!(Lifecycle::Probation1.position_multiplier(), 0.5);
        assert_eq!(Lifecycle::Probation2.position_multiplier(), 0.25);
        assert_eq!(Lifecycle::Hibernated.position_multiplier(), 0.0);
        assert!(!Lifecycle::Hibernated.occupies_capacity());
        assert!(Lifecycle::Probation2.occupies_capacity());
    }

    #[test]
    fn test_category_round_trip_names() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>(), Ok(c));
        }
        assert!("finance".parse::<Category>().is_err());
    }

    #[test]
    fn test_direction_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Direction::Buy).unwrap(), "\"BUY\"");
        assert_eq!(Direction::from_score(-0.2), Some(Direction::Sell));
        assert_eq!(Direction::from_score(0.0), None);
    }

    #[test]
    fn test_win_rate() {
        let mut st = AssetState::new("X");
        assert_eq!(st.win_rate(), 0.0);
        st.trade_count = 4;
        st.win_count = 1;
        assert_eq!(st.win_rate(), 0.25);
    }
}
