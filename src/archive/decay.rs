use crate::config::MINUTE_MS;
use crate::types::Timestamp;

/// Exponential half-life decay applied to pattern values at read time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayCurve {
    pub half_life_minutes: f64,
}

impl Default for DecayCurve {
    fn default() -> Self {
        Self { half_life_minutes: 720.0 }
    }
}

impl DecayCurve {
    pub fn new(half_life_minutes: f64) -> Self {
        Self { half_life_minutes }
    }

    /// Factor in (0, 1], non-increasing in age. Negative or NaN age counts as fresh.
    pub fn factor(&self, age_minutes: f64) -> f64 {
        let age = if age_minutes.is_nan() { 0.0 } else { age_minutes.max(0.0) };
        0.5_f64
            .powf(age / self.half_life_minutes)
            .clamp(f64::MIN_POSITIVE, 1.0)
    }

    pub fn effective_value(&self, value: f64, age_minutes: f64) -> f64 {
        value * self.factor(age_minutes)
    }
}

/// Age in fractional minutes; clock skew (created after now) yields zero.
pub fn age_minutes(created_at: Timestamp, now: Timestamp) -> f64 {
    now.saturating_sub(created_at) as f64 / MINUTE_MS as f64
}
