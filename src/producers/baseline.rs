use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use super::{EdgeTrigger, Emission, Producer};
use crate::types::{Category, Direction, MarketTick, Signal, SignalSource, Timestamp};

/// Simple moving average with fixed window
#[derive(Debug, Clone)]
pub struct Sma {
    window: VecDeque<f64>,
    period: usize,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period,
            sum: 0.0,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        self.sum += price;
        self.window.push_back(price);
        if self.window.len() > self.period {
            self.sum -= self.window.pop_front().unwrap_or(0.0);
        }
        self.get()
    }

    pub fn get(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }
}

/// SMA crossover baseline for one asset.
///
/// Confidence is the relative short/long spread scaled so that
/// `spread_scale` maps to 1.0; the spread sign is the direction.
pub struct BaselineProducer {
    id: String,
    asset: String,
    short: Sma,
    long: Sma,
    spread_scale: f64,
    trigger: EdgeTrigger,
    ticks: mpsc::Receiver<MarketTick>,
    last_ts: Timestamp,
}

impl BaselineProducer {
    pub fn new(
        asset: &str,
        short_period: usize,
        long_period: usize,
        spread_scale: f64,
        threshold: f64,
        ticks: mpsc::Receiver<MarketTick>,
    ) -> Self {
        Self {
            id: format!("base-{}", asset),
            asset: asset.to_string(),
            short: Sma::new(short_period),
            long: Sma::new(long_period),
            spread_scale,
            trigger: EdgeTrigger::new(threshold),
            ticks,
            last_ts: 0,
        }
    }

    /// Fold one close into both averages. Out-of-order ticks are ignored.
    pub fn observe(&mut self, tick: &MarketTick) {
        if tick.timestamp <= self.last_ts {
            return;
        }
        self.last_ts = tick.timestamp;
        self.short.update(tick.close);
        self.long.update(tick.close);
    }

    /// Direction and confidence from the current averages, once warmed up.
    pub fn reading(&self) -> Result<Option<(Option<Direction>, f64)>> {
        if !self.long.is_ready() {
            return Ok(None);
        }
        let long = self.long.get();
        if !(long > 0.0) {
            return Err(anyhow!("{}: long SMA is not positive ({})", self.id, long));
        }
        let spread = (self.short.get() - long) / long;
        let confidence = (spread.abs() / self.spread_scale).min(1.0);
        Ok(Some((Direction::from_score(spread), confidence)))
    }

    pub fn evaluate(&mut self, now: Timestamp) -> Result<Option<Signal>> {
        let Some((direction, confidence)) = self.reading()? else {
            return Ok(None);
        };
        Ok(self.trigger.update(direction, confidence).map(|d| {
            Signal::new(&self.asset, d, SignalSource::Baseline, confidence, now, None)
        }))
    }
}

#[async_trait]
impl Producer for BaselineProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> Option<Category> {
        None
    }

    async fn tick(&mut self, now: Timestamp) -> Result<Emission> {
        while let Ok(tick) = self.ticks.try_recv() {
            self.observe(&tick);
        }
        Ok(Emission {
            pattern: None,
            signal: self.evaluate(now)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: u64, close: f64) -> MarketTick {
        MarketTick {
            asset: "X".to_string(),
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn producer() -> (BaselineProducer, mpsc::Sender<MarketTick>) {
        let (tx, rx) = mpsc::channel(256);
        (BaselineProducer::new("X", 3, 6, 0.01, 0.6, rx), tx)
    }

    #[test]
    fn test_sma_window() {
        let mut sma = Sma::new(3);
        sma.update(1.0);
        sma.update(2.0);
        assert!(!sma.is_ready());
        sma.update(3.0);
        assert_eq!(sma.update(4.0), 3.0);
        assert!(sma.is_ready());
    }

    #[tokio::test]
    async fn test_silent_until_warmed_up() {
        let (mut p, tx) = producer();
        for i in 1..=5 {
            tx.send(tick(i, 100.0 + i as f64)).await.unwrap();
        }
        assert_eq!(p.tick(10).await.unwrap(), Emission::default());
    }

    #[tokio::test]
    async fn test_uptrend_emits_buy_once() {
        let (mut p, tx) = producer();
        // flat then a sharp rise: short SMA pulls well above long
        for i in 1..=6 {
            tx.send(tick(i, 100.0)).await.unwrap();
        }
        for i in 7..=9 {
            tx.send(tick(i, 110.0)).await.unwrap();
        }
        let first = p.tick(50).await.unwrap().signal.unwrap();
        assert_eq!(first.direction, Direction::Buy);
        assert_eq!(first.source, SignalSource::Baseline);
        assert_eq!(first.confidence, 1.0);
        assert!(p.tick(60).await.unwrap().signal.is_none());
    }

    #[tokio::test]
    async fn test_direction_flip_rearms() {
        let (mut p, tx) = producer();
        for i in 1..=6 {
            tx.send(tick(i, 100.0)).await.unwrap();
        }
        for i in 7..=9 {
            tx.send(tick(i, 110.0)).await.unwrap();
        }
        assert!(p.tick(50).await.unwrap().signal.is_some());
        for i in 10..=14 {
            tx.send(tick(i, 80.0)).await.unwrap();
        }
        let flipped = p.tick(60).await.unwrap().signal.unwrap();
        assert_eq!(flipped.direction, Direction::Sell);
    }

    #[tokio::test]
    async fn test_non_positive_prices_are_an_error() {
        let (mut p, tx) = producer();
        for i in 1..=6 {
            tx.send(tick(i, 0.0)).await.unwrap();
        }
        assert!(p.tick(10).await.is_err());
    }

    #[test]
    fn test_out_of_order_ticks_ignored() {
        let (mut p, _tx) = producer();
        p.observe(&tick(5, 100.0));
        p.observe(&tick(4, 1.0));
        assert_eq!(p.short.get(), 100.0);
    }
}
