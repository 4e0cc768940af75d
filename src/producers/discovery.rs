use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::{EdgeTrigger, Emission, Producer};
use crate::types::{pattern_id, Category, Direction, FeatureBundle, Pattern, Signal, SignalSource, Timestamp};

/// Directional score for one feature bundle. `raw` sign is the direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub raw: f64,
    pub signal_type: String,
}

impl Score {
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_score(self.raw)
    }

    /// Squashed into [0, 1).
    pub fn confidence(&self) -> f64 {
        self.raw.abs().tanh()
    }
}

/// Feature scoring is pluggable; a model server can sit behind this.
#[async_trait]
pub trait FeatureScorer: Send + Sync {
    async fn score(&self, asset: &str, bundle: &FeatureBundle) -> Result<Score>;
}

/// Weighted sum of features. Features without an explicit weight use `default_weight`.
#[derive(Debug, Clone)]
pub struct LinearScorer {
    pub weights: BTreeMap<String, f64>,
    pub default_weight: f64,
    pub signal_type: String,
}

impl LinearScorer {
    pub fn uniform(weight: f64, signal_type: &str) -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: weight,
            signal_type: signal_type.to_string(),
        }
    }
}

#[async_trait]
impl FeatureScorer for LinearScorer {
    async fn score(&self, _asset: &str, bundle: &FeatureBundle) -> Result<Score> {
        let mut raw = 0.0;
        for (name, value) in &bundle.features {
            let w = self.weights.get(name).copied().unwrap_or(self.default_weight);
            raw += w * value;
        }
        if !raw.is_finite() {
            return Err(anyhow!("non-finite score for {} bundle", bundle.category));
        }
        Ok(Score {
            raw,
            signal_type: self.signal_type.clone(),
        })
    }
}

/// One discovery agent: a single asset seen through a single category.
pub struct DiscoveryProducer {
    id: String,
    asset: String,
    category: Category,
    scorer: Arc<dyn FeatureScorer>,
    features: watch::Receiver<Option<FeatureBundle>>,
    trigger: EdgeTrigger,
    seq: u64,
    /// Timestamp of the last bundle scored; an unchanged feed is not re-scored.
    last_bundle_at: Option<Timestamp>,
}

impl DiscoveryProducer {
    pub fn new(
        asset: &str,
        category: Category,
        scorer: Arc<dyn FeatureScorer>,
        features: watch::Receiver<Option<FeatureBundle>>,
        threshold: f64,
    ) -> Self {
        Self {
            id: format!("disc-{}-{}", asset, category),
            asset: asset.to_string(),
            category,
            scorer,
            features,
            trigger: EdgeTrigger::new(threshold),
            seq: 0,
            last_bundle_at: None,
        }
    }

    /// Score one bundle. The pattern and signal carry the bundle's own
    /// timestamp (clamped to `now`), so old feature data ages from when it was
    /// observed.
    pub async fn evaluate(&mut self, bundle: &FeatureBundle, now: Timestamp) -> Result<Emission> {
        if bundle.category != self.category {
            return Err(anyhow!(
                "{} received a {} bundle",
                self.id,
                bundle.category
            ));
        }
        let score = self.scorer.score(&self.asset, bundle).await?;
        let confidence = score.confidence();
        let Some(direction) = score.direction() else {
            self.trigger.update(None, confidence);
            return Ok(Emission::default());
        };

        let observed_at = bundle.timestamp.min(now);
        self.seq += 1;
        let pattern = Pattern {
            id: pattern_id(&self.id, observed_at, self.seq),
            producer_id: self.id.clone(),
            asset: Some(self.asset.clone()),
            value: confidence * 100.0,
            features: bundle.features.clone(),
            category: self.category,
            signal_type: score.signal_type.clone(),
            created_at: observed_at,
        };
        let signal = self.trigger.update(Some(direction), confidence).map(|d| {
            Signal::new(
                &self.asset,
                d,
                SignalSource::Discovery,
                confidence,
                observed_at,
                Some(pattern.id.clone()),
            )
        });
        Ok(Emission {
            pattern: Some(pattern),
            signal,
        })
    }
}

#[async_trait]
impl Producer for DiscoveryProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> Option<Category> {
        Some(self.category)
    }

    async fn tick(&mut self, now: Timestamp) -> Result<Emission> {
        let bundle = self.features.borrow().clone();
        match bundle {
            Some(bundle) if self.last_bundle_at != Some(bundle.timestamp) => {
                self.last_bundle_at = Some(bundle.timestamp);
                self.evaluate(&bundle, now).await
            }
            _ => Ok(Emission::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(category: Category, pairs: &[(&str, f64)]) -> FeatureBundle {
        FeatureBundle {
            category,
            timestamp: 1,
            features: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn producer(threshold: f64) -> (DiscoveryProducer, watch::Sender<Option<FeatureBundle>>) {
        let (tx, rx) = watch::channel(None);
        let scorer = Arc::new(LinearScorer::uniform(1.0, "market_linear"));
        (DiscoveryProducer::new("X", Category::Market, scorer, rx, threshold), tx)
    }

    #[tokio::test]
    async fn test_linear_scorer_uses_weights() {
        let mut scorer = LinearScorer::uniform(0.0, "t");
        scorer.weights.insert("momentum".to_string(), 2.0);
        let s = scorer
            .score("X", &bundle(Category::Market, &[("momentum", 0.5), ("noise", 9.0)]))
            .await
            .unwrap();
        assert_eq!(s.raw, 1.0);
        assert_eq!(s.direction(), Some(Direction::Buy));
        assert!((s.confidence() - 1.0_f64.tanh()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_emits_pattern_per_bundle_signal_on_edge() {
        let (mut p, tx) = producer(0.65);
        tx.send(Some(bundle(Category::Market, &[("a", 1.0)]))).unwrap();

        let first = p.tick(100).await.unwrap();
        let pattern = first.pattern.unwrap();
        assert_eq!(pattern.category, Category::Market);
        assert!((pattern.value - 1.0_f64.tanh() * 100.0).abs() < 1e-9);
        let signal = first.signal.unwrap();
        assert_eq!(signal.source, SignalSource::Discovery);
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.origin_pattern_id.as_deref(), Some(pattern.id.as_str()));

        let mut next = bundle(Category::Market, &[("a", 1.2)]);
        next.timestamp = 150;
        tx.send(Some(next)).unwrap();
        let second = p.tick(200).await.unwrap();
        assert_eq!(second.pattern.unwrap().created_at, 150);
        assert!(second.signal.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_bundle_is_scored_once() {
        let (mut p, tx) = producer(0.65);
        tx.send(Some(bundle(Category::Market, &[("a", 1.0)]))).unwrap();
        let mut patterns = Vec::new();
        for now in (1_000..=51_000).step_by(1_000) {
            if let Some(pattern) = p.tick(now).await.unwrap().pattern {
                patterns.push(pattern);
            }
        }
        assert_eq!(patterns.len(), 1);
        // Stamped with when the features were observed, not when scored.
        assert_eq!(patterns[0].created_at, 1);
    }

    #[tokio::test]
    async fn test_future_bundle_is_clamped_to_now() {
        let (mut p, _tx) = producer(0.65);
        let mut ahead = bundle(Category::Market, &[("a", 1.0)]);
        ahead.timestamp = 10_000;
        let out = p.evaluate(&ahead, 500).await.unwrap();
        assert_eq!(out.pattern.unwrap().created_at, 500);
        assert_eq!(out.signal.unwrap().timestamp, 500);
    }

    #[tokio::test]
    async fn test_weak_score_emits_no_signal() {
        let (mut p, tx) = producer(0.65);
        tx.send(Some(bundle(Category::Market, &[("a", -0.2)]))).unwrap();
        let out = p.tick(100).await.unwrap();
        assert_eq!(out.pattern.unwrap().value, 0.2_f64.tanh() * 100.0);
        assert!(out.signal.is_none());
    }

    #[tokio::test]
    async fn test_no_bundle_means_no_emission() {
        let (mut p, _tx) = producer(0.65);
        assert_eq!(p.tick(100).await.unwrap(), Emission::default());
    }

    #[tokio::test]
    async fn test_wrong_category_is_an_error() {
        let (mut p, _tx) = producer(0.65);
        assert!(p.evaluate(&bundle(Category::Code, &[("a", 1.0)]), 100).await.is_err());
    }
}
