//! Producer registry keyed by asset.
//!
//! Activation spawns one discovery producer per category plus one baseline
//! producer; release stops them and waits for their tasks to exit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{spawn_producer, BaselineProducer, DiscoveryProducer, FeatureScorer, LinearScorer, ProducerContext};
use crate::config::EngineConfig;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::types::{Category, FeatureBundle, MarketTick};

const TICK_BUFFER: usize = 256;

/// Builds the scorer a discovery producer will use.
pub trait ScorerFactory: Send + Sync {
    fn scorer_for(&self, asset: &str, category: Category) -> Arc<dyn FeatureScorer>;
}

/// Same weights for every asset; one signal type per category.
#[derive(Debug, Clone, Default)]
pub struct LinearScorerFactory {
    pub weights: BTreeMap<String, f64>,
}

impl ScorerFactory for LinearScorerFactory {
    fn scorer_for(&self, _asset: &str, category: Category) -> Arc<dyn FeatureScorer> {
        Arc::new(LinearScorer {
            weights: self.weights.clone(),
            default_weight: 1.0,
            signal_type: format!("{}_linear", category),
        })
    }
}

/// Latest feature bundle per category, observable by any number of producers.
pub struct FeatureFeeds {
    feeds: HashMap<Category, watch::Sender<Option<FeatureBundle>>>,
}

impl Default for FeatureFeeds {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFeeds {
    pub fn new() -> Self {
        let feeds = Category::ALL
            .iter()
            .map(|c| (*c, watch::channel(None).0))
            .collect();
        Self { feeds }
    }

    pub fn publish(&self, bundle: FeatureBundle) {
        if let Some(tx) = self.feeds.get(&bundle.category) {
            tx.send_replace(Some(bundle));
        }
    }

    pub fn subscribe(&self, category: Category) -> Option<watch::Receiver<Option<FeatureBundle>>> {
        self.feeds.get(&category).map(|tx| tx.subscribe())
    }
}

struct AssetProducers {
    stop: watch::Sender<bool>,
    ticks: mpsc::Sender<MarketTick>,
    handles: Vec<JoinHandle<()>>,
}

pub struct ProducerRegistry {
    entries: Mutex<HashMap<String, AssetProducers>>,
    ctx: ProducerContext,
    feeds: Arc<FeatureFeeds>,
    scorers: Arc<dyn ScorerFactory>,
    discovery_threshold: f64,
    baseline_threshold: f64,
    sma_short: usize,
    sma_long: usize,
    sma_spread_scale: f64,
}

impl ProducerRegistry {
    pub fn new(
        cfg: &EngineConfig,
        ctx: ProducerContext,
        feeds: Arc<FeatureFeeds>,
        scorers: Arc<dyn ScorerFactory>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ctx,
            feeds,
            scorers,
            discovery_threshold: cfg.discovery_threshold,
            baseline_threshold: cfg.baseline_threshold,
            sma_short: cfg.sma_short,
            sma_long: cfg.sma_long,
            sma_spread_scale: cfg.sma_spread_scale,
        }
    }

    /// Spawn producers for a newly active asset. Returns how many were started.
    pub fn activate(&self, asset: &str) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        if entries.contains_key(asset) {
            return 0;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);
        let mut handles = Vec::with_capacity(Category::ALL.len() + 1);

        for category in Category::ALL {
            let Some(features) = self.feeds.subscribe(category) else {
                continue;
            };
            let producer = DiscoveryProducer::new(
                asset,
                category,
                self.scorers.scorer_for(asset, category),
                features,
                self.discovery_threshold,
            );
            handles.push(spawn_producer(Box::new(producer), self.ctx.clone(), stop_rx.clone()));
        }
        let baseline = BaselineProducer::new(
            asset,
            self.sma_short,
            self.sma_long,
            self.sma_spread_scale,
            self.baseline_threshold,
            tick_rx,
        );
        handles.push(spawn_producer(Box::new(baseline), self.ctx.clone(), stop_rx));

        let started = handles.len();
        entries.insert(
            asset.to_string(),
            AssetProducers {
                stop: stop_tx,
                ticks: tick_tx,
                handles,
            },
        );
        log(
            Level::Info,
            Domain::Producer,
            "producers_spawned",
            obj(&[("asset", v_str(asset)), ("count", json!(started))]),
        );
        started
    }

    /// Stop and await every producer of `asset`. False if none were running.
    pub async fn release(&self, asset: &str) -> bool {
        let removed = match self.entries.lock() {
            Ok(mut entries) => entries.remove(asset),
            Err(_) => None,
        };
        let Some(producers) = removed else {
            return false;
        };
        stop_and_join(producers).await;
        log(
            Level::Info,
            Domain::Producer,
            "producers_released",
            obj(&[("asset", v_str(asset))]),
        );
        true
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<AssetProducers> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, p)| p).collect(),
            Err(_) => Vec::new(),
        };
        for producers in drained {
            stop_and_join(producers).await;
        }
    }

    /// Hand a tick to the asset's baseline producer. False if the asset has no producers.
    pub fn route_tick(&self, tick: MarketTick) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        let Some(producers) = entries.get(&tick.asset) else {
            return false;
        };
        if producers.ticks.try_send(tick).is_err() {
            EngineStats::incr(&self.ctx.stats.ticks_dropped);
            log(Level::Debug, Domain::Producer, "tick_dropped", obj(&[]));
        }
        true
    }

    pub fn feeds(&self) -> &FeatureFeeds {
        &self.feeds
    }

    pub fn is_running(&self, asset: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(asset))
            .unwrap_or(false)
    }

    pub fn running_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self
            .entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        assets.sort();
        assets
    }
}

async fn stop_and_join(producers: AssetProducers) {
    let _ = producers.stop.send(true);
    for handle in producers.handles {
        let _ = handle.await;
    }
}
