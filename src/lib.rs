//! Consensus-gated signal collision engine.
//!
//! Discovery producers mine feature bundles per asset and category, baseline
//! producers run SMA crossovers on market ticks, and a trade fires only when
//! both agree on direction within the collision window. Assets enter the
//! active set through team consensus and leave it through the P&L driven
//! lifecycle.

pub mod archive;
pub mod bus;
pub mod collision;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod producers;
pub mod reliability;
pub mod storage;
pub mod types;

pub use engine::Engine;
pub use config::EngineConfig;
