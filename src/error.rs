use thiserror::Error;

/// Malformed input rejected at ingress. Never enters a buffer or the store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("`{0}` is not a finite number")]
    NonFinite(&'static str),
    #[error("timestamp {timestamp} is more than {window_ms}ms ahead of {now}")]
    FromTheFuture { timestamp: u64, now: u64, window_ms: u64 },
    #[error("team {team_id} already decided on {asset} in this window")]
    ProposalClosed { team_id: String, asset: String },
}

/// Why an approved asset could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationRejection {
    #[error("active capacity exhausted")]
    CapacityExhausted,
    #[error("asset is already live")]
    AlreadyLive,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("write queue full (capacity {0})")]
    Full(usize),
    #[error("write queue closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}
