//! Structured JSON-lines logging.
//!
//! One record per event: `ts`, `run_id`, `seq`, `lvl`, `component`, `event`,
//! `msg`, correlation keys (`asset`, `signal_id`, `pattern_id`, `team_id`)
//! lifted to the top level, and everything else under `data`.
//!
//! `LOG_LEVEL` sets the floor, `LOG_DOMAINS` (comma list or `all`) picks
//! components, and `LOG_DIR` additionally tees records into
//! `<LOG_DIR>/<run_id>/{events,trace}.jsonl`. Both filters are read once.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::metrics::StatsSnapshot;

const CORRELATION_KEYS: [&str; 4] = ["asset", "signal_id", "pattern_id", "team_id"];

// =============================================================================
// Levels and domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    const ALL: [Level; 6] = [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error, Level::Fatal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// `LOG_LEVEL`, defaulting to info when unset or unrecognized.
    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::Info)
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Level::ALL
            .into_iter()
            .find(|l| l.as_str() == wanted)
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Archive,   // acceptance, decay reads, retention
    Writer,    // durability queue
    Producer,  // discovery and baseline evaluation
    Collision, // matching and expiry
    Consensus, // ballots and verdicts
    Lifecycle, // asset transitions
    Bus,       // fan-out
    System,    // startup, shutdown, summaries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Archive => "archive",
            Domain::Writer => "writer",
            Domain::Producer => "producer",
            Domain::Collision => "collision",
            Domain::Consensus => "consensus",
            Domain::Lifecycle => "lifecycle",
            Domain::Bus => "bus",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match &logger().domains {
            None => true,
            Some(list) => list.iter().any(|d| d == self.as_str()),
        }
    }
}

// =============================================================================
// Process-wide logger
// =============================================================================

struct Logger {
    run_id: String,
    min_level: Level,
    /// None means every domain.
    domains: Option<Vec<String>>,
    seq: AtomicU64,
    files: Option<RunFiles>,
}

struct RunFiles {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

impl RunFiles {
    fn open(base: &Path, run_id: &str) -> std::io::Result<Self> {
        let dir = base.join(run_id);
        std::fs::create_dir_all(&dir)?;
        let manifest = json!({
            "run_id": run_id,
            "started": ts_now(),
            "pid": std::process::id(),
        });
        std::fs::write(dir.join("manifest.json"), manifest.to_string())?;
        Ok(Self {
            events: Mutex::new(BufWriter::new(File::create(dir.join("events.jsonl"))?)),
            trace: Mutex::new(BufWriter::new(File::create(dir.join("trace.jsonl"))?)),
        })
    }

    fn append(&self, level: Level, line: &str) {
        let target = if level <= Level::Debug { &self.trace } else { &self.events };
        if let Ok(mut w) = target.lock() {
            let _ = writeln!(w, "{}", line).and_then(|_| w.flush());
        }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("ce-{}-{}", ts_epoch_ms(), std::process::id()));
        let domains = match std::env::var("LOG_DOMAINS").as_deref() {
            Err(_) | Ok("all") => None,
            Ok(list) => Some(list.split(',').map(|d| d.trim().to_string()).collect()),
        };
        let files = std::env::var("LOG_DIR").ok().and_then(|base| {
            RunFiles::open(Path::new(&base), &run_id)
                .map_err(|e| eprintln!("log files disabled: {}", e))
                .ok()
        });
        Logger {
            run_id,
            min_level: Level::from_env(),
            domains,
            seq: AtomicU64::new(0),
            files,
        }
    })
}

fn next_seq() -> u64 {
    logger().seq.fetch_add(1, Ordering::Relaxed)
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    run_id: &'a str,
    seq: u64,
    lvl: String,
    component: &'a str,
    event: &'a str,
    msg: Value,
    #[serde(flatten)]
    correlation: Map<String, Value>,
    data: Map<String, Value>,
}

/// Pull correlation keys and `msg` out of the payload.
fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in CORRELATION_KEYS.iter().chain(std::iter::once(&"msg")) {
        if let Some(v) = fields.remove(*key) {
            top.insert((*key).to_string(), v);
        }
    }
    (top, fields)
}

pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit one record if `level` and `domain` pass the filters.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let lg = logger();
    if level < lg.min_level || !domain.is_enabled() {
        return;
    }
    let (mut correlation, data) = split_fields(fields);
    let record = Record {
        ts: ts_now(),
        run_id: &lg.run_id,
        seq: next_seq(),
        lvl: level.as_str().to_ascii_uppercase(),
        component: domain.as_str(),
        event,
        msg: correlation.remove("msg").unwrap_or_else(|| json!("")),
        correlation,
        data,
    };
    let Ok(line) = serde_json::to_string(&record) else {
        return;
    };
    if let Some(files) = &lg.files {
        files.append(level, &line);
    }
    println!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_collision(asset: &str, direction: &str, discovery_id: &str, baseline_id: &str, delta_ms: u64) {
    log(
        Level::Info,
        Domain::Collision,
        "collision",
        obj(&[
            ("asset", v_str(asset)),
            ("direction", v_str(direction)),
            ("discovery_id", v_str(discovery_id)),
            ("baseline_id", v_str(baseline_id)),
            ("delta_ms", json!(delta_ms)),
        ]),
    );
}

pub fn log_transition(asset: &str, from: &str, to: &str, trailing_pnl_pct: f64, multiplier: f64) {
    let level = if to == "hibernated" { Level::Error } else { Level::Warn };
    log(
        level,
        Domain::Lifecycle,
        "transition",
        obj(&[
            ("asset", v_str(asset)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("trailing_pnl_pct", v_num(trailing_pnl_pct)),
            ("position_multiplier", v_num(multiplier)),
        ]),
    );
}

pub fn log_decision(team_id: &str, asset: &str, outcome: &str, reason: &str, approvals: usize) {
    log(
        Level::Info,
        Domain::Consensus,
        "decision",
        obj(&[
            ("team_id", v_str(team_id)),
            ("asset", v_str(asset)),
            ("outcome", v_str(outcome)),
            ("reason", v_str(reason)),
            ("approvals", json!(approvals)),
        ]),
    );
}

pub fn log_write_dropped(operation: &str, attempts: u32, error: &str) {
    log(
        Level::Error,
        Domain::Writer,
        "write_dropped",
        obj(&[
            ("operation", v_str(operation)),
            ("attempts", json!(attempts)),
            ("error", v_str(error)),
        ]),
    );
}

pub fn log_backlog_alarm(depth: usize, watermark: usize) {
    log(
        Level::Warn,
        Domain::Writer,
        "backlog_alarm",
        obj(&[("depth", json!(depth)), ("watermark", json!(watermark))]),
    );
}

pub fn log_rejected(domain: Domain, what: &str, reason: &str) {
    log(
        Level::Warn,
        domain,
        "rejected",
        obj(&[("what", v_str(what)), ("reason", v_str(reason))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Periodic summaries
// =============================================================================

static SUMMARY_CLOCK: OnceLock<Mutex<Instant>> = OnceLock::new();

/// Emit an aggregated stats line if `interval_secs` elapsed since the last one.
pub fn tick_summary(interval_secs: u64, stats: &StatsSnapshot, backlog: usize) {
    let clock = SUMMARY_CLOCK.get_or_init(|| Mutex::new(Instant::now()));
    let due = match clock.lock() {
        Ok(mut last) => {
            if last.elapsed().as_secs() >= interval_secs {
                *last = Instant::now();
                true
            } else {
                false
            }
        }
        Err(_) => false,
    };
    if due {
        log_summary("aggregated_stats", stats, backlog);
    }
}

pub fn log_summary(event: &str, stats: &StatsSnapshot, backlog: usize) {
    let mut fields = match serde_json::to_value(stats) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.insert("backlog".to_string(), json!(backlog));
    log(Level::Info, Domain::System, event, fields);
}

// =============================================================================
// Tests
// =============================================================================
