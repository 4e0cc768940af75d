use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration, MissedTickBehavior};

use collision_engine::bus::BusEvent;
use collision_engine::config::EngineConfig;
use collision_engine::logging::{self, log, obj, v_num, v_str, Domain, Level};
use collision_engine::types::{
    ConsensusBallot, Direction, FeatureBundle, MarketTick, Signal, SignalSource, Timestamp,
};
use collision_engine::Engine;

/// One line of stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Input {
    Tick(MarketTick),
    Features(FeatureBundle),
    Signal {
        asset: String,
        direction: Direction,
        source: SignalSource,
        confidence: f64,
        timestamp: Timestamp,
        #[serde(default)]
        origin_pattern_id: Option<String>,
    },
    Ballot(ConsensusBallot),
    Outcome { asset: String, pnl_pct: f64 },
}

fn handle_line(engine: &Engine, line: &str) {
    let input: Input = match serde_json::from_str(line) {
        Ok(i) => i,
        Err(e) => {
            logging::log_rejected(Domain::System, "input_line", &e.to_string());
            return;
        }
    };
    let result = match input {
        Input::Tick(tick) => engine.ingest_tick(tick).map(|_| ()),
        Input::Features(bundle) => engine.ingest_features(bundle),
        Input::Signal {
            asset,
            direction,
            source,
            confidence,
            timestamp,
            origin_pattern_id,
        } => {
            let signal = Signal::new(&asset, direction, source, confidence, timestamp, origin_pattern_id);
            engine.submit_signal(signal).map(|_| ())
        }
        Input::Ballot(ballot) => engine.cast_ballot(ballot).map(|_| ()),
        Input::Outcome { asset, pnl_pct } => engine.record_outcome(&asset, pnl_pct).map(|_| ()),
    };
    if let Err(e) = result {
        log(
            Level::Warn,
            Domain::System,
            "input_rejected",
            obj(&[("error", v_str(&e.to_string()))]),
        );
    }
}

fn log_bus_event(event: &BusEvent) {
    let data = match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => obj(&[]),
    };
    let mut fields = obj(&[("channel", v_str(event.channel()))]);
    fields.extend(data);
    log(Level::Info, Domain::Bus, "bus_event", fields);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = EngineConfig::from_env();
    let summary_secs = cfg.summary_secs;
    let engine = Engine::start(cfg).await?;
    let mut events = engine.subscribe();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut summary = interval(Duration::from_secs(1));
    summary.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ingested: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    ingested += 1;
                    handle_line(&engine, &line);
                }
                Ok(None) => {
                    log(Level::Info, Domain::System, "stdin_closed", obj(&[("lines", json!(ingested))]));
                    break;
                }
                Err(e) => {
                    log(Level::Error, Domain::System, "stdin_error", obj(&[("error", v_str(&e.to_string()))]));
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => log_bus_event(&event),
                Err(RecvError::Lagged(n)) => {
                    log(Level::Warn, Domain::Bus, "subscriber_lagged", obj(&[("missed", v_num(n as f64))]));
                }
                Err(RecvError::Closed) => break,
            },
            _ = summary.tick() => {
                logging::tick_summary(summary_secs, &engine.stats(), engine.backlog_depth());
            }
            _ = tokio::signal::ctrl_c() => {
                log(Level::Info, Domain::System, "interrupt", obj(&[]));
                break;
            }
        }
    }

    engine.shutdown().await?;
    let summary = engine.summary();
    log(
        Level::Info,
        Domain::System,
        "exit",
        obj(&[
            ("active", json!(summary.active)),
            ("probation1", json!(summary.probation1)),
            ("probation2", json!(summary.probation2)),
            ("hibernated", json!(summary.hibernated)),
        ]),
    );
    Ok(())
}
