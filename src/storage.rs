use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

use crate::reliability::writer::{TaskSink, WriteOp};
use crate::types::{Category, CollisionEvent, Pattern, Timestamp, Transition};

/// Embedded SQLite store. Exactly one instance (owned by the writer thread)
/// ever mutates the file; readers open their own query-only connections.
pub struct PatternStore {
    conn: Connection,
}

/// Row filter used by the paging cursor.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub category: Option<Category>,
    pub asset: Option<String>,
    pub include_retained: bool,
    pub created_before: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPattern {
    pub seq: i64,
    pub pattern: Pattern,
    pub retained: bool,
}

impl PatternStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS patterns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                producer_id TEXT NOT NULL,
                asset TEXT,
                value REAL NOT NULL,
                features TEXT NOT NULL,
                category TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retained INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_category ON patterns(category);
            CREATE INDEX IF NOT EXISTS idx_patterns_asset ON patterns(asset);
            CREATE TABLE IF NOT EXISTS collisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                direction TEXT NOT NULL,
                discovery_id TEXT NOT NULL,
                baseline_id TEXT NOT NULL,
                discovery_confidence REAL NOT NULL,
                baseline_confidence REAL NOT NULL,
                discovery_ts INTEGER NOT NULL,
                baseline_ts INTEGER NOT NULL,
                window_ms INTEGER NOT NULL,
                executed_at INTEGER NOT NULL,
                position_multiplier REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                trailing_pnl_pct REAL NOT NULL,
                position_multiplier REAL NOT NULL,
                ts INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Apply one write op as a single transaction.
    pub fn apply_op(&mut self, op: &WriteOp) -> Result<()> {
        if matches!(op, WriteOp::Barrier) {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        match op {
            WriteOp::UpsertPattern(p) => upsert_pattern(&tx, p)?,
            WriteOp::DeletePatterns { ids } => {
                let mut stmt = tx.prepare_cached("DELETE FROM patterns WHERE id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            WriteOp::MarkRetained { asset } => {
                tx.execute("UPDATE patterns SET retained = 1 WHERE asset = ?1", params![asset])?;
            }
            WriteOp::RecordCollision(event) => insert_collision(&tx, event)?,
            WriteOp::RecordTransition(t) => insert_transition(&tx, t)?,
            WriteOp::Barrier => {}
        }
        tx.commit()?;
        Ok(())
    }

    pub fn pattern_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT COUNT(*) FROM patterns")
    }

    pub fn collision_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT COUNT(*) FROM collisions")
    }

    pub fn transition_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT COUNT(*) FROM lifecycle_events")
    }

    pub fn get_pattern(&self, id: &str) -> Result<Option<StoredPattern>> {
        let found = self
            .conn
            .query_row(
                "SELECT seq, id, producer_id, asset, value, features, category, signal_type,
                        created_at, retained
                 FROM patterns WHERE id = ?1",
                params![id],
                row_to_stored,
            )
            .optional()?;
        Ok(found)
    }
}

impl TaskSink for PatternStore {
    fn apply(&mut self, op: &WriteOp) -> Result<()> {
        self.apply_op(op)
    }
}

/// Open a second connection for reads. It never writes.
pub fn open_reader(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA query_only = ON;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// One page of patterns with `seq` strictly greater than `after_seq`.
pub fn fetch_page(
    conn: &Connection,
    query: &PageQuery,
    after_seq: i64,
    limit: usize,
) -> Result<Vec<StoredPattern>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, id, producer_id, asset, value, features, category, signal_type,
                created_at, retained
         FROM patterns
         WHERE seq > ?1
           AND (?2 IS NULL OR category = ?2)
           AND (?3 IS NULL OR asset = ?3)
           AND (?4 = 1 OR retained = 0)
           AND (?5 IS NULL OR created_at < ?5)
         ORDER BY seq
         LIMIT ?6",
    )?;
    let rows = stmt.query_map(
        params![
            after_seq,
            query.category.map(|c| c.as_str()),
            query.asset.as_deref(),
            query.include_retained as i64,
            query.created_before.map(|t| t as i64),
            limit as i64,
        ],
        row_to_stored,
    )?;
    let mut page = Vec::with_capacity(limit);
    for row in rows {
        page.push(row?);
    }
    Ok(page)
}

fn upsert_pattern(conn: &Connection, p: &Pattern) -> Result<()> {
    let features = serde_json::to_string(&p.features)?;
    conn.execute(
        "INSERT INTO patterns (id, producer_id, asset, value, features, category, signal_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            producer_id = excluded.producer_id,
            asset = excluded.asset,
            value = excluded.value,
            features = excluded.features,
            category = excluded.category,
            signal_type = excluded.signal_type,
            created_at = excluded.created_at",
        params![
            p.id,
            p.producer_id,
            p.asset,
            p.value,
            features,
            p.category.as_str(),
            p.signal_type,
            p.created_at as i64
        ],
    )?;
    Ok(())
}

fn insert_collision(conn: &Connection, e: &CollisionEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO collisions (asset, direction, discovery_id, baseline_id, discovery_confidence,
                                 baseline_confidence, discovery_ts, baseline_ts, window_ms, executed_at,
                                 position_multiplier)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            e.asset,
            e.direction.as_str(),
            e.discovery.id,
            e.baseline.id,
            e.discovery.confidence,
            e.baseline.confidence,
            e.discovery.timestamp as i64,
            e.baseline.timestamp as i64,
            e.window_ms as i64,
            e.executed_at as i64,
            e.position_multiplier
        ],
    )?;
    Ok(())
}

fn insert_transition(conn: &Connection, t: &Transition) -> Result<()> {
    conn.execute(
        "INSERT INTO lifecycle_events (asset, from_state, to_state, trailing_pnl_pct, position_multiplier, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            t.asset,
            t.from.as_str(),
            t.to.as_str(),
            t.trailing_pnl_pct,
            t.position_multiplier,
            t.at as i64
        ],
    )?;
    Ok(())
}

fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredPattern> {
    let features_json: String = row.get(5)?;
    let features: BTreeMap<String, f64> = serde_json::from_str(&features_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    let category_str: String = row.get(6)?;
    let category: Category = category_str
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;
    let created_at: i64 = row.get(8)?;
    let retained: i64 = row.get(9)?;
    Ok(StoredPattern {
        seq: row.get(0)?,
        pattern: Pattern {
            id: row.get(1)?,
            producer_id: row.get(2)?,
            asset: row.get(3)?,
            value: row.get(4)?,
            features,
            category,
            signal_type: row.get(7)?,
            created_at: created_at.max(0) as u64,
        },
        retained: retained != 0,
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
    Ok(n.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Lifecycle, Signal, SignalSource};

    fn pattern(id: &str, asset: Option<&str>, category: Category, created_at: u64) -> Pattern {
        let mut features = BTreeMap::new();
        features.insert("momentum".to_string(), 0.4);
        Pattern {
            id: id.to_string(),
            producer_id: "disc-1".to_string(),
            asset: asset.map(str::to_string),
            value: 80.0,
            features,
            category,
            signal_type: "momentum".to_string(),
            created_at,
        }
    }

    fn temp_store() -> (tempfile::TempDir, String, PatternStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite").to_string_lossy().to_string();
        let store = PatternStore::open(&path).unwrap();
        (dir, path, store)
    }

    #[test]
    fn test_upsert_keeps_single_row() {
        let (_dir, _path, mut store) = temp_store();
        let mut p = pattern("p1", Some("X"), Category::Market, 1_000);
        store.apply_op(&WriteOp::UpsertPattern(p.clone())).unwrap();
        p.value = 90.0;
        store.apply_op(&WriteOp::UpsertPattern(p)).unwrap();
        assert_eq!(store.pattern_count().unwrap(), 1);
        let got = store.get_pattern("p1").unwrap().unwrap();
        assert_eq!(got.pattern.value, 90.0);
        assert_eq!(got.pattern.features.get("momentum"), Some(&0.4));
    }

    #[test]
    fn test_fetch_page_filters_and_pages() {
        let (_dir, path, mut store) = temp_store();
        for i in 0..5 {
            let cat = if i % 2 == 0 { Category::Market } else { Category::Code };
            store
                .apply_op(&WriteOp::UpsertPattern(pattern(&format!("p{}", i), Some("X"), cat, 1_000 + i)))
                .unwrap();
        }
        let reader = open_reader(&path).unwrap();
        let q = PageQuery {
            category: Some(Category::Market),
            include_retained: true,
            ..Default::default()
        };
        let first = fetch_page(&reader, &q, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = fetch_page(&reader, &q, first[1].seq, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].pattern.id, "p4");
    }

    #[test]
    fn test_mark_retained_and_exclusion() {
        let (_dir, path, mut store) = temp_store();
        store.apply_op(&WriteOp::UpsertPattern(pattern("a", Some("X"), Category::Market, 1))).unwrap();
        store.apply_op(&WriteOp::UpsertPattern(pattern("b", Some("Y"), Category::Market, 1))).unwrap();
        store.apply_op(&WriteOp::MarkRetained { asset: "X".to_string() }).unwrap();
        let reader = open_reader(&path).unwrap();
        let q = PageQuery::default();
        let page = fetch_page(&reader, &q, 0, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].pattern.id, "b");
        assert!(store.get_pattern("a").unwrap().unwrap().retained);
    }

    #[test]
    fn test_records_collisions_and_transitions() {
        let (_dir, _path, mut store) = temp_store();
        let d = Signal::new("X", Direction::Buy, SignalSource::Discovery, 0.8, 100, None);
        let b = Signal::new("X", Direction::Buy, SignalSource::Baseline, 0.7, 103, None);
        let event = CollisionEvent {
            asset: "X".to_string(),
            direction: Direction::Buy,
            discovery: d,
            baseline: b,
            window_ms: 5_000,
            executed_at: 103,
            position_multiplier: 1.0,
        };
        store.apply_op(&WriteOp::RecordCollision(event)).unwrap();
        store
            .apply_op(&WriteOp::RecordTransition(Transition {
                asset: "X".to_string(),
                from: Lifecycle::Active,
                to: Lifecycle::Probation1,
                trailing_pnl_pct: -6.0,
                position_multiplier: 0.5,
                at: 200,
            }))
            .unwrap();
        assert_eq!(store.collision_count().unwrap(), 1);
        assert_eq!(store.transition_count().unwrap(), 1);
    }

    #[test]
    fn test_reader_is_query_only() {
        let (_dir, path, _store) = temp_store();
        let reader = open_reader(&path).unwrap();
        assert!(reader.execute("DELETE FROM patterns", []).is_err());
    }
}
