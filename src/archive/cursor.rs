use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::archive::decay::{age_minutes, DecayCurve};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::storage::{fetch_page, PageQuery, StoredPattern};
use crate::types::{ArchivedPattern, Timestamp};

/// Lazy keyset-paged walk over stored patterns.
///
/// Each page is fetched on demand, decay is applied as rows are yielded, and
/// the walk ends after the last page. It cannot be rewound; issue a new query.
pub struct PatternCursor {
    reader: Arc<Mutex<Connection>>,
    query: PageQuery,
    min_value: Option<f64>,
    page_size: usize,
    curve: DecayCurve,
    now: Timestamp,
    last_seq: i64,
    buffer: VecDeque<StoredPattern>,
    exhausted: bool,
    error: Option<anyhow::Error>,
}

impl PatternCursor {
    pub(crate) fn new(
        reader: Arc<Mutex<Connection>>,
        query: PageQuery,
        min_value: Option<f64>,
        page_size: usize,
        curve: DecayCurve,
        now: Timestamp,
    ) -> Self {
        Self {
            reader,
            query,
            min_value,
            page_size: page_size.max(1),
            curve,
            now,
            last_seq: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            error: None,
        }
    }

    /// Error that ended the walk early, if any.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    fn load_page(&mut self) -> Result<()> {
        let conn = self.reader.lock().map_err(|_| anyhow!("reader connection poisoned"))?;
        let page = fetch_page(&conn, &self.query, self.last_seq, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_seq = last.seq;
        }
        self.buffer.extend(page);
        Ok(())
    }

    fn decorate(&self, stored: StoredPattern) -> ArchivedPattern {
        let age = age_minutes(stored.pattern.created_at, self.now);
        let decay_factor = self.curve.factor(age);
        ArchivedPattern {
            effective_value: stored.pattern.value * decay_factor,
            age_minutes: age,
            decay_factor,
            retained: stored.retained,
            pattern: stored.pattern,
        }
    }
}

impl Iterator for PatternCursor {
    type Item = ArchivedPattern;

    fn next(&mut self) -> Option<ArchivedPattern> {
        loop {
            if let Some(stored) = self.buffer.pop_front() {
                let item = self.decorate(stored);
                match self.min_value {
                    Some(min) if item.effective_value < min => continue,
                    _ => return Some(item),
                }
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.load_page() {
                log(
                    Level::Error,
                    Domain::Archive,
                    "cursor_failed",
                    obj(&[("error", v_str(&e.to_string()))]),
                );
                self.exhausted = true;
                self.error = Some(e);
                return None;
            }
        }
    }
}
