// 🌊 Result Stream - forward-only, single-pass, releasable cursor
//
// States:
//   Active    → Exhausted on natural end
//   Active    → Failed on a store error, or on release() (StreamReleased)
//   Exhausted → Failed(StreamReleased) on release()
//   Failed    stays Failed; release() keeps the original error
//
// The store connection is only held while a page is fetched.

use crate::db::Store;
use crate::error::Error;
use crate::model::Record;
use crate::query::{CursorKey, QueryPlan};
use std::collections::VecDeque;
use tracing::warn;

struct Cursor {
    store: Store,
    plan: QueryPlan,
    page_size: u64,
    buffer: VecDeque<(Record, CursorKey)>,
    last: Option<CursorKey>,
    /// Rows still allowed by the query limit
    remaining: Option<u64>,
    /// The last fetch came back short, nothing more to read
    drained: bool,
}

impl Cursor {
    fn fetch(&mut self) -> Result<(), Error> {
        let mut size = self.page_size.max(1);
        if let Some(remaining) = self.remaining {
            size = size.min(remaining);
        }
        if size == 0 {
            self.drained = true;
            return Ok(());
        }

        let (sql, params) = self.plan.page(self.last.as_ref(), size);
        let rows = self.store.fetch_page(&sql, &params)?;

        if (rows.len() as u64) < size {
            self.drained = true;
        }
        self.buffer.extend(rows);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>, Error> {
        if self.buffer.is_empty() && !self.drained {
            self.fetch()?;
        }

        match self.buffer.pop_front() {
            Some((record, key)) => {
                self.last = Some(key);
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.drained = true;
                        self.buffer.clear();
                    }
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

enum State {
    Active(Box<Cursor>),
    Exhausted,
    Failed(Error),
}

/// Lazy stream of query records.
///
/// Implements `Iterator`; once it returns `None` it keeps returning `None`.
pub struct ResultStream {
    state: State,
}

impl ResultStream {
    /// Open a stream over `plan`. The first page is fetched right away so
    /// execution failures show up in `error()` before the first `next()`.
    pub fn open(store: Store, plan: QueryPlan, page_size: u64) -> Self {
        let mut cursor = Cursor {
            store,
            remaining: plan.limit(),
            plan,
            page_size,
            buffer: VecDeque::new(),
            last: None,
            drained: false,
        };

        match cursor.fetch() {
            Ok(()) => ResultStream {
                state: State::Active(Box::new(cursor)),
            },
            Err(err) => Self::failed(err),
        }
    }

    /// A stream with no records and no error
    pub fn empty() -> Self {
        ResultStream {
            state: State::Exhausted,
        }
    }

    /// A stream that only reports `err`
    pub fn failed(err: Error) -> Self {
        ResultStream {
            state: State::Failed(err),
        }
    }

    /// The construction or mid-stream error, or `StreamReleased` after `release()`
    pub fn error(&self) -> Option<&Error> {
        match &self.state {
            State::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, State::Failed(Error::StreamReleased))
    }

    /// Free the cursor early. Safe to call any number of times.
    pub fn release(&mut self) {
        if !matches!(self.state, State::Failed(_)) {
            self.state = State::Failed(Error::StreamReleased);
        }
    }
}

impl Iterator for ResultStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let cursor = match &mut self.state {
            State::Active(cursor) => cursor,
            State::Exhausted | State::Failed(_) => return None,
        };

        match cursor.next_record() {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                self.state = State::Exhausted;
                None
            }
            Err(err) => {
                warn!("Result stream failed mid-way: {}", err);
                self.state = State::Failed(err);
                None
            }
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Active(_) => "active",
            State::Exhausted => "exhausted",
            State::Failed(Error::StreamReleased) => "released",
            State::Failed(_) => "failed",
        };
        f.debug_struct("ResultStream").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stream() {
        let mut stream = ResultStream::empty();
        assert!(stream.next().is_none());
        assert!(stream.error().is_none());
    }

    #[test]
    fn test_failed_stream_yields_nothing() {
        let mut stream = ResultStream::failed(Error::QueryExecution("no such table".into()));
        assert!(matches!(stream.error(), Some(Error::QueryExecution(_))));
        assert!(stream.next().is_none());

        // release keeps the original error
        stream.release();
        assert!(matches!(stream.error(), Some(Error::QueryExecution(_))));
        assert!(!stream.is_released());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut stream = ResultStream::empty();
        stream.release();
        stream.release();

        assert!(stream.is_released());
        assert!(matches!(stream.error(), Some(Error::StreamReleased)));
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }
}
