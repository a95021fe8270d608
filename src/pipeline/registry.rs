//! Bookkeeping for queries that have entered a pipeline.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::result::QueryResult;

/// Marker value meaning "no query has failed".
pub(super) const NO_ERROR: u64 = u64::MAX;

/// Identifier of a query within one pipeline.
///
/// Ids start at 1, increase by one per insert and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub(super) u64);

impl QueryId {
    /// The raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub(super) struct Query {
    pub(super) id: u64,
    pub(super) sql: Arc<str>,
    pub(super) result: Option<QueryResult>,
}

/// Queries ordered by id, plus the issued range and the error marker.
///
/// `first..second` are the queries sent to the server whose results have not
/// been collected; `second..next_id` are waiting to be sent. Every id in
/// `first..next_id` is present. Entries before `first` hold a result and
/// disappear once retrieved.
#[derive(Debug)]
pub(super) struct QueryRegistry {
    queries: VecDeque<Query>,
    next_id: u64,
    pub(super) first: u64,
    pub(super) second: u64,
    pub(super) error: u64,
}

impl QueryRegistry {
    pub(super) fn new() -> Self {
        Self {
            queries: VecDeque::new(),
            next_id: 1,
            first: 1,
            second: 1,
            error: NO_ERROR,
        }
    }

    /// Append a query and return its id.
    pub(super) fn insert(&mut self, sql: &str) -> Result<QueryId> {
        if self.next_id >= NO_ERROR {
            return Err(Error::Overflow(
                "Too many queries went through pipeline".into(),
            ));
        }
        let id = self.next_id;
        self.queries.push_back(Query {
            id,
            sql: Arc::from(sql),
            result: None,
        });
        self.next_id += 1;
        Ok(QueryId(id))
    }

    /// Position one past the newest query.
    pub(super) fn end(&self) -> u64 {
        self.next_id
    }

    /// Results are outstanding on the connection.
    pub(super) fn have_pending(&self) -> bool {
        self.first != self.second
    }

    /// Number of queries not yet sent.
    pub(super) fn num_waiting(&self) -> u64 {
        self.next_id - self.second
    }

    pub(super) fn is_poisoned(&self) -> bool {
        self.error != NO_ERROR
    }

    /// Lower the error marker to `id`. It never rises except through `reset`.
    pub(super) fn set_error_at(&mut self, id: u64) {
        if id < self.error {
            self.error = id;
        }
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.queries.binary_search_by_key(&id, |q| q.id).ok()
    }

    pub(super) fn contains(&self, id: u64) -> bool {
        self.position(id).is_some()
    }

    pub(super) fn get(&self, id: u64) -> Option<&Query> {
        self.position(id).map(|pos| &self.queries[pos])
    }

    pub(super) fn get_mut(&mut self, id: u64) -> Option<&mut Query> {
        self.position(id).map(|pos| &mut self.queries[pos])
    }

    pub(super) fn remove(&mut self, id: u64) -> Option<Query> {
        self.position(id).and_then(|pos| self.queries.remove(pos))
    }

    /// Oldest query still held, retrieved or not.
    pub(super) fn oldest(&self) -> Option<u64> {
        self.queries.front().map(|q| q.id)
    }

    /// Queries with ids in `from..to`.
    pub(super) fn range(&self, from: u64, to: u64) -> impl Iterator<Item = &Query> {
        let start = self.queries.partition_point(|q| q.id < from);
        self.queries.range(start..).take_while(move |q| q.id < to)
    }

    /// Drop the queries with ids in `from..to`.
    pub(super) fn remove_range(&mut self, from: u64, to: u64) {
        let start = self.queries.partition_point(|q| q.id < from);
        let stop = self.queries.partition_point(|q| q.id < to);
        self.queries.drain(start..stop);
    }

    /// Forget every query and clear the error marker. Ids keep counting.
    pub(super) fn reset(&mut self) {
        self.queries.clear();
        self.first = self.next_id;
        self.second = self.next_id;
        self.error = NO_ERROR;
    }

    pub(super) fn len(&self) -> usize {
        self.queries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
