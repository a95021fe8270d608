//! Throughput-oriented query pipeline.
//!
//! Queries inserted into a [`Pipeline`] are sent to the server in batches:
//! several statements joined into one simple-query string, so that one round
//! trip serves many queries. Results are matched back to the [`QueryId`]
//! returned by [`Pipeline::insert`].
//!
//! A batch of more than one query is prefixed with `SELECT 1`. The server
//! runs a multi-statement string as one implicit transaction, so when any
//! statement fails the whole batch is rolled back and the prefix reports the
//! failure. The pipeline then replays the batch one statement at a time to
//! find the query that actually failed. That query gets the server's error;
//! every later query fails with [`Error::PipelineAborted`] until
//! [`Pipeline::flush`].
//!
//! # Example
//!
//! ```ignore
//! let mut p = conn.pipeline()?;
//! p.retain(8)?;
//!
//! let a = p.insert("SELECT 1")?;
//! let b = p.insert("SELECT * FROM pg_nonexistent")?;
//! let c = p.insert("SELECT 2")?;
//! p.complete()?;
//!
//! assert_eq!(p.retrieve_id(a)?.one_field::<i32>()?, 1);
//! assert!(matches!(p.retrieve_id(b), Err(Error::Server(_))));
//! assert!(matches!(p.retrieve_id(c), Err(Error::PipelineAborted)));
//! ```

mod conn;
mod registry;

pub use conn::PipelineConn;
pub use registry::QueryId;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::result::QueryResult;

use registry::QueryRegistry;

/// Value selected by the batch prefix.
const DUMMY_VALUE: &str = "1";
/// Separator between statements of a batch.
const SEPARATOR: &str = "; ";

/// A queue of queries executed in batches on one connection.
///
/// The pipeline borrows the connection mutably for its whole life, so
/// nothing else can issue commands while it holds results in flight.
/// Dropping a pipeline cancels whatever it has outstanding.
pub struct Pipeline<'a, C: PipelineConn> {
    conn: &'a mut C,
    name: String,
    registry: QueryRegistry,
    /// Queries held back before a batch is sent automatically
    retain: usize,
    /// The batch in flight starts with the `SELECT 1` prefix
    dummy_pending: bool,
}

impl<'a, C: PipelineConn> Pipeline<'a, C> {
    /// Create a pipeline on `conn`.
    pub fn new(conn: &'a mut C) -> Self {
        Self::with_name(conn, "")
    }

    /// Create a named pipeline. The name shows up in logs and errors.
    pub fn with_name(conn: &'a mut C, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            registry: QueryRegistry::new(),
            retain: 0,
            dummy_pending: false,
        }
    }

    /// Name given at construction; empty for [`new`](Self::new).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if no queries are held, retrieved or not.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Number of queries held, retrieved or not.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// True once a query has failed; cleared by [`flush`](Self::flush).
    pub fn is_poisoned(&self) -> bool {
        self.registry.is_poisoned()
    }

    fn describe(&self) -> String {
        if self.name.is_empty() {
            "pipeline".to_string()
        } else {
            format!("pipeline '{}'", self.name)
        }
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Add a query.
    ///
    /// Once more than the retain threshold is waiting and the connection is
    /// idle, the waiting queries are sent as a batch.
    pub fn insert(&mut self, sql: &str) -> Result<QueryId> {
        let id = self.registry.insert(sql)?;

        if self.registry.num_waiting() > self.retain as u64 {
            if self.registry.have_pending() {
                self.receive_if_available()?;
            }
            if !self.registry.have_pending() {
                self.issue()?;
            }
        }

        Ok(id)
    }

    /// Whether query `id` has been sent and its result is still outstanding.
    pub fn is_running(&self, id: QueryId) -> Result<bool> {
        let id = self.known(id)?;
        Ok(id >= self.registry.first && id < self.registry.second && id < self.registry.error)
    }

    /// Whether the outcome of query `id` is settled.
    ///
    /// True once its result has been collected, or when an earlier failure
    /// means it will never run.
    pub fn is_finished(&self, id: QueryId) -> Result<bool> {
        let id = self.known(id)?;
        Ok(id < self.registry.first || id >= self.registry.error)
    }

    fn known(&self, id: QueryId) -> Result<u64> {
        if self.registry.contains(id.0) {
            Ok(id.0)
        } else {
            Err(Error::InvalidUsage(format!(
                "Requested status for unknown query {} in {}",
                id,
                self.describe()
            )))
        }
    }

    /// Retrieve the result of query `id`, waiting for it if necessary.
    ///
    /// The query is removed from the pipeline. A failed statement is
    /// reported as [`Error::Server`]; a query behind a failure as
    /// [`Error::PipelineAborted`].
    pub fn retrieve_id(&mut self, id: QueryId) -> Result<QueryResult> {
        let id = id.0;
        if !self.registry.contains(id) {
            return Err(Error::InvalidUsage(format!(
                "Attempt to retrieve result for unknown query {} in {}",
                id,
                self.describe()
            )));
        }
        if id >= self.registry.error {
            return Err(Error::PipelineAborted);
        }

        // Not sent yet
        if self.registry.num_waiting() > 0 && id >= self.registry.second {
            if self.registry.have_pending() {
                self.receive(self.registry.second)?;
            }
            if !self.registry.is_poisoned() {
                self.issue()?;
            }
        }

        if self.registry.have_pending() {
            if id >= self.registry.first {
                self.receive(id + 1)?;
            } else {
                self.receive_if_available()?;
            }
        }

        if id >= self.registry.error {
            return Err(Error::PipelineAborted);
        }

        // Keep the backend busy
        if self.registry.num_waiting() > 0
            && !self.registry.have_pending()
            && !self.registry.is_poisoned()
        {
            self.issue()?;
        }

        let query = self.registry.remove(id).ok_or_else(|| {
            Error::Internal(format!("query {} vanished from {}", id, self.describe()))
        })?;
        let result = query.result.ok_or_else(|| {
            Error::Internal(format!("query {} has no result in {}", id, self.describe()))
        })?;
        result.check_status()?;
        Ok(result)
    }

    /// Retrieve the oldest query still held.
    pub fn retrieve(&mut self) -> Result<(QueryId, QueryResult)> {
        let Some(id) = self.registry.oldest() else {
            return Err(Error::InvalidUsage(format!(
                "Attempt to retrieve result from empty {}",
                self.describe()
            )));
        };
        let result = self.retrieve_id(QueryId(id))?;
        Ok((QueryId(id), result))
    }

    /// Send everything and wait until every result has arrived.
    ///
    /// Results stay in the pipeline until retrieved.
    pub fn complete(&mut self) -> Result<()> {
        if self.registry.have_pending() {
            self.receive(self.registry.second)?;
        }
        if self.registry.num_waiting() > 0 && !self.registry.is_poisoned() {
            self.issue()?;
            self.receive(self.registry.end())?;
        }
        Ok(())
    }

    /// Wait for outstanding results, then forget every query and any failure.
    pub fn flush(&mut self) -> Result<()> {
        if self.registry.have_pending() {
            self.receive(self.registry.second)?;
        }
        self.registry.reset();
        self.dummy_pending = false;
        Ok(())
    }

    /// Cancel the batch in flight and drop its queries.
    ///
    /// Queries not yet sent stay in the pipeline.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.registry.have_pending() {
            return Ok(());
        }

        let cancelled = self.conn.cancel_query();
        let (first, second) = (self.registry.first, self.registry.second);
        tracing::debug!(
            "{}: cancelling queries {}..{}",
            self.describe(),
            first,
            second
        );
        self.registry.remove_range(first, second);
        self.registry.first = second;
        self.dummy_pending = false;

        // Leave the connection idle for whoever uses it next
        while self.conn.get_result()?.is_some() {}

        cancelled
    }

    /// Set how many queries may wait before a batch is sent automatically.
    ///
    /// Returns the previous threshold. If at least `retain` queries are
    /// already waiting they are sent now.
    pub fn retain(&mut self, retain: usize) -> Result<usize> {
        let old = std::mem::replace(&mut self.retain, retain);
        if self.registry.num_waiting() >= retain as u64 {
            self.resume()?;
        }
        Ok(old)
    }

    /// Collect available results and send waiting queries if the
    /// connection is idle. Never waits for the server.
    pub fn resume(&mut self) -> Result<()> {
        if self.registry.have_pending() {
            self.receive_if_available()?;
        }
        if !self.registry.have_pending() && self.registry.num_waiting() > 0 {
            self.issue()?;
            self.receive_if_available()?;
        }
        Ok(())
    }

    // ========================================================================
    // Issuing
    // ========================================================================

    fn issue(&mut self) -> Result<()> {
        // The previous batch ends with a None that has to be consumed first
        self.obtain_result(false)?;

        if self.registry.is_poisoned() {
            return Ok(());
        }

        let oldest = self.registry.second;
        let end = self.registry.end();
        let count = end - oldest;
        if count == 0 {
            return Ok(());
        }

        let prepend_dummy = count > 1;
        let mut batch = String::new();
        if prepend_dummy {
            batch.push_str("SELECT ");
            batch.push_str(DUMMY_VALUE);
            batch.push_str(SEPARATOR);
        }
        for (i, query) in self.registry.range(oldest, end).enumerate() {
            if i > 0 {
                batch.push_str(SEPARATOR);
            }
            batch.push_str(&query.sql);
        }

        if let Err(e) = self.conn.start_exec(&batch) {
            self.registry.set_error_at(0);
            return Err(if e.is_connection_broken() {
                e
            } else {
                Error::Internal(format!("{} could not send batch: {}", self.describe(), e))
            });
        }

        tracing::debug!(
            "{}: issued {} queries starting at {} (dummy: {})",
            self.describe(),
            count,
            oldest,
            prepend_dummy
        );
        self.dummy_pending = prepend_dummy;
        self.registry.first = oldest;
        self.registry.second = end;
        Ok(())
    }

    fn internal_error(&mut self, message: &str) -> Error {
        self.registry.set_error_at(0);
        Error::Internal(format!("{}: {}", self.describe(), message))
    }

    // ========================================================================
    // Collecting
    // ========================================================================

    /// Take one result off the connection and attach it to the oldest
    /// outstanding query.
    ///
    /// Returns false when the connection has no more results. That is only
    /// expected with `expect_none` or when nothing is outstanding; otherwise
    /// the outstanding queries are marked failed.
    fn obtain_result(&mut self, expect_none: bool) -> Result<bool> {
        let Some(result) = self.conn.get_result()? else {
            if self.registry.have_pending() && !expect_none {
                tracing::warn!(
                    "{}: connection ran out of results with queries {}..{} outstanding",
                    self.describe(),
                    self.registry.first,
                    self.registry.second
                );
                self.registry.set_error_at(self.registry.first);
                self.registry.second = self.registry.first;
            }
            return Ok(false);
        };

        if !self.registry.have_pending() {
            let oldest = self.registry.oldest().unwrap_or(0);
            self.registry.set_error_at(oldest);
            return Err(Error::Internal(format!(
                "{}: got more results from pipeline than there were queries",
                self.describe()
            )));
        }

        let first = self.registry.first;
        if self.registry.get(first).is_none_or(|q| q.result.is_some()) {
            return Err(self.internal_error("multiple results for one query"));
        }
        if let Some(query) = self.registry.get_mut(first) {
            query.result = Some(result);
        }
        self.registry.first += 1;
        Ok(true)
    }

    /// Collect results until query `stop` is reached or the connection has
    /// nothing more, then pick up anything else already available.
    fn receive(&mut self, stop: u64) -> Result<()> {
        if self.dummy_pending {
            self.obtain_dummy()?;
        }

        while self.obtain_result(false)? && self.registry.first != stop {}

        if self.registry.first == stop {
            self.get_further_available_results()?;
        }
        Ok(())
    }

    fn receive_if_available(&mut self) -> Result<()> {
        if !self.conn.consume_input() {
            return Err(Error::ConnectionBroken);
        }
        if self.conn.is_busy() {
            return Ok(());
        }

        if self.dummy_pending {
            self.obtain_dummy()?;
        }
        if self.registry.have_pending() {
            self.get_further_available_results()?;
        }
        Ok(())
    }

    fn get_further_available_results(&mut self) -> Result<()> {
        while !self.conn.is_busy() && self.obtain_result(false)? {
            if !self.conn.consume_input() {
                return Err(Error::ConnectionBroken);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Failure isolation
    // ========================================================================

    /// Consume the result of the `SELECT 1` prefix.
    ///
    /// If it failed, the server rolled back the whole batch. Every query of
    /// the batch is then replayed on its own until one fails.
    fn obtain_dummy(&mut self) -> Result<()> {
        self.dummy_pending = false;

        let Some(dummy) = self.conn.get_result()? else {
            return Err(self.internal_error("got no result from backend when it expected one"));
        };

        if dummy.is_ok() {
            let valid = match dummy.rows() {
                [row] => matches!(row.get_raw(0), Ok(Some(value)) if value == DUMMY_VALUE.as_bytes()),
                _ => false,
            };
            if !valid {
                return Err(self.internal_error("dummy query in pipeline returned unexpected value"));
            }
            return Ok(());
        }

        let (first, stop) = (self.registry.first, self.registry.second);
        tracing::warn!(
            "{}: batch of queries {}..{} failed, replaying one at a time",
            self.describe(),
            first,
            stop
        );

        // Provisional outcome in case the replay cannot run
        for id in first..stop {
            if let Some(query) = self.registry.get_mut(id) {
                query.result = Some(dummy.clone());
            }
        }

        self.obtain_result(true)?;
        self.registry.second = self.registry.first;

        self.replay(stop)
    }

    fn replay(&mut self, stop: u64) -> Result<()> {
        while self.registry.first != stop {
            let id = self.registry.first;
            let Some(sql) = self.registry.get(id).map(|q| Arc::clone(&q.sql)) else {
                return Err(self.internal_error("replayed query is missing"));
            };

            let outcome = self.conn.exec(&sql);
            let failed = match &outcome {
                Ok(result) => !result.is_ok(),
                Err(_) => true,
            };
            if let Ok(result) = outcome.as_ref()
                && let Some(query) = self.registry.get_mut(id)
            {
                query.result = Some(result.clone());
            }

            self.registry.first = id + 1;
            self.registry.second = id + 1;

            if failed {
                tracing::warn!("{}: query {} failed", self.describe(), id);
                self.registry.set_error_at(id + 1);
                return match outcome {
                    Err(e) if e.is_connection_broken() => Err(e),
                    Err(e) => {
                        tracing::debug!("{}: replay of query {} failed: {}", self.describe(), id, e);
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                };
            }
        }
        Ok(())
    }
}

impl<C: PipelineConn> Drop for Pipeline<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            tracing::debug!("{}: cancel on drop failed: {}", self.describe(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Pipeline behaviour against a scripted in-memory connection.

    use std::collections::VecDeque;

    use super::*;
    use crate::error::ErrorFields;
    use crate::protocol::types::oid;
    use crate::result::{Column, ResultStatus};

    /// Statements containing this fail to parse, rejecting their whole batch.
    const SYNTAX_ERROR: &str = "SELCT";
    /// Statements containing this fail when executed.
    const MISSING_TABLE: &str = "pg_nonexistent";

    /// Connection double that evaluates a tiny SQL dialect.
    ///
    /// `SELECT <int>` returns one row holding the integer, anything else
    /// completes as a command. Knobs inject the failure modes a real server or
    /// socket can produce.
    #[derive(Default)]
    struct MockConn {
        /// Results of the command in flight
        results: VecDeque<QueryResult>,
        /// A command was started and its final `None` not yet returned
        active: bool,
        /// Results of the command in flight have not reached the client
        lagging: bool,
        /// Every query string passed to `start_exec`
        batches: Vec<String>,
        /// Every query string passed to `exec`
        execs: Vec<String>,
        cancels: usize,

        /// Results only arrive through a blocking `get_result`
        slow: bool,
        reject_start: bool,
        input_broken: bool,
        exec_broken: bool,
        dummy_value: Option<&'static str>,
        extra_results: usize,
        missing_results: usize,
    }

    fn int_result(value: &str) -> QueryResult {
        QueryResult::tuples(
            vec![Column {
                name: "?column?".into(),
                type_oid: oid::INT4,
                table_oid: 0,
            }],
            vec![vec![Some(value.as_bytes().to_vec())]],
            "SELECT 1",
        )
    }

    fn server_error(code: &str, message: &str) -> QueryResult {
        QueryResult::failed(ErrorFields {
            severity: Some("ERROR".into()),
            code: Some(code.into()),
            message: Some(message.into()),
            ..Default::default()
        })
    }

    fn evaluate(statement: &str) -> QueryResult {
        if statement.contains(MISSING_TABLE) {
            return server_error("42P01", "relation \"pg_nonexistent\" does not exist");
        }
        match statement.strip_prefix("SELECT ") {
            Some(value) if value.parse::<i64>().is_ok() => int_result(value),
            _ => QueryResult::command("OK"),
        }
    }

    /// Results of a multi-statement string, as the server would send them.
    fn evaluate_batch(sql: &str) -> Vec<QueryResult> {
        if sql.contains(SYNTAX_ERROR) {
            return vec![server_error("42601", "syntax error at or near \"SELCT\"")];
        }
        let mut results = Vec::new();
        for statement in sql.split("; ") {
            let result = evaluate(statement);
            let failed = !result.is_ok();
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    impl PipelineConn for MockConn {
        fn start_exec(&mut self, sql: &str) -> Result<()> {
            if self.reject_start {
                return Err(Error::Protocol("send rejected".into()));
            }
            assert!(
                !self.active && self.results.is_empty(),
                "start_exec while a command is in progress"
            );
            self.batches.push(sql.to_string());

            let mut results = evaluate_batch(sql);
            if let Some(value) = self.dummy_value
                && sql.starts_with("SELECT 1; ")
            {
                results[0] = int_result(value);
            }
            for _ in 0..self.extra_results {
                results.push(int_result("99"));
            }
            let keep = results.len().saturating_sub(self.missing_results);
            results.truncate(keep);

            self.results = results.into();
            self.active = true;
            self.lagging = self.slow;
            Ok(())
        }

        fn get_result(&mut self) -> Result<Option<QueryResult>> {
            // Blocking read
            self.lagging = false;
            match self.results.pop_front() {
                Some(result) => Ok(Some(result)),
                None => {
                    self.active = false;
                    Ok(None)
                }
            }
        }

        fn is_busy(&self) -> bool {
            self.active && self.lagging
        }

        fn consume_input(&mut self) -> bool {
            !self.input_broken
        }

        fn cancel_query(&mut self) -> Result<()> {
            self.cancels += 1;
            if self.active {
                self.results = VecDeque::from([server_error(
                    "57014",
                    "canceling statement due to user request",
                )]);
            }
            Ok(())
        }

        fn exec(&mut self, sql: &str) -> Result<QueryResult> {
            if self.exec_broken {
                return Err(Error::ConnectionBroken);
            }
            while self.get_result()?.is_some() {}
            self.execs.push(sql.to_string());
            let results = evaluate_batch(sql);
            results
                .iter()
                .find(|r| !r.is_ok())
                .or(results.last())
                .cloned()
                .ok_or_else(|| Error::Protocol("no result".into()))
        }
    }

    fn value(result: &QueryResult) -> i64 {
        result.one_field::<i64>().unwrap()
    }

    // ============================================================================
    // Ordering and delivery
    // ============================================================================

    #[test]
    fn results_come_back_in_insertion_order() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(3).unwrap();

        let ids: Vec<QueryId> = (1..=7)
            .map(|i| p.insert(&format!("SELECT {}", i)).unwrap())
            .collect();
        p.complete().unwrap();

        for (expected, id) in (1..=7).zip(&ids) {
            assert_eq!(value(&p.retrieve_id(*id).unwrap()), expected);
        }
        assert!(p.is_empty());
    }

    #[test]
    fn retrieve_out_of_order() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();

        let a = p.insert("SELECT 10").unwrap();
        let b = p.insert("SELECT 20").unwrap();
        let c = p.insert("SELECT 30").unwrap();

        assert_eq!(value(&p.retrieve_id(c).unwrap()), 30);
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 10);
        assert_eq!(value(&p.retrieve_id(b).unwrap()), 20);
    }

    #[test]
    fn each_result_is_delivered_once() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);

        let id = p.insert("SELECT 5").unwrap();
        assert_eq!(value(&p.retrieve_id(id).unwrap()), 5);
        assert!(matches!(p.retrieve_id(id), Err(Error::InvalidUsage(_))));
        assert!(matches!(p.is_finished(id), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn retrieve_oldest() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);

        assert!(matches!(p.retrieve(), Err(Error::InvalidUsage(_))));

        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELECT 2").unwrap();
        let (id, result) = p.retrieve().unwrap();
        assert_eq!((id, value(&result)), (a, 1));
        let (id, result) = p.retrieve().unwrap();
        assert_eq!((id, value(&result)), (b, 2));
        assert!(p.retrieve().is_err());
    }

    #[test]
    fn ids_survive_flush() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);

        let a = p.insert("SELECT 1").unwrap();
        p.flush().unwrap();
        let b = p.insert("SELECT 1").unwrap();
        assert!(b > a);
        assert_eq!(b.get(), a.get() + 1);
    }

    // ============================================================================
    // Batching
    // ============================================================================

    #[test]
    fn single_query_batch_has_no_prefix() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            let id = p.insert("SELECT 7").unwrap();
            assert_eq!(value(&p.retrieve_id(id).unwrap()), 7);
        }
        assert_eq!(conn.batches, vec!["SELECT 7"]);
    }

    #[test]
    fn multi_query_batch_is_prefixed() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            p.retain(5).unwrap();
            p.insert("SELECT 1").unwrap();
            p.insert("SELECT 2").unwrap();
            p.insert("CREATE TABLE t (x int)").unwrap();
            p.complete().unwrap();
            assert_eq!(p.len(), 3);
        }
        assert_eq!(
            conn.batches,
            vec!["SELECT 1; SELECT 1; SELECT 2; CREATE TABLE t (x int)"]
        );
    }

    #[test]
    fn retain_zero_issues_every_insert() {
        let mut conn = MockConn {
            slow: true,
            ..Default::default()
        };
        {
            let mut p = Pipeline::new(&mut conn);
            let a = p.insert("SELECT 1").unwrap();
            assert!(p.is_running(a).unwrap());
            // First batch is still outstanding, so the second query waits
            let b = p.insert("SELECT 2").unwrap();
            assert!(!p.is_running(b).unwrap());
            p.complete().unwrap();
        }
        assert_eq!(conn.batches, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn retain_threshold_holds_queries_back() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            assert_eq!(p.retain(2).unwrap(), 0);

            let a = p.insert("SELECT 1").unwrap();
            p.insert("SELECT 2").unwrap();
            assert!(!p.is_running(a).unwrap());
            assert!(!p.is_finished(a).unwrap());

            // The third query crosses the threshold
            p.insert("SELECT 3").unwrap();
            assert!(p.is_running(a).unwrap());
            assert_eq!(p.retain(4).unwrap(), 2);
            p.complete().unwrap();
            assert!(p.is_finished(a).unwrap());
        }
        assert_eq!(conn.batches, vec!["SELECT 1; SELECT 1; SELECT 2; SELECT 3"]);
    }

    #[test]
    fn lowering_retain_sends_waiting_queries() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            p.retain(10).unwrap();
            let a = p.insert("SELECT 1").unwrap();
            p.insert("SELECT 2").unwrap();
            assert_eq!(p.retain(2).unwrap(), 10);
            // Sent and collected without blocking
            assert!(p.is_finished(a).unwrap());
        }
        assert_eq!(conn.batches.len(), 1);
    }

    #[test]
    fn resume_sends_without_waiting() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();
        let a = p.insert("SELECT 1").unwrap();
        p.resume().unwrap();
        assert!(p.is_finished(a).unwrap());
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);
    }

    #[test]
    fn busy_connection_is_not_waited_on() {
        let mut conn = MockConn {
            slow: true,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(1).unwrap();
        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELECT 2").unwrap();
        assert!(p.is_running(a).unwrap() && p.is_running(b).unwrap());

        // Queries inserted while a batch is outstanding wait for it
        let c = p.insert("SELECT 3").unwrap();
        let d = p.insert("SELECT 4").unwrap();
        assert!(!p.is_running(c).unwrap());

        assert_eq!(value(&p.retrieve_id(d).unwrap()), 4);
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);
        assert_eq!(value(&p.retrieve_id(b).unwrap()), 2);
        assert_eq!(value(&p.retrieve_id(c).unwrap()), 3);
    }

    // ============================================================================
    // Failure isolation
    // ============================================================================

    #[test]
    fn nonexistent_relation_scenario() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();

        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELECT * FROM pg_nonexistent").unwrap();
        let c = p.insert("SELECT 2").unwrap();
        p.complete().unwrap();

        assert!(p.is_poisoned());
        assert!(p.is_finished(c).unwrap());
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);

        let err = p.retrieve_id(b).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(err.to_string().contains("pg_nonexistent"));

        assert!(matches!(p.retrieve_id(c), Err(Error::PipelineAborted)));
        // Aborted queries stay until flushed
        assert!(matches!(p.retrieve_id(c), Err(Error::PipelineAborted)));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn rejected_batch_is_replayed_to_find_culprit() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            p.retain(10).unwrap();

            let a = p.insert("SELECT 1").unwrap();
            let b = p.insert("SELECT 2").unwrap();
            let c = p.insert("SELCT 3").unwrap();
            let d = p.insert("SELECT 4").unwrap();
            let e = p.insert("SELECT 5").unwrap();
            p.complete().unwrap();

            assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);
            assert_eq!(value(&p.retrieve_id(b).unwrap()), 2);
            assert_eq!(p.retrieve_id(c).unwrap_err().sqlstate(), Some("42601"));
            assert!(matches!(p.retrieve_id(d), Err(Error::PipelineAborted)));
            assert!(matches!(p.retrieve_id(e), Err(Error::PipelineAborted)));
        }
        // Nothing after the culprit runs
        assert_eq!(conn.execs, vec!["SELECT 1", "SELECT 2", "SELCT 3"]);
        assert_eq!(conn.batches.len(), 1);
    }

    #[test]
    fn culprit_at_end_of_batch() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();

        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELCT").unwrap();
        p.complete().unwrap();

        assert!(p.is_poisoned());
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);
        assert!(matches!(p.retrieve_id(b), Err(Error::Server(_))));
        assert!(p.is_empty());
    }

    #[test]
    fn failure_in_single_query_batch_is_not_sticky() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            let a = p.insert("SELECT * FROM pg_nonexistent").unwrap();
            assert!(matches!(p.retrieve_id(a), Err(Error::Server(_))));
            // Nothing else shared its batch
            assert!(!p.is_poisoned());

            let b = p.insert("SELECT 2").unwrap();
            assert_eq!(value(&p.retrieve_id(b).unwrap()), 2);
        }
        assert_eq!(conn.batches.len(), 2);
    }

    #[test]
    fn transport_failure_during_replay() {
        let mut conn = MockConn {
            exec_broken: true,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();

        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELCT").unwrap();
        assert!(matches!(p.complete(), Err(Error::ConnectionBroken)));

        // The first query keeps the batch's error, the rest is aborted
        assert_eq!(p.retrieve_id(a).unwrap_err().sqlstate(), Some("42601"));
        assert!(matches!(p.retrieve_id(b), Err(Error::PipelineAborted)));
    }

    // ============================================================================
    // Flush, cancel and teardown
    // ============================================================================

    #[test]
    fn flush_on_empty_pipeline() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        assert!(p.is_empty());
        p.flush().unwrap();
        p.flush().unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn flush_clears_failure() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();

        p.insert("SELECT 1").unwrap();
        p.insert("SELCT").unwrap();
        let c = p.insert("SELECT 3").unwrap();
        p.complete().unwrap();
        assert!(matches!(p.retrieve_id(c), Err(Error::PipelineAborted)));

        p.flush().unwrap();
        assert!(p.is_empty());
        assert!(!p.is_poisoned());

        let d = p.insert("SELECT 4").unwrap();
        let e = p.insert("SELECT 5").unwrap();
        assert_eq!(value(&p.retrieve_id(d).unwrap()), 4);
        assert_eq!(value(&p.retrieve_id(e).unwrap()), 5);
    }

    #[test]
    fn flush_drains_outstanding_batch() {
        let mut conn = MockConn {
            slow: true,
            ..Default::default()
        };
        {
            let mut p = Pipeline::new(&mut conn);
            p.insert("SELECT 1").unwrap();
            p.insert("SELECT 2").unwrap();
            p.flush().unwrap();
            assert!(p.is_empty());
        }
        assert!(!conn.active);
        assert_eq!(conn.cancels, 0);
    }

    #[test]
    fn cancel_drops_outstanding_queries() {
        let mut conn = MockConn {
            slow: true,
            ..Default::default()
        };
        {
            let mut p = Pipeline::new(&mut conn);
            p.retain(1).unwrap();
            let a = p.insert("SELECT 1").unwrap();
            let b = p.insert("SELECT 2").unwrap();
            let c = p.insert("SELECT 3").unwrap();

            p.cancel().unwrap();
            assert!(matches!(p.retrieve_id(a), Err(Error::InvalidUsage(_))));
            assert!(matches!(p.retrieve_id(b), Err(Error::InvalidUsage(_))));
            // Waiting queries are kept and still run
            assert_eq!(value(&p.retrieve_id(c).unwrap()), 3);
        }
        assert_eq!(conn.cancels, 1);
    }

    #[test]
    fn drop_cancels_and_leaves_connection_usable() {
        let mut conn = MockConn {
            slow: true,
            ..Default::default()
        };
        {
            let mut p = Pipeline::new(&mut conn);
            p.insert("SELECT 1").unwrap();
            p.insert("SELECT 2").unwrap();
        }
        assert_eq!(conn.cancels, 1);
        assert!(!conn.active && conn.results.is_empty());

        let result = conn.exec("SELECT 9").unwrap();
        assert_eq!(value(&result), 9);
    }

    #[test]
    fn drop_of_idle_pipeline_does_not_cancel() {
        let mut conn = MockConn::default();
        {
            let mut p = Pipeline::new(&mut conn);
            let a = p.insert("SELECT 1").unwrap();
            p.retrieve_id(a).unwrap();
        }
        assert_eq!(conn.cancels, 0);
    }

    // ============================================================================
    // Connection and protocol faults
    // ============================================================================

    #[test]
    fn rejected_send_is_internal_error() {
        let mut conn = MockConn {
            reject_start: true,
            ..Default::default()
        };
        let mut p = Pipeline::with_name(&mut conn, "loader");
        let err = p.insert("SELECT 1").unwrap_err();
        assert!(matches!(&err, Error::Internal(msg) if msg.contains("loader")));
        assert!(p.is_poisoned());
    }

    #[test]
    fn broken_input_is_reported() {
        let mut conn = MockConn {
            slow: true,
            input_broken: true,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.insert("SELECT 1").unwrap();
        assert!(matches!(p.resume(), Err(Error::ConnectionBroken)));
    }

    #[test]
    fn unexpected_dummy_value() {
        let mut conn = MockConn {
            dummy_value: Some("2"),
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();
        let a = p.insert("SELECT 1").unwrap();
        p.insert("SELECT 2").unwrap();

        assert!(matches!(p.complete(), Err(Error::Internal(_))));
        assert!(p.is_poisoned());
        assert!(matches!(p.retrieve_id(a), Err(Error::PipelineAborted)));
    }

    #[test]
    fn missing_dummy_result() {
        let mut conn = MockConn {
            missing_results: 10,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();
        p.insert("SELECT 1").unwrap();
        p.insert("SELECT 2").unwrap();
        assert!(matches!(p.complete(), Err(Error::Internal(_))));
    }

    #[test]
    fn more_results_than_queries() {
        let mut conn = MockConn {
            extra_results: 1,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        let a = p.insert("SELECT 1").unwrap();
        let err = p.retrieve_id(a).unwrap_err();
        assert!(matches!(&err, Error::Internal(msg) if msg.contains("more results")));
    }

    #[test]
    fn multiple_results_for_one_query() {
        // A rejected batch followed by a stray result
        let mut conn = MockConn {
            extra_results: 1,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();
        p.insert("SELECT 1").unwrap();
        p.insert("SELCT").unwrap();
        let err = p.complete().unwrap_err();
        assert!(matches!(&err, Error::Internal(msg) if msg.contains("multiple results")));
        assert!(p.is_poisoned());
    }

    #[test]
    fn fewer_results_than_queries() {
        let mut conn = MockConn {
            missing_results: 1,
            ..Default::default()
        };
        let mut p = Pipeline::new(&mut conn);
        p.retain(10).unwrap();
        let a = p.insert("SELECT 1").unwrap();
        let b = p.insert("SELECT 2").unwrap();
        p.complete().unwrap();

        assert!(p.is_poisoned());
        assert_eq!(value(&p.retrieve_id(a).unwrap()), 1);
        assert!(matches!(p.retrieve_id(b), Err(Error::PipelineAborted)));
    }

    #[test]
    fn command_results_pass_through() {
        let mut conn = MockConn::default();
        let mut p = Pipeline::new(&mut conn);
        let id = p.insert("CREATE TABLE t (x int)").unwrap();
        let result = p.retrieve_id(id).unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);
        assert_eq!(p.name(), "");
    }
}
