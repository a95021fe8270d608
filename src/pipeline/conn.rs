use crate::error::Result;
use crate::result::QueryResult;

/// The connection primitives a [`Pipeline`](super::Pipeline) drives.
///
/// The contract follows libpq's asynchronous command processing: after
/// [`start_exec`](Self::start_exec), [`get_result`](Self::get_result) yields
/// one result per statement of the query string and then `None`. A statement
/// the server rejects comes back as a failed [`QueryResult`], after which the
/// rest of the string is skipped and `None` follows.
pub trait PipelineConn {
    /// Send a query string without waiting for its results.
    ///
    /// Fails if an earlier command has not been fully consumed.
    fn start_exec(&mut self, sql: &str) -> Result<()>;

    /// Next result of the current command, blocking until one is available.
    ///
    /// Returns `None` once the command is complete, and whenever no command
    /// is running.
    fn get_result(&mut self) -> Result<Option<QueryResult>>;

    /// True if [`get_result`](Self::get_result) would block.
    fn is_busy(&self) -> bool;

    /// Read whatever input is available without blocking.
    ///
    /// Returns false if the connection is broken.
    fn consume_input(&mut self) -> bool;

    /// Ask the server to abandon the current command.
    ///
    /// Results of the command still have to be consumed.
    fn cancel_query(&mut self) -> Result<()>;

    /// Run a query string to completion and return its result.
    fn exec(&mut self, sql: &str) -> Result<QueryResult>;
}
