//! Synchronous PostgreSQL connection.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::Duration;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::pipeline::{Pipeline, PipelineConn};
use crate::protocol::backend::{BackendKeyData, ErrorResponse, RawMessage, msg_type};
use crate::protocol::codec::split_message;
use crate::protocol::frontend::{write_cancel_request, write_terminate};
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::action::{Action, AsyncMessage};
use crate::state::connection::ConnectionStateMachine;
use crate::state::simple_query::SimpleQueryStateMachine;

use super::stream::Stream;

const READ_CHUNK: usize = 8192;

/// How long to wait for a cancelled command before asking again.
const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Synchronous PostgreSQL connection.
///
/// Besides plain [`exec`](Self::exec) and [`query`](Self::query), a
/// connection can run a [`Pipeline`]: one simple-query round trip at a time,
/// with results pulled incrementally through [`PipelineConn`].
pub struct Conn {
    stream: Stream,
    opts: Opts,
    inbound: Vec<u8>,
    /// Bytes of `inbound` already handed to the state machines
    inbound_pos: usize,
    buffer_set: BufferSet,
    /// Command whose ReadyForQuery has not arrived yet
    active: Option<SimpleQueryStateMachine>,
    /// Results parsed but not yet handed out
    ready: VecDeque<QueryResult>,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    /// A cancel request was sent for the active command
    cancel_pending: bool,
    is_broken: bool,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let stream = Stream::connect(&opts)?;
        Self::new_with_stream(stream, opts)
    }

    /// Connect using an existing stream.
    pub fn new_with_stream(stream: Stream, opts: Opts) -> Result<Self> {
        let mut conn = Self {
            stream,
            opts,
            inbound: Vec::with_capacity(READ_CHUNK),
            inbound_pos: 0,
            buffer_set: BufferSet::new(),
            active: None,
            ready: VecDeque::new(),
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            cancel_pending: false,
            // Nothing to terminate until startup succeeds
            is_broken: true,
        };
        conn.startup()?;
        conn.is_broken = false;
        Ok(conn)
    }

    fn startup(&mut self) -> Result<()> {
        let mut state_machine = ConnectionStateMachine::new(self.opts.clone());
        let mut action = state_machine.start(&mut self.buffer_set);

        loop {
            match action {
                Action::WriteAndReadMessage => {
                    self.stream.write_all(&self.buffer_set.write_buffer)?;
                    self.stream.flush()?;
                }
                Action::ReadMessage => {}
                Action::HandleAsyncMessageAndReadMessage(msg) => self.handle_async_message(msg),
                Action::Finished => break,
                Action::ResultReady(_) => {
                    return Err(Error::Protocol("Unexpected result during startup".into()));
                }
            }
            self.read_message_blocking()?;
            action = state_machine.step(&mut self.buffer_set)?;
        }

        self.backend_key = state_machine.backend_key().copied();
        self.server_params = state_machine.server_params().to_vec();
        self.transaction_status = state_machine.transaction_status();
        tracing::debug!("connection established (backend pid {})", self.connection_id());
        Ok(())
    }

    /// Get the backend key data for query cancellation.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get the connection ID (backend process ID).
    ///
    /// Returns 0 if the backend key data is not available.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if currently in a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// Create a pipeline on this connection.
    ///
    /// The retain threshold comes from [`Opts::pipeline_retain`].
    pub fn pipeline(&mut self) -> Result<Pipeline<'_, Self>> {
        let retain = self.opts.pipeline_retain;
        let mut pipeline = Pipeline::new(self);
        pipeline.retain(retain)?;
        Ok(pipeline)
    }

    /// Create a named pipeline on this connection.
    pub fn pipeline_named(&mut self, name: &str) -> Result<Pipeline<'_, Self>> {
        let retain = self.opts.pipeline_retain;
        let mut pipeline = Pipeline::with_name(self, name);
        pipeline.retain(retain)?;
        Ok(pipeline)
    }

    /// Execute `sql` and wait for its result.
    ///
    /// The query string may hold several statements; the first failed
    /// result is returned, otherwise the last one. Results left over from an
    /// earlier batch are discarded first.
    pub fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        PipelineConn::exec(self, sql)
    }

    /// Execute `sql` and require success.
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let result = self.exec(sql)?;
        result.check_status()?;
        Ok(result)
    }

    /// Execute `sql`, require success and return the rows affected.
    pub fn query_drop(&mut self, sql: &str) -> Result<Option<u64>> {
        Ok(self.query(sql)?.rows_affected())
    }

    /// Send Terminate and close the connection.
    pub fn close(mut self) -> Result<()> {
        self.is_broken = true;
        self.buffer_set.write_buffer.clear();
        write_terminate(&mut self.buffer_set.write_buffer);
        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;
        Ok(())
    }

    fn mark_broken<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    // ========================================================================
    // Input handling
    // ========================================================================

    /// Block until at least one more byte has arrived.
    ///
    /// While a cancel is pending the request is repeated every
    /// `CANCEL_RETRY_INTERVAL`: the server ignores one that arrives before
    /// the backend has started the command.
    fn fill_blocking(&mut self) -> Result<()> {
        self.compact_inbound();
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            if !self.cancel_pending {
                break self.stream.read(&mut chunk)?;
            }
            self.stream.set_read_timeout(Some(CANCEL_RETRY_INTERVAL))?;
            let read = self.stream.read(&mut chunk);
            self.stream.set_read_timeout(None)?;
            match read {
                Ok(n) => break n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if let Err(cancel_error) = self.send_cancel() {
                        tracing::debug!("failed to repeat cancel request: {}", cancel_error);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Err(Error::ConnectionBroken);
        }
        self.inbound.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read everything the socket has without blocking.
    fn fill_available(&mut self) -> Result<()> {
        self.compact_inbound();
        self.stream.set_nonblocking(true)?;
        let mut chunk = [0u8; READ_CHUNK];
        let result = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break Err(Error::ConnectionBroken),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e.into()),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    /// Drop the bytes already consumed, ahead of a read.
    fn compact_inbound(&mut self) {
        if self.inbound_pos > 0 {
            self.inbound.drain(..self.inbound_pos);
            self.inbound_pos = 0;
        }
    }

    /// Move the next complete message from `inbound` into the buffer set.
    fn take_message(&mut self) -> Result<bool> {
        let Some((type_byte, payload, consumed)) =
            split_message(&self.inbound[self.inbound_pos..])?
        else {
            return Ok(false);
        };
        self.buffer_set.load(type_byte, payload);
        self.inbound_pos += consumed;
        Ok(true)
    }

    fn read_message_blocking(&mut self) -> Result<()> {
        while !self.take_message()? {
            self.fill_blocking()?;
        }
        Ok(())
    }

    /// Feed buffered messages to the active command.
    fn process_inbound(&mut self) -> Result<()> {
        while self.take_message()? {
            let Some(state_machine) = self.active.as_mut() else {
                self.handle_idle_message()?;
                continue;
            };

            match state_machine.step(&self.buffer_set)? {
                Action::ReadMessage => {}
                Action::ResultReady(result) => self.ready.push_back(result),
                Action::HandleAsyncMessageAndReadMessage(msg) => self.handle_async_message(msg),
                Action::Finished => {
                    self.transaction_status = state_machine.transaction_status();
                    self.active = None;
                    self.cancel_pending = false;
                }
                Action::WriteAndReadMessage => {
                    return Err(Error::Protocol("Unexpected write request".into()));
                }
            }
        }
        Ok(())
    }

    /// A message arrived while no command was running.
    fn handle_idle_message(&mut self) -> Result<()> {
        let type_byte = self.buffer_set.type_byte;
        if RawMessage::is_async_type(type_byte) {
            let msg = AsyncMessage::parse(type_byte, &self.buffer_set.read_buffer)?;
            self.handle_async_message(msg);
            return Ok(());
        }
        if type_byte == msg_type::ERROR_RESPONSE {
            // e.g. FATAL on administrator shutdown
            let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?;
            self.is_broken = true;
            return Err(error.into_error());
        }
        Err(Error::Protocol(format!(
            "Unexpected message '{}' while idle",
            type_byte as char
        )))
    }

    fn handle_async_message(&mut self, msg: AsyncMessage) {
        match msg {
            AsyncMessage::Notice(fields) => {
                tracing::debug!("server notice: {}", fields);
            }
            AsyncMessage::ParameterChanged { name, value } => {
                match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.server_params.push((name, value)),
                }
            }
            AsyncMessage::Notification { pid, channel, .. } => {
                tracing::debug!("ignoring notification on {} from pid {}", channel, pid);
            }
        }
    }

    /// Send a CancelRequest for this connection's backend over a new socket.
    fn send_cancel(&self) -> Result<()> {
        let Some(key) = self.backend_key else {
            return Err(Error::Unsupported(
                "server did not send BackendKeyData".into(),
            ));
        };

        let mut buf = Vec::with_capacity(16);
        write_cancel_request(&mut buf, key.process_id(), key.secret());

        let mut stream = Stream::connect(&self.opts)?;
        stream.write_all(&buf)?;
        stream.flush()?;
        // The server closes the cancel connection without replying
        let mut sink = [0u8; 1];
        if let Err(e) = stream.read(&mut sink) {
            tracing::debug!("cancel connection closed with error: {}", e);
        }
        tracing::debug!("sent cancel request for backend pid {}", key.process_id());
        Ok(())
    }

    fn send_query(&mut self, sql: &str) -> Result<()> {
        let mut state_machine = SimpleQueryStateMachine::new();
        state_machine.start(&mut self.buffer_set, sql);
        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;
        self.active = Some(state_machine);
        Ok(())
    }

    fn next_result(&mut self) -> Result<Option<QueryResult>> {
        loop {
            if let Some(result) = self.ready.pop_front() {
                return Ok(Some(result));
            }
            if self.active.is_none() {
                return Ok(None);
            }
            self.fill_blocking()?;
            self.process_inbound()?;
        }
    }

    fn exec_inner(&mut self, sql: &str) -> Result<QueryResult> {
        // Results nobody claimed from an abandoned batch
        let mut stale = 0usize;
        while self.next_result()?.is_some() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!("discarded {} unclaimed results", stale);
        }

        self.send_query(sql)?;

        let mut outcome: Option<QueryResult> = None;
        while let Some(result) = self.next_result()? {
            if outcome.as_ref().is_none_or(|r| r.is_ok()) {
                outcome = Some(result);
            }
        }
        outcome.ok_or_else(|| Error::Protocol("Query produced no result".into()))
    }
}

impl PipelineConn for Conn {
    fn start_exec(&mut self, sql: &str) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionBroken);
        }
        if self.active.is_some() || !self.ready.is_empty() {
            return Err(Error::InvalidUsage(
                "another command is already in progress".into(),
            ));
        }
        let result = self.send_query(sql);
        self.mark_broken(result)
    }

    fn get_result(&mut self) -> Result<Option<QueryResult>> {
        let result = self.next_result();
        self.mark_broken(result)
    }

    fn is_busy(&self) -> bool {
        self.ready.is_empty() && self.active.is_some()
    }

    fn consume_input(&mut self) -> bool {
        if self.is_broken {
            return false;
        }
        let result = self
            .fill_available()
            .and_then(|()| self.process_inbound());
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("failed to consume input: {}", e);
                self.is_broken = true;
                false
            }
        }
    }

    fn cancel_query(&mut self) -> Result<()> {
        if self.active.is_none() {
            return Ok(());
        }
        self.send_cancel()?;
        self.cancel_pending = true;
        Ok(())
    }

    fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        if self.is_broken {
            return Err(Error::ConnectionBroken);
        }
        let result = self.exec_inner(sql);
        self.mark_broken(result)
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if self.is_broken {
            return;
        }
        let mut buf = Vec::with_capacity(5);
        write_terminate(&mut buf);
        let _ = self.stream.write_all(&buf);
        let _ = self.stream.flush();
    }
}
