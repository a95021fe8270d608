//! Simple query protocol state machine.
//!
//! A query string may hold several statements. The server answers each one
//! separately and closes the round trip with a single ReadyForQuery, so the
//! machine reports one [`Action::ResultReady`] per statement before
//! [`Action::Finished`].

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::frontend::write_query;
use crate::protocol::types::TransactionStatus;
use crate::result::{Column, QueryResult, Row};

use super::action::{Action, AsyncMessage};

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    ProcessingRows,
    WaitingReady,
    Finished,
}

/// Simple query protocol state machine.
pub struct SimpleQueryStateMachine {
    state: State,
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    transaction_status: TransactionStatus,
}

impl Default for SimpleQueryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleQueryStateMachine {
    /// Create a new simple query state machine.
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// True once ReadyForQuery has been seen.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Queue the Query message in `buffer_set.write_buffer`.
    pub fn start(&mut self, buffer_set: &mut BufferSet, query: &str) -> Action {
        buffer_set.write_buffer.clear();
        write_query(&mut buffer_set.write_buffer, query);
        self.state = State::WaitingResponse;
        Action::WriteAndReadMessage
    }

    /// Process the message held in `buffer_set`.
    pub fn step(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = buffer_set.read_buffer.as_slice();

        if RawMessage::is_async_type(type_byte) {
            let msg = AsyncMessage::parse(type_byte, payload)?;
            return Ok(Action::HandleAsyncMessageAndReadMessage(msg));
        }

        // The server skips the remaining statements and goes straight to
        // ReadyForQuery. Partial rows are discarded.
        if type_byte == msg_type::ERROR_RESPONSE
            && matches!(self.state, State::WaitingResponse | State::ProcessingRows)
        {
            let error = ErrorResponse::parse(payload)?;
            self.rows.clear();
            self.state = State::WaitingReady;
            return Ok(Action::ResultReady(QueryResult::failed(error.fields)));
        }

        match self.state {
            State::WaitingResponse => self.handle_response(type_byte, payload),
            State::ProcessingRows => self.handle_rows(type_byte, payload),
            State::WaitingReady => self.handle_ready(type_byte, payload),
            _ => Err(Error::Protocol(format!(
                "Unexpected message '{}' in state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn handle_response(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(payload)?;
                self.columns = desc
                    .fields()
                    .iter()
                    .map(|field| Column {
                        name: field.name.to_string(),
                        type_oid: field.type_oid(),
                        table_oid: field.table_oid(),
                    })
                    .collect();
                self.rows.clear();
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                Ok(Action::ResultReady(QueryResult::command(complete.tag)))
            }
            msg_type::EMPTY_QUERY_RESPONSE => Ok(Action::ResultReady(QueryResult::empty_query())),
            msg_type::READY_FOR_QUERY => self.handle_ready(type_byte, payload),
            msg_type::COPY_IN_RESPONSE | msg_type::COPY_OUT_RESPONSE => Err(Error::Unsupported(
                "COPY is not supported by the simple query path".into(),
            )),
            _ => Err(Error::Protocol(format!(
                "Unexpected message in query response: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_rows(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match type_byte {
            msg_type::DATA_ROW => {
                let row = DataRow::parse(payload)?;
                if row.len() != self.columns.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} values for {} columns",
                        row.len(),
                        self.columns.len()
                    )));
                }
                let values = row
                    .values()?
                    .into_iter()
                    .map(|v| v.map(Box::from))
                    .collect();
                self.rows.push(Row::new(&self.columns, values));
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                let columns = std::mem::replace(&mut self.columns, Arc::from(Vec::new()));
                let rows = std::mem::take(&mut self.rows);
                // More statements may follow in a multi-statement query
                self.state = State::WaitingResponse;
                Ok(Action::ResultReady(QueryResult::with_rows(
                    columns,
                    rows,
                    complete.tag.to_string(),
                )))
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected message in row processing: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_ready(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte != msg_type::READY_FOR_QUERY {
            return Err(Error::Protocol(format!(
                "Expected ReadyForQuery, got '{}'",
                type_byte as char
            )));
        }

        let ready = ReadyForQuery::parse(payload)?;
        self.transaction_status = ready.transaction_status().unwrap_or_default();
        self.state = State::Finished;
        Ok(Action::Finished)
    }
}
