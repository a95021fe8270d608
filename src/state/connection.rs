//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ParameterStatus, RawMessage,
    ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    options: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    pub fn new(options: Opts) -> Self {
        Self {
            state: ConnectionState::Initial,
            options,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start the connection process by queueing the StartupMessage.
    pub fn start(&mut self, buffer_set: &mut BufferSet) -> Action {
        buffer_set.write_buffer.clear();

        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.options.user),
            ("client_encoding", "UTF8"),
        ];
        if let Some(db) = &self.options.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.options.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.options.params {
            params.push((name, value));
        }
        write_startup(&mut buffer_set.write_buffer, &params);

        self.state = ConnectionState::WaitingAuth;
        Action::WriteAndReadMessage
    }

    /// Process the message held in `buffer_set`.
    pub fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;

        // ParameterStatus during startup is part of the handshake, not a change notice
        if RawMessage::is_async_type(type_byte)
            && !(self.state == ConnectionState::WaitingReady
                && type_byte == msg_type::PARAMETER_STATUS)
        {
            return self.handle_async_message(type_byte, &buffer_set.read_buffer);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?;
            self.state = ConnectionState::Failed;
            return Err(error.into_error());
        }

        match self.state {
            ConnectionState::WaitingAuth => self.handle_auth_message(buffer_set),
            ConnectionState::SaslInProgress => self.handle_sasl_message(buffer_set),
            ConnectionState::WaitingAuthResult => self.handle_auth_result(buffer_set),
            ConnectionState::WaitingReady => self.handle_ready_message(buffer_set),
            _ => Err(Error::Protocol(format!(
                "Unexpected message '{}' in state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn expect_auth<'buf>(buffer_set: &'buf BufferSet) -> Result<AuthenticationMessage<'buf>> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                buffer_set.type_byte as char
            )));
        }
        AuthenticationMessage::parse(&buffer_set.read_buffer)
    }

    fn handle_auth_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let mut out = Vec::new();

        match Self::expect_auth(buffer_set)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                return Ok(Action::ReadMessage);
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(&mut out, self.password()?);
                self.state = ConnectionState::WaitingAuthResult;
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                write_password(&mut out, &hashed);
                self.state = ConnectionState::WaitingAuthResult;
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    &mut out,
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                );
                self.scram_client = Some(scram);
                self.state = ConnectionState::SaslInProgress;
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "Unsupported authentication method: {:?}",
                    other
                )));
            }
        }

        buffer_set.write_buffer.clear();
        buffer_set.write_buffer.extend_from_slice(&out);
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_sasl_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let mut out = Vec::new();
        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match Self::expect_auth(buffer_set)? {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Error::Auth)?;
                write_sasl_response(&mut out, client_final.as_bytes());
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram
                    .verify_server_final(server_final)
                    .map_err(Error::Auth)?;

                self.state = ConnectionState::WaitingAuthResult;
                return Ok(Action::ReadMessage);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected SASL message: {:?}",
                    other
                )));
            }
        }

        buffer_set.write_buffer.clear();
        buffer_set.write_buffer.extend_from_slice(&out);
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_auth_result(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match Self::expect_auth(buffer_set)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("Unexpected auth result: {:?}", other))),
        }
    }

    fn handle_ready_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let payload = &buffer_set.read_buffer;

        match buffer_set.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_key = Some(*key);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = ConnectionState::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }

    fn handle_async_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        let msg = AsyncMessage::parse(type_byte, payload)?;
        if let AsyncMessage::ParameterChanged { name, value } = &msg {
            match self.server_params.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = value.clone(),
                None => self.server_params.push((name.clone(), value.clone())),
            }
        }
        Ok(Action::HandleAsyncMessageAndReadMessage(msg))
    }
}
