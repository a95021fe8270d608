//! Error types for pgpipe.

use thiserror::Error;

/// Result type for pgpipe operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgpipe.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// A query could not run because an earlier query in the same pipeline failed
    #[error("Could not complete query in pipeline due to error in earlier query")]
    PipelineAborted,

    /// Pipeline bookkeeping disagrees with what the connection delivered
    #[error("Internal error: {0}")]
    Internal(String),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection is broken and cannot be reused
    #[error("Connection is broken")]
    ConnectionBroken,

    /// Invalid usage (e.g., retrieving an unknown query)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// A counter ran out of range
    #[error("Overflow: {0}")]
    Overflow(String),

    /// Value could not be decoded into the requested type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionBroken => true,
            Error::Server(fields) => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(
                    fields.severity.as_deref(),
                    Some("FATAL") | Some("PANIC")
                )
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_display() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42P01".into()),
            message: Some("relation \"pg_nonexistent\" does not exist".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "ERROR: relation \"pg_nonexistent\" does not exist (SQLSTATE 42P01)"
        );
    }

    #[test]
    fn broken_connection_classification() {
        assert!(Error::ConnectionBroken.is_connection_broken());
        assert!(!Error::PipelineAborted.is_connection_broken());

        let fatal = Error::Server(ErrorFields {
            severity: Some("FATAL".into()),
            ..Default::default()
        });
        assert!(fatal.is_connection_broken());
    }

    #[test]
    fn sqlstate_only_for_server_errors() {
        let err = Error::Server(ErrorFields {
            code: Some("42601".into()),
            ..Default::default()
        });
        assert_eq!(err.sqlstate(), Some("42601"));
        assert_eq!(Error::Internal("x".into()).sqlstate(), None);
    }
}
