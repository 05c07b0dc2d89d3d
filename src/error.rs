//! Error taxonomy for the scripting protocol.
//!
//! Transport errors always reach the caller of a send, protocol errors close
//! the offending connection, handler errors become failure responses, and
//! configuration errors fail before any network activity.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScriptingError>;

#[derive(Debug, Error)]
pub enum ScriptingError {
    /// Connect, read or write failure on a socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// A socket operation exceeded its configured timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Bytes that could not be decoded into a command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command logic failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid setup detected before any I/O (empty pool, unbindable port).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ScriptingError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }

    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }

    pub const fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }
}

impl From<serde_json::Error> for ScriptingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation() {
        let err = ScriptingError::timeout("connect", Duration::from_millis(250));
        assert_eq!(err.to_string(), "connect timed out after 250ms");
    }

    #[test]
    fn io_errors_convert() {
        let err: ScriptingError = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(err, ScriptingError::Io(_)));
    }
}
