//! Error types for CDC operations
//!
//! Every failure the engine can observe maps onto one [`ErrorCategory`],
//! which is also the category handed to the audit sink.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for audit records and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing connector, empty table groups, unknown listener kind
    Configuration,
    /// Malformed or out-of-epoch replication events
    Decode,
    /// Handshake failure, unreachable node, dropped stream
    Network,
    /// Downstream transform rejected or timed out
    Downstream,
    /// Metadata collaborator failures
    Storage,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Decode => "decode",
            Self::Network => "network",
            Self::Downstream => "downstream",
            Self::Storage => "storage",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CDC-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed replication event
    #[error("Decode error: {0}")]
    Decode(String),

    /// Row mutation for a table id with no cached table map
    #[error("Row event references unknown table id {table_id}")]
    UnknownTable { table_id: u64 },

    /// Handshake, authentication or transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Downstream transform rejected an event
    #[error("Downstream error: {0}")]
    Downstream(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Metadata store failure
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new downstream error
    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::Downstream(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a metadata store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error ends the current connection epoch.
    ///
    /// Fatal errors move a running task to `FAILED`; everything else is
    /// contained at the dispatcher boundary.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnknownTable { .. }
            | Self::Decode(_)
            | Self::Connection(_)
            | Self::ConnectionClosed
            | Self::Io(_) => true,

            Self::Config(_)
            | Self::Downstream(_)
            | Self::Timeout(_)
            | Self::Store(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for audit records.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Decode(_) => ErrorCategory::Decode,
            Self::UnknownTable { .. } => ErrorCategory::Decode,
            Self::Connection(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Downstream(_) => ErrorCategory::Downstream,
            Self::Timeout(_) => ErrorCategory::Downstream,
            Self::Store(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Other,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Decode(_) => "decode_error",
            Self::UnknownTable { .. } => "unknown_table",
            Self::Connection(_) => "connection_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Downstream(_) => "downstream_error",
            Self::Timeout(_) => "timeout",
            Self::Store(_) => "store_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::connection("handshake failed");
        assert!(err.to_string().contains("Connection error"));
        assert!(err.to_string().contains("handshake failed"));

        let err = CdcError::UnknownTable { table_id: 42 };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(CdcError::UnknownTable { table_id: 1 }.is_fatal());
        assert!(CdcError::decode("short bitmap").is_fatal());
        assert!(CdcError::ConnectionClosed.is_fatal());
        assert!(CdcError::connection("refused").is_fatal());

        assert!(!CdcError::downstream("rejected").is_fatal());
        assert!(!CdcError::timeout("apply").is_fatal());
        assert!(!CdcError::config("missing connector").is_fatal());
        assert!(!CdcError::store("unavailable").is_fatal());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CdcError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(CdcError::decode("x").category(), ErrorCategory::Decode);
        assert_eq!(
            CdcError::UnknownTable { table_id: 7 }.category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            CdcError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
        assert_eq!(
            CdcError::timeout("x").category(),
            ErrorCategory::Downstream
        );
        assert_eq!(CdcError::store("x").category(), ErrorCategory::Storage);
        assert_eq!(CdcError::other("x").category(), ErrorCategory::Other);
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Configuration).unwrap();
        assert_eq!(json, "\"configuration\"");
        assert_eq!(ErrorCategory::Downstream.to_string(), "downstream");
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(
            CdcError::UnknownTable { table_id: 3 }.error_code(),
            "unknown_table"
        );
        assert_eq!(CdcError::config("x").error_code(), "config_error");
    }
}
