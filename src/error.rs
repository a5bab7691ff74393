/// Unified error handling for sondeo
///
/// Every fallible operation in the crate returns a [`TopologyError`]. The
/// probe loop is the only place that swallows errors; everything else hands
/// them back to the caller.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for topology operations
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A budgeted wait did not complete in time
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// An external cancellation fired
    #[error("Operation was cancelled")]
    Cancelled,

    /// Transport-level failure talking to a node
    #[error("Connection error to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Raw socket errors
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted after the node or pool was disposed
    #[error("{what} has been disposed")]
    Disposed { what: String },

    /// A writable view was requested from a node that only accepts reads
    #[error("Node {endpoint} is not writable")]
    NotWritable { endpoint: String },

    /// The server answered a command with a failure reply
    #[error("Command failed: {message}")]
    Command { message: String },

    /// Malformed frames or replies
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server speaks a wire protocol range we do not support
    #[error("Server {endpoint} wire versions {server_min}..={server_max} are not supported")]
    IncompatibleWireVersion {
        endpoint: String,
        server_min: i64,
        server_max: i64,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Convenience methods for creating specific error types
impl TopologyError {
    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        TopologyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a connection error
    pub fn connection<E: fmt::Display, S: Into<String>>(endpoint: E, message: S) -> Self {
        TopologyError::Connection {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Create a disposed error
    pub fn disposed<S: Into<String>>(what: S) -> Self {
        TopologyError::Disposed { what: what.into() }
    }

    pub fn not_writable<E: fmt::Display>(endpoint: E) -> Self {
        TopologyError::NotWritable {
            endpoint: endpoint.to_string(),
        }
    }

    pub fn command<S: Into<String>>(message: S) -> Self {
        TopologyError::Command {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        TopologyError::Protocol(message.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        TopologyError::Internal {
            message: message.into(),
        }
    }

    /// True for transport failures, the kind a probe treats as "attempt failed"
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TopologyError::Connection { .. } | TopologyError::Io(_) | TopologyError::Protocol(_)
        )
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TopologyError::Connection { .. } => true,
            TopologyError::Io(_) => true,
            TopologyError::Timeout { .. } => true,
            TopologyError::Command { .. } => true,
            TopologyError::NotWritable { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TopologyError::Config(_) => ErrorSeverity::Critical,
            TopologyError::Internal { .. } => ErrorSeverity::Critical,
            TopologyError::IncompatibleWireVersion { .. } => ErrorSeverity::Error,
            TopologyError::Connection { .. } => ErrorSeverity::Warning,
            TopologyError::Io(_) => ErrorSeverity::Warning,
            TopologyError::Timeout { .. } => ErrorSeverity::Warning,
            TopologyError::Cancelled => ErrorSeverity::Info,
            TopologyError::Disposed { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
