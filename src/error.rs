//! Error types for the replication client
//!
//! Errors are grouped the way the supervisor reacts to them:
//! - transport errors are recovered locally by reconnecting;
//! - protocol errors kill the current connection and are retried up to a
//!   threshold;
//! - server errors are surfaced unless the error code is known-transient;
//! - decode errors skip the offending event and keep the stream alive;
//! - usage errors are returned synchronously from the offending call.

use thiserror::Error;

/// Error categories, mirroring how the supervisor reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-level failures, recovered by reconnecting
    Transport,
    /// Wire/protocol violations, fatal for the current connection
    Protocol,
    /// Errors reported by the server in an ERR packet
    Server,
    /// Row/value decode failures, skippable per event
    Decode,
    /// Caller mistakes, surfaced synchronously
    Usage,
}

/// Errors produced by the replication client and its decoders.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// TCP connect or initial greeting failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Read from the server failed mid-stream
    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    /// Write to the server failed
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    /// The server closed the stream where more data was required
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The in-flight read was interrupted by `close_connection()`
    #[error("connection interrupted")]
    Interrupted,

    /// The peer violated the client/server or binlog protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A packet or event did not frame correctly
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A row event version this client does not speak
    #[error("unsupported row event version: {0}")]
    UnsupportedEventVersion(u8),

    /// ERR packet from the server
    #[error("server error {code} ({sqlstate}): {message}")]
    Server {
        code: u16,
        sqlstate: String,
        message: String,
    },

    /// Authentication was rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A column type code the value decoder does not support
    #[error("unsupported column type {0}")]
    UnsupportedType(u8),

    /// A column value did not decode against its declared metadata
    #[error("malformed field: {0}")]
    MalformedField(String),

    /// A declared length exceeds the remaining buffer or a sane bound
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// A row event arrived for a table id with no preceding TABLE_MAP
    #[error("no table map for table id {0}")]
    SchemaMiss(u64),

    /// A registered table does not exist on the primary
    #[error("unknown table {database}.{table}")]
    UnknownTable { database: String, table: String },

    /// Invalid master info or registration parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A user callback reported a failure; terminates the run loop
    #[error("callback failed: {0}")]
    Callback(String),
}

impl ReplicaError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    pub fn malformed_field(msg: impl Into<String>) -> Self {
        Self::MalformedField(msg.into())
    }

    pub fn length_overflow(msg: impl Into<String>) -> Self {
        Self::LengthOverflow(msg.into())
    }

    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    /// Category the supervisor uses to pick a reaction.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectFailed(_)
            | Self::ReadFailed(_)
            | Self::WriteFailed(_)
            | Self::UnexpectedEof
            | Self::Interrupted => ErrorCategory::Transport,
            Self::Protocol(_) | Self::MalformedFrame(_) | Self::UnsupportedEventVersion(_) => {
                ErrorCategory::Protocol
            }
            Self::Server { .. } => ErrorCategory::Server,
            Self::UnsupportedType(_)
            | Self::MalformedField(_)
            | Self::LengthOverflow(_)
            | Self::SchemaMiss(_) => ErrorCategory::Decode,
            Self::AuthFailed(_)
            | Self::UnknownTable { .. }
            | Self::InvalidConfig(_)
            | Self::Callback(_) => ErrorCategory::Usage,
        }
    }

    /// Whether the supervisor should reconnect and try again.
    ///
    /// Transport errors are always retriable. Protocol errors are retriable
    /// up to the supervisor's failure threshold. Server errors are retried
    /// only for known-transient codes.
    pub fn is_retriable(&self) -> bool {
        match self {
            e if e.category() == ErrorCategory::Transport => true,
            e if e.category() == ErrorCategory::Protocol => true,
            Self::Server { code, .. } => is_transient_server_code(*code),
            _ => false,
        }
    }

    /// Whether the event that produced this error can be skipped while the
    /// stream keeps going.
    pub fn is_skippable_decode(&self) -> bool {
        self.category() == ErrorCategory::Decode
    }
}

impl From<std::io::Error> for ReplicaError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            _ => Self::ReadFailed(e),
        }
    }
}

/// Server error codes that are worth a reconnect instead of a bail-out.
fn is_transient_server_code(code: u16) -> bool {
    matches!(
        code,
        1040 // ER_CON_COUNT_ERROR
        | 1053 // ER_SERVER_SHUTDOWN
        | 1205 // ER_LOCK_WAIT_TIMEOUT
        | 1213 // ER_LOCK_DEADLOCK
        | 2006 // CR_SERVER_GONE_ERROR
        | 2013 // CR_SERVER_LOST
    )
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplicaError>;
