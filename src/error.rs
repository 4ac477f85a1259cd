//! Error types shared by every drover component.
//!
//! A caller always receives a single terminal classification. Routing misses
//! ([`ClusterError::TargetNotRecognized`]) are consumed by the failover router and
//! only escape it when every coordinator answered that way.

use std::io;

use thiserror::Error;

/// Result type used throughout drover.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors raised by the membership, connection and routing layers.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Name resolution yielded no address of the IPv4 family.
    #[error("no IPv4 address found for host `{0}`")]
    AddressNotFound(String),

    /// Resource exhaustion or an internal invariant failure.
    #[error("system error: {0}")]
    System(String),

    /// A frame was short, malformed or exceeded a configured bound.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection establishment failed permanently.
    #[error("connection to {addr} failed: {reason}")]
    ConnectFatal {
        /// Endpoint that was dialed.
        addr: String,
        /// Human readable cause.
        reason: String,
    },

    /// Connection establishment failed transiently; the caller may retry later.
    #[error("connection to {addr} should be retried: {reason}")]
    ConnectRetry {
        /// Endpoint that was dialed.
        addr: String,
        /// Human readable cause.
        reason: String,
    },

    /// The coordinator is reachable but does not own the addressed entity.
    #[error("target `{0}` not recognized by coordinator")]
    TargetNotRecognized(String),

    /// Failover visited every coordinator without reaching one.
    #[error("no reachable coordinator")]
    NoReachablePeer,

    /// The request was rejected before it was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The coordinator answered with an error code the router does not interpret.
    #[error("request rejected with code {code}: {text}")]
    Rejected {
        /// Reply code sent by the coordinator.
        code: u32,
        /// Optional diagnostic text.
        text: String,
    },

    /// A peer handle no longer refers to a live record.
    #[error("peer handle is stale")]
    StalePeer,

    /// The referenced connection is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Persisted peer identity could not be read or written.
    #[error("store error: {0}")]
    Store(String),

    /// Underlying socket error.
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

/// Outcome classes reported for a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    /// The endpoint is this coordinator.
    Local,
    /// A usable handle was produced.
    Handle(u64),
    /// Permanent failure, do not retry.
    Fatal,
    /// Transient failure, the caller may retry later.
    Retry,
}

impl ClusterError {
    /// Returns `true` for errors that indicate a transient network condition.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::ConnectRetry { .. } | ClusterError::Timeout => true,
            ClusterError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }

    /// Returns `true` if the error leaves a request/reply stream closed or out of sync.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            ClusterError::Io(_) | ClusterError::Timeout | ClusterError::Protocol(_)
        )
    }

    /// Classifies a connect failure into the coarse connect result codes.
    pub fn connect_code(&self) -> ConnectCode {
        if self.is_transient() {
            ConnectCode::Retry
        } else {
            ConnectCode::Fatal
        }
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

impl From<rmp_serde::encode::Error> for ClusterError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ClusterError::Store(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClusterError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ClusterError::Store(err.to_string())
    }
}

pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}
