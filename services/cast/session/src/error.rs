//! Error types for the session layer.

use crate::state::ErrorCause;
use cast_wire::{AuthErrorType, WireError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Reasons a device-auth handshake is rejected.
///
/// None of these are retried: they terminate the connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Reply missing, on the wrong namespace, not binary, or undecodable
    #[error("malformed auth response: {0}")]
    MalformedResponse(String),

    /// Device answered with an auth error instead of a response
    #[error("device rejected the challenge: {0:?}")]
    DeviceRejected(AuthErrorType),

    /// No usable device certificate
    #[error("no peer certificate")]
    NoPeerCert,

    /// Chain does not lead to a configured trust anchor
    #[error("certificate chain untrusted: {0}")]
    ChainUntrusted(String),

    /// A certificate in the chain is outside its validity window
    #[error("certificate expired or not yet valid")]
    ExpiredCert,

    /// A certificate in the chain is listed in a revocation list
    #[error("certificate revoked")]
    Revoked,

    /// Signature over the nonce and channel binding does not verify
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Echoed nonce differs from the one sent
    #[error("nonce mismatch")]
    NoncesMismatch,

    /// A nonce was offered a second time
    #[error("nonce reused")]
    NonceReuse,
}

/// Socket level failures. All of them are retryable.
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect did not finish in time
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target address
        addr: SocketAddr,
        /// Configured limit
        timeout: Duration,
    },

    /// TCP connect failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration or handshake failed
    #[error("TLS: {0}")]
    Tls(String),

    /// Device did not answer the auth challenge in time
    #[error("timed out waiting for auth response")]
    AuthTimeout,

    /// Socket read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the socket
    #[error("connection closed by peer")]
    PeerClosed,

    /// Frame could not be decoded or encoded
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Outcome of a request that did not produce a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No reply within the configured bound
    #[error("request timed out")]
    Timeout,

    /// The session that carried the request is gone
    #[error("request belongs to a previous session")]
    Stale,

    /// The client was closed while the request was pending
    #[error("request cancelled")]
    Cancelled,

    /// No established connection to send on, or no application running
    #[error("not connected")]
    NotConnected,

    /// The running application does not serve the namespace
    #[error("namespace {0} is not served by the running application")]
    UnsupportedNamespace(String),

    /// The client is shut down
    #[error("client closed")]
    Closed,

    /// Another pending request already uses this namespace and id
    #[error("request id {0} already pending")]
    Duplicate(u64),

    /// Message could not be framed
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Errors returned by the client handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The worker is gone
    #[error("client closed")]
    Closed,

    /// Authentication failed; the client will not retry
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// Waited too long for the connection
    #[error("timed out waiting for connection")]
    Timeout,

    /// No established connection; the message was not written
    #[error("not connected")]
    NotConnected,

    /// The running application does not serve the namespace
    #[error("namespace {0} is not served by the running application")]
    UnsupportedNamespace(String),

    /// The connection failed and will not be retried
    #[error("connection failed: {0}")]
    Failed(ErrorCause),

    /// Message rejected before it was queued
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
