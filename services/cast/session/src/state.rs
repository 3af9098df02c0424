//! Connection lifecycle.
//!
//! A [`Connection`] walks `Idle -> TcpConnecting -> TlsConnecting ->
//! AuthChallengeSent -> AuthVerified -> Established -> Closing -> Closed`.
//! `Error` is reachable from every non-terminal state. `Closed` and `Error`
//! are absorbing: a retry starts a fresh `Connection` with the next
//! generation.

use crate::error::AuthFailure;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::time::Instant;

/// Why a connection ended in `Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// TCP/TLS failure or socket error
    Transport(String),
    /// Device authentication rejected
    Auth(AuthFailure),
    /// Framing can no longer be trusted
    Frame(String),
    /// No PONG within the configured bound
    HeartbeatTimeout,
    /// Device closed the socket or the platform channel
    PeerClosed,
}

impl ErrorCause {
    /// Auth failures are terminal; everything else may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCause::Auth(_))
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::Transport(reason) => write!(f, "transport: {reason}"),
            ErrorCause::Auth(failure) => write!(f, "auth: {failure}"),
            ErrorCause::Frame(reason) => write!(f, "frame: {reason}"),
            ErrorCause::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            ErrorCause::PeerClosed => write!(f, "peer closed"),
        }
    }
}

/// Lifecycle state of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing attempted yet
    Idle,
    /// Raw TCP connect in progress
    TcpConnecting,
    /// TLS handshake in progress
    TlsConnecting,
    /// Challenge written, waiting for the device's answer
    AuthChallengeSent,
    /// Device identity verified
    AuthVerified,
    /// Ready for traffic
    Established,
    /// Shutdown requested
    Closing,
    /// Closed cleanly
    Closed,
    /// Failed
    Error(ErrorCause),
}

impl ConnectionState {
    /// `Closed` and `Error` end an attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error(_))
    }

    /// Whether traffic may flow
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established)
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::TcpConnecting => "TcpConnecting",
            ConnectionState::TlsConnecting => "TlsConnecting",
            ConnectionState::AuthChallengeSent => "AuthChallengeSent",
            ConnectionState::AuthVerified => "AuthVerified",
            ConnectionState::Established => "Established",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
            ConnectionState::Error(_) => "Error",
        }
    }

    fn allows(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Error(_)) => true,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Idle, TcpConnecting)
            | (TcpConnecting, TlsConnecting)
            | (TlsConnecting, AuthChallengeSent)
            | (AuthChallengeSent, AuthVerified)
            | (AuthVerified, Established) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(cause) => write!(f, "Error({cause})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Rejected state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition {from} -> {to} (generation {generation})")]
pub struct TransitionError {
    /// State before
    pub from: &'static str,
    /// Requested state
    pub to: &'static str,
    /// Generation of the connection
    pub generation: u64,
}

/// One connection attempt and its lifecycle
#[derive(Debug, Clone)]
pub struct Connection {
    generation: u64,
    state: ConnectionState,
    since: Instant,
}

impl Connection {
    /// Fresh connection in `Idle`
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: ConnectionState::Idle,
            since: Instant::now(),
        }
    }

    /// Session generation of this attempt
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// When the current state was entered
    pub fn since(&self) -> Instant {
        self.since
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.state.allows(&next) {
            return Err(TransitionError {
                from: self.state.name(),
                to: next.name(),
                generation: self.generation,
            });
        }
        self.state = next;
        self.since = Instant::now();
        Ok(())
    }

    /// Move to `Error(cause)`
    pub fn fail(&mut self, cause: ErrorCause) -> Result<(), TransitionError> {
        self.transition(ConnectionState::Error(cause))
    }

    /// The connection that replaces this one on retry
    pub fn next_attempt(&self) -> Connection {
        Connection::new(self.generation + 1)
    }
}

/// Snapshot published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Session generation
    pub generation: u64,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Device address
    pub address: SocketAddr,
}

impl ConnectionStatus {
    /// Snapshot of `connection` for `address`
    pub fn of(connection: &Connection, address: SocketAddr) -> Self {
        Self {
            generation: connection.generation(),
            state: connection.state().clone(),
            address,
        }
    }
}
