//! TLS sockets, device authentication, dispatch, heartbeat and reconnect for Cast V2.
//!
//! This crate keeps one persistent, authenticated connection to a Cast device
//! and multiplexes namespace traffic over it. A single supervisor task owns the
//! socket and all connection state; callers talk to it through a cloneable
//! [`CastClient`] handle.
//!
//! ## Features
//!
//! - **Transport**: TCP plus TLS against the device's self-signed certificate
//! - **Device Auth**: challenge/response over the device-auth namespace, with
//!   certificate chain, validity, revocation and signature checks
//! - **Dispatch**: per-namespace handlers and `requestId` correlation
//! - **Keepalive**: PING/PONG with dead-peer detection
//! - **Auto-reconnect**: exponential backoff; auth failures are terminal
//!
//! ## Example
//!
//! ```rust,no_run
//! use cast_session::{CastClient, ClientConfig, Endpoint, TrustAnchors};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClientConfig {
//!     trust_anchors: TrustAnchors::load_pem_file("cast_root_ca.pem")?,
//!     ..Default::default()
//! };
//!
//! let endpoint = Endpoint::new("192.168.1.40".parse()?);
//! let client = CastClient::spawn(endpoint, config)?;
//! client.wait_established(Duration::from_secs(10)).await?;
//!
//! // Platform request, correlated by requestId
//! let reply = client.request_platform(json!({"type": "GET_STATUS"})).await?;
//! println!("receiver status: {}", reply);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod channels;
pub mod client;
mod connector;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{
    build_challenge, generate_nonce, verify_response, AuthPreferences, Nonce, NonceRegistry,
    TrustAnchors, Verified,
};
pub use channels::{DeviceQuirks, ReceiverStatus, VirtualChannels, DEFAULT_USER_AGENT};
pub use client::{CastClient, ClientConfig, Endpoint, RequestHandle, DEFAULT_PORT};
pub use dispatcher::{
    DispatchReport, Delivery, Dispatcher, HandlerOutcome, NamespaceHandler, RequestKey,
    RequestOutcome,
};
pub use error::{AuthFailure, ClientError, RequestError, TransportError};
pub use keepalive::{Heartbeat, HeartbeatConfig};
pub use reconnect::ReconnectPolicy;
pub use session::Command;
pub use state::{Connection, ConnectionState, ConnectionStatus, ErrorCause, TransitionError};
pub use transport::{connect_tcp, IoStream};
