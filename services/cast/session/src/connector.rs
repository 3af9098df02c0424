//! Connection establishment: TCP, TLS and the device-auth handshake.

use crate::auth::{build_challenge, verify_response, Nonce, NonceRegistry};
use crate::client::Endpoint;
use crate::error::{AuthFailure, TransportError};
use crate::session::WorkerContext;
use crate::state::{Connection, ConnectionState, ErrorCause};
use crate::transport::{connect_tcp, tls, IoStream};
use bytes::BytesMut;
use cast_wire::{encode, FrameDecoder, Message, NS_DEVICE_AUTH};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Establishes authenticated connections to one endpoint
pub(crate) struct Connector {
    endpoint: Endpoint,
    tls: Arc<rustls::ClientConfig>,
    nonces: NonceRegistry,
}

impl Connector {
    pub fn new(endpoint: Endpoint) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint,
            tls: Arc::new(tls::make_client_config()?),
            nonces: NonceRegistry::new(),
        })
    }

    /// Walk `connection` from `Idle` to `Established`.
    ///
    /// Returns the stream together with any bytes read past the auth reply.
    pub async fn establish(
        &mut self,
        connection: &mut Connection,
        ctx: &WorkerContext,
    ) -> Result<(IoStream, BytesMut), ErrorCause> {
        let config = &ctx.config;
        let addr = self.endpoint.socket_addr();

        ctx.advance(connection, ConnectionState::TcpConnecting)?;
        let tcp = connect_tcp(addr, config.connect_timeout)
            .await
            .map_err(transport_cause)?;

        ctx.advance(connection, ConnectionState::TlsConnecting)?;
        let server_name = self.endpoint.address.to_string();
        let handshake = tls::connect_tls(self.tls.clone(), tcp, &server_name);
        let (mut stream, peer_cert) = match tokio::time::timeout(config.connect_timeout, handshake)
            .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(transport_cause(TransportError::Tls(format!("{:#}", e)))),
            Err(_) => {
                return Err(transport_cause(TransportError::ConnectTimeout {
                    addr,
                    timeout: config.connect_timeout,
                }))
            }
        };

        if peer_cert.is_empty() {
            return Err(ErrorCause::Auth(AuthFailure::NoPeerCert));
        }
        if let Some(expected) = &self.endpoint.fingerprint_hint {
            check_fingerprint(&peer_cert, expected)?;
        }

        let nonce = self.nonces.issue().map_err(ErrorCause::Auth)?;
        let challenge = build_challenge(&config.source_id, &nonce, &config.auth);
        let frame = encode(&challenge, config.max_frame_size)
            .map_err(|e| ErrorCause::Frame(e.to_string()))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| transport_cause(e.into()))?;
        stream.flush().await.map_err(|e| transport_cause(e.into()))?;
        ctx.advance(connection, ConnectionState::AuthChallengeSent)?;

        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let verified = authenticate(
            &mut stream,
            &mut read_buf,
            &mut decoder,
            &nonce,
            config.connect_timeout,
            |reply| verify_response(reply, &nonce, &config.trust_anchors, &peer_cert),
        )
        .await?;

        info!(
            "Device {} authenticated as {} (chain of {}, anchored at {})",
            ctx.device, verified.device_subject, verified.chain_len, verified.anchor_subject
        );
        ctx.advance(connection, ConnectionState::AuthVerified)?;
        ctx.advance(connection, ConnectionState::Established)?;

        Ok((stream, read_buf))
    }
}

/// Read frames until the device-auth reply arrives, then hand it to `verify`.
///
/// Frames on other namespaces are not trusted before authentication and are
/// dropped.
async fn authenticate<S, T, F>(
    stream: &mut S,
    read_buf: &mut BytesMut,
    decoder: &mut FrameDecoder,
    nonce: &Nonce,
    timeout: Duration,
    verify: F,
) -> Result<T, ErrorCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Message) -> Result<T, AuthFailure>,
{
    let reply = async {
        loop {
            match decoder.decode(read_buf) {
                Ok(Some(message)) if message.namespace == NS_DEVICE_AUTH => return Ok(message),
                Ok(Some(message)) => {
                    debug!("Ignoring {} before authentication", message);
                    continue;
                }
                Ok(None) => {}
                Err(e) if !e.is_fatal() => {
                    warn!("Dropping message during authentication: {}", e);
                    continue;
                }
                Err(e) => return Err(ErrorCause::Frame(e.to_string())),
            }

            match stream.read_buf(read_buf).await {
                Ok(0) => return Err(ErrorCause::PeerClosed),
                Ok(_) => {}
                Err(e) => return Err(transport_cause(e.into())),
            }
        }
    };

    let message = match tokio::time::timeout(timeout, reply).await {
        Ok(reply) => reply?,
        Err(_) => return Err(transport_cause(TransportError::AuthTimeout)),
    };

    debug!("Verifying auth reply for nonce {:?}", nonce);
    verify(&message).map_err(|failure| {
        warn!("Device authentication failed: {}", failure);
        ErrorCause::Auth(failure)
    })
}

fn check_fingerprint(peer_cert: &[u8], expected: &str) -> Result<(), ErrorCause> {
    let digest = ring::digest::digest(&ring::digest::SHA256, peer_cert);
    let actual: String = digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect();
    let expected: String = expected
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase();

    if actual != expected {
        warn!("Peer certificate fingerprint {} does not match {}", actual, expected);
        return Err(ErrorCause::Auth(AuthFailure::ChainUntrusted(
            "certificate fingerprint mismatch".to_string(),
        )));
    }
    Ok(())
}

fn transport_cause(e: TransportError) -> ErrorCause {
    ErrorCause::Transport(e.to_string())
}
