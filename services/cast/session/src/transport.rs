//! TCP and TLS transport to Cast devices.
//!
//! Devices present a self-signed TLS certificate, so the TLS layer only
//! provides encryption and the channel binding. Device identity is proven
//! afterwards by the device-auth handshake, which signs over the certificate
//! returned here.

use crate::error::TransportError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Authenticated sessions always run over TLS
pub type IoStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Connect to a TCP address within `timeout`
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    debug!("Connecting to {} (timeout {:?})", addr, timeout);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
        Err(_) => Err(TransportError::ConnectTimeout { addr, timeout }),
    }
}

/// TLS client side for Cast devices
pub mod tls {
    use super::*;
    use anyhow::{Context, Result};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Accepts the device's self-signed certificate.
    ///
    /// Handshake signatures are still checked, so the peer must own the key
    /// of the certificate that the auth challenge later binds to.
    #[derive(Debug)]
    struct DeviceCertVerifier {
        provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for DeviceCertVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Create the TLS client configuration used for every device
    pub fn make_client_config() -> Result<ClientConfig> {
        debug!("Creating TLS client configuration for Cast devices");

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeviceCertVerifier { provider }))
            .with_no_client_auth();

        Ok(config)
    }

    /// Connect via TLS and return the stream with the peer's leaf certificate
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        server_name: &str,
    ) -> Result<(IoStream, Vec<u8>)> {
        let peer_addr = tcp_stream.peer_addr().ok();
        debug!("Connecting via TLS to {:?} (SNI: {})", peer_addr, server_name);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", server_name))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {:?}", peer_addr))?;

        // Extract peer certificate
        let peer_cert = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .unwrap_or_default();

        debug!(
            "TLS connection established, peer cert length: {}",
            peer_cert.len()
        );
        Ok((tls_stream, peer_cert))
    }
}
