//! In-process Cast device for tests.

use bytes::BytesMut;
use cast_wire::{
    encode, AuthResponse, DeviceAuthMessage, FrameDecoder, HashAlgorithm, Message,
    SignatureAlgorithm, NS_DEVICE_AUTH, NS_HEARTBEAT, NS_RECEIVER, PLATFORM_DESTINATION_ID,
    TYPE_GET_STATUS, TYPE_PING,
};
use prost::Message as _;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Replies reversed once `batch` requests are queued
pub const NS_ECHO: &str = "urn:x-cast:test.echo";
/// Never answered
pub const NS_SILENT: &str = "urn:x-cast:test.silent";
/// Any message makes the device drop the socket
pub const NS_DROP: &str = "urn:x-cast:test.drop";

/// Root plus a device certificate signed by it
pub struct DevicePki {
    pub root_der: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub leaf_key: KeyPair,
}

impl DevicePki {
    pub fn generate(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> Self {
        let root_key = KeyPair::generate().unwrap();
        let mut root_params = CertificateParams::default();
        root_params
            .distinguished_name
            .push(DnType::CommonName, "Fake Cast Root");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        root_params.not_after = rcgen::date_time_ymd(2045, 1, 1);
        let root = root_params.self_signed(&root_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "Fake Speaker");
        leaf_params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        leaf_params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let leaf = leaf_params.signed_by(&leaf_key, &root, &root_key).unwrap();

        Self {
            root_der: root.der().to_vec(),
            leaf_der: leaf.der().to_vec(),
            leaf_key,
        }
    }

    pub fn valid() -> Self {
        Self::generate((2024, 1, 1), (2040, 1, 1))
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &self.leaf_key.serialize_der(),
            &rng,
        )
        .unwrap();
        pair.sign(&rng, data).unwrap().as_ref().to_vec()
    }
}

/// Transport id of the app reported when `Behavior::app_running` is set
pub const APP_TRANSPORT: &str = "web-5";

/// Device behavior knobs
#[derive(Clone, Copy)]
pub struct Behavior {
    pub answer_pings: bool,
    /// Report an app on `APP_TRANSPORT` serving `NS_ECHO`
    pub app_running: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_pings: true,
            app_running: false,
        }
    }
}

/// A TLS listener that speaks enough Cast V2 to exercise the client
pub struct FakeDevice {
    pub addr: SocketAddr,
    pub root_der: Vec<u8>,
    accepted: Arc<AtomicUsize>,
}

impl FakeDevice {
    pub async fn start(pki: DevicePki, behavior: Behavior) -> Self {
        let tls_key = KeyPair::generate().unwrap();
        let tls_cert = CertificateParams::new(vec!["fake-speaker.local".to_string()])
            .unwrap()
            .self_signed(&tls_key)
            .unwrap();
        let tls_der = tls_cert.der().to_vec();

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(tls_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(tls_key.serialize_der())),
        )
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let root_der = pki.root_der.clone();
        let pki = Arc::new(pki);
        let tls_der = Arc::new(tls_der);

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let pki = pki.clone();
                let tls_der = tls_der.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(tcp).await {
                        serve(stream, &pki, &tls_der, behavior).await;
                    }
                });
            }
        });

        Self {
            addr,
            root_der,
            accepted,
        }
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve<S>(mut stream: S, pki: &DevicePki, tls_der: &[u8], behavior: Behavior)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    let mut held: Vec<Message> = Vec::new();

    loop {
        let message = match decoder.decode(&mut buf) {
            Ok(Some(message)) => message,
            Ok(None) => match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let mut replies = Vec::new();
        match message.namespace.as_str() {
            NS_DEVICE_AUTH => replies.push(auth_reply(&message, pki, tls_der)),
            NS_HEARTBEAT if message.message_type() == Some(TYPE_PING) => {
                if behavior.answer_pings {
                    replies.push(reply_to(&message, json!({"type": "PONG"})));
                }
            }
            NS_RECEIVER if message.message_type() == Some(TYPE_GET_STATUS) => {
                let id = message.request_id().unwrap_or(0);
                let applications = if behavior.app_running {
                    json!([{
                        "appId": "E8C28D3C",
                        "displayName": "Echo",
                        "sessionId": "session-1",
                        "transportId": APP_TRANSPORT,
                        "namespaces": [{"name": NS_ECHO}]
                    }])
                } else {
                    json!([])
                };
                replies.push(reply_to(
                    &message,
                    json!({
                        "type": "RECEIVER_STATUS",
                        "requestId": id,
                        "status": {
                            "applications": applications,
                            "isActiveInput": true,
                            "volume": {"level": 0.5, "muted": false}
                        }
                    }),
                ));
            }
            NS_ECHO => {
                let batch = message
                    .data()
                    .and_then(|d| d.get("batch"))
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                held.push(message);
                if held.len() >= batch {
                    for request in held.drain(..).rev() {
                        let mut body = request.data().cloned().unwrap_or(Value::Null);
                        body["echo"] = json!(true);
                        replies.push(reply_to(&request, body));
                    }
                }
            }
            NS_DROP => return,
            _ => {}
        }

        for reply in replies {
            let frame = encode(&reply, 64 * 1024).unwrap();
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
        let _ = stream.flush().await;
    }
}

fn reply_to(request: &Message, body: Value) -> Message {
    Message::json(
        request.namespace.as_str(),
        request.destination_id.as_str(),
        request.source_id.as_str(),
        body,
    )
}

fn auth_reply(challenge: &Message, pki: &DevicePki, tls_der: &[u8]) -> Message {
    let decoded = challenge
        .bytes()
        .and_then(|b| DeviceAuthMessage::decode(b.as_ref()).ok())
        .and_then(|m| m.challenge)
        .and_then(|c| c.sender_nonce)
        .unwrap_or_default();

    let mut signed = decoded.clone();
    signed.extend_from_slice(tls_der);

    let reply = DeviceAuthMessage {
        challenge: None,
        response: Some(AuthResponse {
            signature: pki.sign(&signed),
            client_auth_certificate: pki.leaf_der.clone(),
            intermediate_certificate: Vec::new(),
            signature_algorithm: Some(SignatureAlgorithm::RsassaPkcs1v15 as i32),
            sender_nonce: Some(decoded),
            hash_algorithm: Some(HashAlgorithm::Sha256 as i32),
            crl: None,
        }),
        error: None,
    };
    Message::binary(
        NS_DEVICE_AUTH,
        PLATFORM_DESTINATION_ID,
        challenge.source_id.as_str(),
        reply.encode_to_vec(),
    )
}
