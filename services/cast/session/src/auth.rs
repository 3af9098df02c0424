//! Device authentication handshake.
//!
//! Right after the TLS handshake the sender writes an `AuthChallenge` with a
//! fresh nonce on the device-auth namespace. The device answers with its
//! certificate chain and a signature over `nonce || tls peer certificate`.
//! [`verify_response`] checks, in order and stopping at the first failure:
//!
//! 1. the reply is a binary `DeviceAuthMessage` carrying a response
//! 2. the device certificate (and every intermediate) parses
//! 3. every certificate is within its validity window, and the chain leads
//!    to one of the configured trust anchors
//! 4. no certificate is listed in a supplied revocation list
//! 5. the echoed nonce matches, and the signature verifies with the device
//!    certificate's key
//!
//! Nonces, chains and CRLs only live for one attempt.

use crate::error::AuthFailure;
use anyhow::{Context, Result};
use cast_wire::{
    AuthChallenge, AuthErrorType, AuthResponse, DeviceAuthMessage, HashAlgorithm, Message,
    SignatureAlgorithm, NS_DEVICE_AUTH, PLATFORM_DESTINATION_ID,
};
use prost::Message as _;
use rand::RngCore;
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::public_key::PublicKey;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;
use x509_parser::{parse_x509_certificate, parse_x509_crl};

/// Length of the sender nonce in bytes
pub const NONCE_LEN: usize = 16;

/// Random challenge nonce
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; NONCE_LEN]> for Nonce {
    fn from(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Fresh nonce from the OS RNG
pub fn generate_nonce() -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Nonces this client has already put on the wire
#[derive(Debug, Default)]
pub struct NonceRegistry {
    used: HashSet<Nonce>,
}

impl NonceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `nonce`, refusing one that was used before
    pub fn register(&mut self, nonce: &Nonce) -> Result<(), AuthFailure> {
        if !self.used.insert(nonce.clone()) {
            warn!("Refusing to reuse challenge nonce {:?}", nonce);
            return Err(AuthFailure::NonceReuse);
        }
        Ok(())
    }

    /// Generate and record a nonce for a new attempt
    pub fn issue(&mut self) -> Result<Nonce, AuthFailure> {
        let nonce = generate_nonce();
        self.register(&nonce)?;
        Ok(nonce)
    }

    /// Number of nonces issued
    pub fn len(&self) -> usize {
        self.used.len()
    }

    /// Whether no nonce was issued yet
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Algorithms requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPreferences {
    /// Signature scheme
    pub signature_algorithm: SignatureAlgorithm,
    /// Digest
    pub hash_algorithm: HashAlgorithm,
}

impl Default for AuthPreferences {
    fn default() -> Self {
        Self {
            signature_algorithm: SignatureAlgorithm::RsassaPkcs1v15,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

/// Build the auth challenge for `nonce`
pub fn build_challenge(source_id: &str, nonce: &Nonce, preferences: &AuthPreferences) -> Message {
    let challenge = DeviceAuthMessage {
        challenge: Some(AuthChallenge {
            signature_algorithm: Some(preferences.signature_algorithm as i32),
            sender_nonce: Some(nonce.as_bytes().to_vec()),
            hash_algorithm: Some(preferences.hash_algorithm as i32),
        }),
        response: None,
        error: None,
    };

    Message::binary(
        NS_DEVICE_AUTH,
        source_id,
        PLATFORM_DESTINATION_ID,
        challenge.encode_to_vec(),
    )
}

/// Certificates a device chain must lead to, plus operator-supplied CRLs
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    anchors: Vec<Vec<u8>>,
    crls: Vec<Vec<u8>>,
    at: Option<i64>,
}

impl TrustAnchors {
    /// No anchors: every chain is untrusted
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchors from DER certificates
    pub fn from_der<I>(certs: I) -> Result<Self>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut anchors = Self::new();
        for der in certs {
            anchors.add_der(der)?;
        }
        Ok(anchors)
    }

    /// Anchors from PEM text
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let cert_results: std::result::Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut &pem[..]).collect();
        let certs = cert_results.context("Failed to parse trust anchor PEM")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in trust anchor PEM");
        }
        Self::from_der(certs.into_iter().map(|cert| cert.as_ref().to_vec()))
    }

    /// Anchors from a PEM file
    pub fn load_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read trust anchors {}", path.display()))?;
        Self::from_pem(&pem).with_context(|| format!("Invalid trust anchors {}", path.display()))
    }

    /// Add one DER anchor
    pub fn add_der(&mut self, der: Vec<u8>) -> Result<()> {
        let (_, cert) = parse_x509_certificate(&der)
            .map_err(|e| anyhow::anyhow!("Failed to parse trust anchor: {:?}", e))?;
        debug!("Added trust anchor {}", cert.subject());
        self.anchors.push(der);
        Ok(())
    }

    /// Add a DER X.509 CRL checked on every handshake
    pub fn add_crl_der(&mut self, der: Vec<u8>) {
        self.crls.push(der);
    }

    /// Add CRLs from a file, PEM or DER
    pub fn load_crl_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read CRL {}", path.display()))?;

        if data.starts_with(b"-----BEGIN") {
            let crl_results: std::result::Result<Vec<_>, _> =
                rustls_pemfile::crls(&mut &data[..]).collect();
            let crls = crl_results.with_context(|| format!("Invalid CRL PEM {}", path.display()))?;
            if crls.is_empty() {
                anyhow::bail!("No CRL found in {}", path.display());
            }
            self.crls
                .extend(crls.into_iter().map(|crl| crl.as_ref().to_vec()));
        } else {
            self.crls.push(data);
        }
        Ok(())
    }

    /// Verify as of `unix_seconds` instead of the current time
    pub fn at_time(mut self, unix_seconds: i64) -> Self {
        self.at = Some(unix_seconds);
        self
    }

    /// Number of anchors
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether no anchor is configured
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    fn verification_time(&self) -> Result<ASN1Time, AuthFailure> {
        let seconds = match self.at {
            Some(seconds) => seconds,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or_default(),
        };
        ASN1Time::from_timestamp(seconds)
            .map_err(|_| AuthFailure::ChainUntrusted(format!("invalid verification time {seconds}")))
    }
}

/// Identity established by a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// Subject of the device certificate
    pub device_subject: String,
    /// Subject of the anchor the chain led to
    pub anchor_subject: String,
    /// Certificates presented (device plus intermediates)
    pub chain_len: usize,
}

/// Check a device's answer to the challenge carrying `expected_nonce`
pub fn verify_response(
    response: &Message,
    expected_nonce: &Nonce,
    trust_anchors: &TrustAnchors,
    tls_peer_certificate: &[u8],
) -> Result<Verified, AuthFailure> {
    let auth = decode_response(response)?;

    if auth.client_auth_certificate.is_empty() || tls_peer_certificate.is_empty() {
        return Err(AuthFailure::NoPeerCert);
    }
    let (_, leaf) =
        parse_x509_certificate(&auth.client_auth_certificate).map_err(|_| AuthFailure::NoPeerCert)?;
    let intermediates = auth
        .intermediate_certificate
        .iter()
        .map(|der| {
            parse_x509_certificate(der)
                .map(|(_, cert)| cert)
                .map_err(|e| AuthFailure::ChainUntrusted(format!("bad intermediate: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut chain: Vec<&X509Certificate<'_>> = Vec::with_capacity(1 + intermediates.len());
    chain.push(&leaf);
    chain.extend(intermediates.iter());

    let now = trust_anchors.verification_time()?;
    if let Some(cert) = chain.iter().find(|cert| !cert.validity().is_valid_at(now)) {
        debug!("Certificate {} outside its validity window", cert.subject());
        return Err(AuthFailure::ExpiredCert);
    }
    let anchor_subject = verify_chain(&chain, trust_anchors)?;

    check_revocation(&chain, auth.crl.as_deref(), trust_anchors)?;

    if auth.sender_nonce.as_deref() != Some(expected_nonce.as_bytes()) {
        return Err(AuthFailure::NoncesMismatch);
    }
    let mut signed = Vec::with_capacity(NONCE_LEN + tls_peer_certificate.len());
    signed.extend_from_slice(expected_nonce.as_bytes());
    signed.extend_from_slice(tls_peer_certificate);
    verify_signature(&leaf, &auth, &signed)?;

    Ok(Verified {
        device_subject: leaf.subject().to_string(),
        anchor_subject,
        chain_len: chain.len(),
    })
}

fn decode_response(response: &Message) -> Result<AuthResponse, AuthFailure> {
    if response.namespace != NS_DEVICE_AUTH {
        return Err(AuthFailure::MalformedResponse(format!(
            "unexpected namespace {}",
            response.namespace
        )));
    }
    let bytes = response
        .bytes()
        .ok_or_else(|| AuthFailure::MalformedResponse("payload is not binary".to_string()))?;
    let message = DeviceAuthMessage::decode(bytes.as_ref())
        .map_err(|e| AuthFailure::MalformedResponse(e.to_string()))?;

    if let Some(error) = message.error {
        let error_type =
            AuthErrorType::try_from(error.error_type).unwrap_or(AuthErrorType::InternalError);
        return Err(AuthFailure::DeviceRejected(error_type));
    }
    message
        .response
        .ok_or_else(|| AuthFailure::MalformedResponse("no response in reply".to_string()))
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

/// Walk leaf -> intermediates -> anchor, returning the anchor's subject
fn verify_chain(
    chain: &[&X509Certificate<'_>],
    trust_anchors: &TrustAnchors,
) -> Result<String, AuthFailure> {
    for pair in chain.windows(2) {
        let (subject, issuer) = (pair[0], pair[1]);
        if !is_ca(issuer) {
            return Err(AuthFailure::ChainUntrusted(format!(
                "{} is not a CA",
                issuer.subject()
            )));
        }
        subject
            .verify_signature(Some(issuer.public_key()))
            .map_err(|_| {
                AuthFailure::ChainUntrusted(format!(
                    "{} is not signed by {}",
                    subject.subject(),
                    issuer.subject()
                ))
            })?;
    }

    let top = chain[chain.len() - 1];
    for der in &trust_anchors.anchors {
        let Ok((_, anchor)) = parse_x509_certificate(der) else {
            continue;
        };
        if top.verify_signature(Some(anchor.public_key())).is_ok() {
            return Ok(anchor.subject().to_string());
        }
    }

    Err(AuthFailure::ChainUntrusted(format!(
        "no trust anchor for {}",
        top.issuer()
    )))
}

/// Operator CRLs fail closed: one that cannot be parsed counts as a
/// revocation. The device's own `crl` field may carry a bundle that is not
/// X.509 DER; that is logged and skipped.
fn check_revocation(
    chain: &[&X509Certificate<'_>],
    supplied: Option<&[u8]>,
    trust_anchors: &TrustAnchors,
) -> Result<(), AuthFailure> {
    if let Some(der) = supplied.filter(|der| !der.is_empty()) {
        match parse_x509_crl(der) {
            Ok((_, crl)) => check_crl(chain, &crl)?,
            Err(e) => warn!("Ignoring device-supplied CRL that is not X.509 ({})", e),
        }
    }

    for der in &trust_anchors.crls {
        let (_, crl) = parse_x509_crl(der).map_err(|e| {
            warn!("Unparsable CRL ({}), treating chain as revoked", e);
            AuthFailure::Revoked
        })?;
        check_crl(chain, &crl)?;
    }
    Ok(())
}

fn check_crl(
    chain: &[&X509Certificate<'_>],
    crl: &CertificateRevocationList<'_>,
) -> Result<(), AuthFailure> {
    for cert in chain {
        if crl.issuer().as_raw() != cert.issuer().as_raw() {
            continue;
        }
        if crl
            .iter_revoked_certificates()
            .any(|revoked| revoked.raw_serial() == cert.raw_serial())
        {
            warn!("Certificate {} is revoked", cert.subject());
            return Err(AuthFailure::Revoked);
        }
    }
    Ok(())
}

fn verify_signature(
    leaf: &X509Certificate<'_>,
    auth: &AuthResponse,
    signed: &[u8],
) -> Result<(), AuthFailure> {
    let signature_algorithm = match auth.signature_algorithm {
        None => SignatureAlgorithm::RsassaPkcs1v15,
        Some(value) => {
            SignatureAlgorithm::try_from(value).map_err(|_| AuthFailure::SignatureMismatch)?
        }
    };
    let hash_algorithm = match auth.hash_algorithm {
        None => HashAlgorithm::Sha1,
        Some(value) => HashAlgorithm::try_from(value).map_err(|_| AuthFailure::SignatureMismatch)?,
    };

    let spki = leaf.public_key();
    let key: &[u8] = &spki.subject_public_key.data;
    let algorithm: &'static dyn VerificationAlgorithm = match spki.parsed() {
        Ok(PublicKey::RSA(_)) => match (signature_algorithm, hash_algorithm) {
            (SignatureAlgorithm::RsassaPss, HashAlgorithm::Sha256) => {
                &signature::RSA_PSS_2048_8192_SHA256
            }
            (SignatureAlgorithm::RsassaPss, HashAlgorithm::Sha1) => {
                debug!("RSASSA-PSS with SHA-1 is not supported");
                return Err(AuthFailure::SignatureMismatch);
            }
            (_, HashAlgorithm::Sha256) => &signature::RSA_PKCS1_2048_8192_SHA256,
            (_, HashAlgorithm::Sha1) => &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
        },
        Ok(PublicKey::EC(_)) => match key.len() {
            65 => &signature::ECDSA_P256_SHA256_ASN1,
            97 => &signature::ECDSA_P384_SHA256_ASN1,
            len => {
                debug!("Unsupported EC point length {}", len);
                return Err(AuthFailure::SignatureMismatch);
            }
        },
        _ => {
            debug!("Unsupported device key type");
            return Err(AuthFailure::SignatureMismatch);
        }
    };

    UnparsedPublicKey::new(algorithm, key)
        .verify(signed, &auth.signature)
        .map_err(|_| AuthFailure::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

    // 2030-01-01T00:00:00Z
    const VERIFY_AT: i64 = 1_893_456_000;
    const LEAF_SERIAL: [u8; 2] = [0x10, 0x01];

    struct Pki {
        root_der: Vec<u8>,
        inter_cert: rcgen::Certificate,
        inter_key: KeyPair,
        inter_der: Vec<u8>,
        leaf_der: Vec<u8>,
        leaf_key: KeyPair,
    }

    fn ca_params(name: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2045, 1, 1);
        params
    }

    fn pki_with_leaf_validity(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> Pki {
        let root_key = KeyPair::generate().unwrap();
        let root_cert = ca_params("Test Cast Root").self_signed(&root_key).unwrap();

        let inter_key = KeyPair::generate().unwrap();
        let inter_cert = ca_params("Test Cast ICA")
            .signed_by(&inter_key, &root_cert, &root_key)
            .unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "Living Room TV");
        leaf_params.serial_number = Some(rcgen::SerialNumber::from_slice(&LEAF_SERIAL));
        leaf_params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        leaf_params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &inter_cert, &inter_key)
            .unwrap();

        Pki {
            root_der: root_cert.der().to_vec(),
            inter_der: inter_cert.der().to_vec(),
            inter_cert,
            inter_key,
            leaf_der: leaf_cert.der().to_vec(),
            leaf_key,
        }
    }

    fn pki() -> Pki {
        pki_with_leaf_validity((2024, 1, 1), (2040, 1, 1))
    }

    fn anchors(pki: &Pki) -> TrustAnchors {
        TrustAnchors::from_der([pki.root_der.clone()])
            .unwrap()
            .at_time(VERIFY_AT)
    }

    fn sign(key: &KeyPair, data: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &key.serialize_der(), &rng)
                .unwrap();
        pair.sign(&rng, data).unwrap().as_ref().to_vec()
    }

    const TLS_CERT: &[u8] = b"tls peer certificate der";

    fn response(pki: &Pki, nonce: &Nonce, echoed: Option<&Nonce>, crl: Option<Vec<u8>>) -> Message {
        let mut signed = nonce.as_bytes().to_vec();
        signed.extend_from_slice(TLS_CERT);

        let reply = DeviceAuthMessage {
            challenge: None,
            response: Some(AuthResponse {
                signature: sign(&pki.leaf_key, &signed),
                client_auth_certificate: pki.leaf_der.clone(),
                intermediate_certificate: vec![pki.inter_der.clone()],
                signature_algorithm: Some(SignatureAlgorithm::RsassaPkcs1v15 as i32),
                sender_nonce: echoed.map(|n| n.as_bytes().to_vec()),
                hash_algorithm: Some(HashAlgorithm::Sha256 as i32),
                crl,
            }),
            error: None,
        };
        Message::binary(NS_DEVICE_AUTH, "receiver-0", "sender-0", reply.encode_to_vec())
    }

    #[test]
    fn test_valid_chain_verifies() {
        let pki = pki();
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), None);

        let verified = verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT).unwrap();
        assert_eq!(verified.chain_len, 2);
        assert!(verified.device_subject.contains("Living Room TV"));
        assert!(verified.anchor_subject.contains("Test Cast Root"));
    }

    #[test]
    fn test_nonce_mismatch_never_verifies() {
        let pki = pki();
        let sent = generate_nonce();
        let other = generate_nonce();

        // Device signed and echoed a different nonce
        let msg = response(&pki, &other, Some(&other), None);
        assert_eq!(
            verify_response(&msg, &sent, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::NoncesMismatch)
        );

        // Device omitted the echo
        let msg = response(&pki, &sent, None, None);
        assert_eq!(
            verify_response(&msg, &sent, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::NoncesMismatch)
        );
    }

    #[test]
    fn test_expired_certificate() {
        let pki = pki_with_leaf_validity((2020, 1, 1), (2021, 1, 1));
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), None);
        assert_eq!(
            verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::ExpiredCert)
        );
    }

    #[test]
    fn test_unknown_root_is_untrusted() {
        let pki = pki();
        let stranger = self::pki();
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), None);

        let result = verify_response(&msg, &nonce, &anchors(&stranger), TLS_CERT);
        assert!(matches!(result, Err(AuthFailure::ChainUntrusted(_))));

        let result = verify_response(&msg, &nonce, &TrustAnchors::new().at_time(VERIFY_AT), TLS_CERT);
        assert!(matches!(result, Err(AuthFailure::ChainUntrusted(_))));
    }

    #[test]
    fn test_signature_is_bound_to_tls_certificate() {
        let pki = pki();
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), None);
        assert_eq!(
            verify_response(&msg, &nonce, &anchors(&pki), b"some other certificate"),
            Err(AuthFailure::SignatureMismatch)
        );
    }

    #[test]
    fn test_revoked_device_certificate() {
        let pki = pki();
        let crl = rcgen::CertificateRevocationListParams {
            this_update: rcgen::date_time_ymd(2024, 1, 1),
            next_update: rcgen::date_time_ymd(2035, 1, 1),
            crl_number: rcgen::SerialNumber::from_slice(&[1]),
            issuing_distribution_point: None,
            revoked_certs: vec![rcgen::RevokedCertParams {
                serial_number: rcgen::SerialNumber::from_slice(&LEAF_SERIAL),
                revocation_time: rcgen::date_time_ymd(2024, 6, 1),
                reason_code: Some(rcgen::RevocationReason::KeyCompromise),
                invalidity_date: None,
            }],
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        }
        .signed_by(&pki.inter_cert, &pki.inter_key)
        .unwrap();
        let crl_der = crl.der().as_ref().to_vec();
        let nonce = generate_nonce();

        // Supplied by the device
        let msg = response(&pki, &nonce, Some(&nonce), Some(crl_der.clone()));
        assert_eq!(
            verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::Revoked)
        );

        // Configured by the operator
        let mut configured = anchors(&pki);
        configured.add_crl_der(crl_der);
        let msg = response(&pki, &nonce, Some(&nonce), None);
        assert_eq!(
            verify_response(&msg, &nonce, &configured, TLS_CERT),
            Err(AuthFailure::Revoked)
        );
    }

    #[test]
    fn test_unparsable_operator_crl_fails_closed() {
        let pki = pki();
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), None);
        let mut trust = anchors(&pki);
        trust.add_crl_der(b"not a crl".to_vec());
        assert_eq!(
            verify_response(&msg, &nonce, &trust, TLS_CERT),
            Err(AuthFailure::Revoked)
        );
    }

    #[test]
    fn test_unparsable_device_crl_is_skipped() {
        let pki = pki();
        let nonce = generate_nonce();
        let msg = response(&pki, &nonce, Some(&nonce), Some(b"cast crl bundle".to_vec()));
        assert!(verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT).is_ok());
    }

    #[test]
    fn test_malformed_and_rejected_replies() {
        let pki = pki();
        let nonce = generate_nonce();
        let trust = anchors(&pki);

        let text = Message::json(NS_DEVICE_AUTH, "receiver-0", "sender-0", serde_json::json!({}));
        assert!(matches!(
            verify_response(&text, &nonce, &trust, TLS_CERT),
            Err(AuthFailure::MalformedResponse(_))
        ));

        let wrong_ns = Message::binary("urn:x-cast:other", "receiver-0", "sender-0", vec![1u8]);
        assert!(matches!(
            verify_response(&wrong_ns, &nonce, &trust, TLS_CERT),
            Err(AuthFailure::MalformedResponse(_))
        ));

        let rejected = DeviceAuthMessage {
            challenge: None,
            response: None,
            error: Some(cast_wire::AuthError {
                error_type: AuthErrorType::SignatureAlgorithmUnavailable as i32,
            }),
        };
        let msg = Message::binary(NS_DEVICE_AUTH, "receiver-0", "sender-0", rejected.encode_to_vec());
        assert_eq!(
            verify_response(&msg, &nonce, &trust, TLS_CERT),
            Err(AuthFailure::DeviceRejected(
                AuthErrorType::SignatureAlgorithmUnavailable
            ))
        );
    }

    #[test]
    fn test_missing_device_certificate() {
        let pki = pki();
        let nonce = generate_nonce();
        let reply = DeviceAuthMessage {
            challenge: None,
            response: Some(AuthResponse {
                signature: vec![1, 2, 3],
                client_auth_certificate: Vec::new(),
                ..Default::default()
            }),
            error: None,
        };
        let msg = Message::binary(NS_DEVICE_AUTH, "receiver-0", "sender-0", reply.encode_to_vec());
        assert_eq!(
            verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::NoPeerCert)
        );

        let garbage = DeviceAuthMessage {
            challenge: None,
            response: Some(AuthResponse {
                client_auth_certificate: vec![0x30, 0x03, 0x01],
                ..Default::default()
            }),
            error: None,
        };
        let msg = Message::binary(NS_DEVICE_AUTH, "receiver-0", "sender-0", garbage.encode_to_vec());
        assert_eq!(
            verify_response(&msg, &nonce, &anchors(&pki), TLS_CERT),
            Err(AuthFailure::NoPeerCert)
        );
    }

    #[test]
    fn test_challenge_carries_nonce_and_preferences() {
        let nonce = Nonce::from([7u8; NONCE_LEN]);
        let msg = build_challenge("sender-0", &nonce, &AuthPreferences::default());
        assert_eq!(msg.namespace, NS_DEVICE_AUTH);
        assert_eq!(msg.destination_id, PLATFORM_DESTINATION_ID);

        let decoded = DeviceAuthMessage::decode(msg.bytes().unwrap().as_ref()).unwrap();
        let challenge = decoded.challenge.unwrap();
        assert_eq!(challenge.sender_nonce.as_deref(), Some(nonce.as_bytes()));
        assert_eq!(
            challenge.signature_algorithm,
            Some(SignatureAlgorithm::RsassaPkcs1v15 as i32)
        );
        assert_eq!(challenge.hash_algorithm, Some(HashAlgorithm::Sha256 as i32));
    }

    #[test]
    fn test_nonce_registry_refuses_reuse() {
        let mut registry = NonceRegistry::new();
        let first = registry.issue().unwrap();
        let second = registry.issue().unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.register(&first), Err(AuthFailure::NonceReuse));
    }

    #[test]
    fn test_anchors_from_pem() {
        let key = KeyPair::generate().unwrap();
        let cert = ca_params("PEM Root").self_signed(&key).unwrap();
        let anchors = TrustAnchors::from_pem(cert.pem().as_bytes()).unwrap();
        assert_eq!(anchors.len(), 1);

        assert!(TrustAnchors::from_pem(b"no certificates here").is_err());
    }
}
