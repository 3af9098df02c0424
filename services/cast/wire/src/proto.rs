//! Protocol-buffer definitions for the Cast V2 channel.
//!
//! These mirror the proto2 `cast_channel` schema: the `CastMessage` envelope
//! that every frame carries, and the device-auth messages exchanged on the
//! device-auth namespace right after the TLS handshake.

/// Envelope carried by every frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    /// Protocol version, see [`ProtocolVersion`]
    #[prost(enumeration = "ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    /// Sender identifier (e.g. `sender-0`)
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    /// Receiver identifier (e.g. `receiver-0` or an app transport id)
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    /// Logical channel the payload belongs to
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    /// Which payload field is populated, see [`PayloadType`]
    #[prost(enumeration = "PayloadType", required, tag = "5")]
    pub payload_type: i32,
    /// UTF-8 payload (JSON for every namespace except device auth)
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    /// Binary payload
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

/// Envelope protocol versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    /// CASTV2_1_0
    Castv210 = 0,
    /// CASTV2_1_1
    Castv211 = 1,
    /// CASTV2_1_2
    Castv212 = 2,
    /// CASTV2_1_3
    Castv213 = 3,
}

/// Envelope payload selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    /// `payload_utf8` is set
    String = 0,
    /// `payload_binary` is set
    Binary = 1,
}

/// Signature scheme the device should use for its auth response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    /// No preference expressed
    Unspecified = 0,
    /// RSASSA-PKCS1-v1_5
    RsassaPkcs1v15 = 1,
    /// RSASSA-PSS
    RsassaPss = 2,
}

/// Digest used by the device-auth signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1 = 0,
    /// SHA-256
    Sha256 = 1,
}

/// Challenge sent by the sender after the TLS handshake.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthChallenge {
    /// Preferred signature scheme
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "1")]
    pub signature_algorithm: Option<i32>,
    /// Random nonce the device must sign
    #[prost(bytes = "vec", optional, tag = "2")]
    pub sender_nonce: Option<Vec<u8>>,
    /// Preferred digest
    #[prost(enumeration = "HashAlgorithm", optional, tag = "3")]
    pub hash_algorithm: Option<i32>,
}

/// Signed answer from the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResponse {
    /// Signature over `sender_nonce || tls peer certificate`
    #[prost(bytes = "vec", required, tag = "1")]
    pub signature: Vec<u8>,
    /// Device (leaf) certificate, DER
    #[prost(bytes = "vec", required, tag = "2")]
    pub client_auth_certificate: Vec<u8>,
    /// Intermediate certificates, DER, leaf-side first
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub intermediate_certificate: Vec<Vec<u8>>,
    /// Scheme actually used
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "4")]
    pub signature_algorithm: Option<i32>,
    /// Nonce echoed back by the device
    #[prost(bytes = "vec", optional, tag = "5")]
    pub sender_nonce: Option<Vec<u8>>,
    /// Digest actually used
    #[prost(enumeration = "HashAlgorithm", optional, tag = "6")]
    pub hash_algorithm: Option<i32>,
    /// Revocation list supplied by the device
    #[prost(bytes = "vec", optional, tag = "7")]
    pub crl: Option<Vec<u8>>,
}

/// Error reported by the device instead of a response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthError {
    /// Reason, see [`AuthErrorType`]
    #[prost(enumeration = "AuthErrorType", required, tag = "1")]
    pub error_type: i32,
}

/// Device-side auth error reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AuthErrorType {
    /// Generic failure on the device
    InternalError = 0,
    /// The device saw no TLS on the channel
    NoTls = 1,
    /// The requested signature algorithm is not available
    SignatureAlgorithmUnavailable = 2,
}

/// Wrapper carried in the binary payload of the device-auth namespace.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceAuthMessage {
    /// Sender -> device
    #[prost(message, optional, tag = "1")]
    pub challenge: Option<AuthChallenge>,
    /// Device -> sender on success
    #[prost(message, optional, tag = "2")]
    pub response: Option<AuthResponse>,
    /// Device -> sender on failure
    #[prost(message, optional, tag = "3")]
    pub error: Option<AuthError>,
}
