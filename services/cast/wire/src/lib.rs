//! Cast V2 wire protocol: protobuf envelope, framing and message model.
//!
//! This crate provides the low-level wire protocol used to talk to Cast
//! devices over their TLS port, including the protobuf envelope, the
//! device-auth messages, length-prefixed framing and a decoded message type
//! whose payload is either a JSON object or raw bytes.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-----------------------------------+
//! | u32 frame_len (BE)   | length of bytes that follow       |
//! +----------------------+-----------------------------------+
//! | CastMessage          | protobuf envelope (proto2)        |
//! |   protocol_version   |   tag 1                           |
//! |   source_id          |   tag 2                           |
//! |   destination_id     |   tag 3                           |
//! |   namespace          |   tag 4                           |
//! |   payload_type       |   tag 5 (STRING | BINARY)         |
//! |   payload_utf8       |   tag 6 (JSON text)               |
//! |   payload_binary     |   tag 7 (device auth, app data)   |
//! +----------------------+-----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod message;
pub mod namespace;
pub mod proto;

// Re-export main types
pub use error::WireError;
pub use frame::{encode, Decoded, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use message::{Message, Payload};
pub use namespace::*;
pub use proto::{
    AuthChallenge, AuthError, AuthErrorType, AuthResponse, CastMessage, DeviceAuthMessage,
    HashAlgorithm, PayloadType, ProtocolVersion, SignatureAlgorithm,
};
