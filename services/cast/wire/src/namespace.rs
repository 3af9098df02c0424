//! Well-known namespaces, identifiers and JSON keys.

/// Virtual-connection management (CONNECT / CLOSE)
pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
/// Keepalive (PING / PONG)
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
/// Device authentication (binary payloads)
pub const NS_DEVICE_AUTH: &str = "urn:x-cast:com.google.cast.tp.deviceauth";
/// Platform receiver (status, launch, volume)
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";

/// Destination id of the device platform itself
pub const PLATFORM_DESTINATION_ID: &str = "receiver-0";
/// Default source id for this sender
pub const DEFAULT_SOURCE_ID: &str = "sender-0";

/// JSON key holding the message type
pub const MESSAGE_TYPE: &str = "type";
/// JSON key holding the correlation id
pub const REQUEST_ID: &str = "requestId";
/// JSON key holding the application session id
pub const SESSION_ID: &str = "sessionId";

/// Heartbeat request
pub const TYPE_PING: &str = "PING";
/// Heartbeat reply
pub const TYPE_PONG: &str = "PONG";
/// Open a virtual connection
pub const TYPE_CONNECT: &str = "CONNECT";
/// Close a virtual connection
pub const TYPE_CLOSE: &str = "CLOSE";
/// Ask the receiver for its status
pub const TYPE_GET_STATUS: &str = "GET_STATUS";
/// Receiver status report
pub const TYPE_RECEIVER_STATUS: &str = "RECEIVER_STATUS";
