//! Virtual connections and the platform receiver status.
//!
//! Messages to a destination are only accepted by the device once a virtual
//! connection to it was opened with `CONNECT`. Open destinations are tracked
//! per session. The running application is learned from `RECEIVER_STATUS`,
//! and the app's transport gets its own virtual connection when one of our
//! registered namespaces is served by it.

use cast_wire::{
    Message, NS_CONNECTION, NS_RECEIVER, PLATFORM_DESTINATION_ID, REQUEST_ID, SESSION_ID,
    TYPE_CLOSE, TYPE_CONNECT, TYPE_GET_STATUS,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

/// Default `userAgent` announced in `CONNECT`
pub const DEFAULT_USER_AGENT: &str = concat!("castv2-rs/", env!("CARGO_PKG_VERSION"));

/// Device-specific deviations in what the receiver reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceQuirks {
    /// Receiver status keys that this device reports incorrectly; they are
    /// treated as absent (e.g. `isActiveInput` on devices without CEC)
    pub ignored_status_fields: HashSet<String>,
}

impl DeviceQuirks {
    /// Quirks that ignore the given status keys
    pub fn ignoring<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_status_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn ignores(&self, field: &str) -> bool {
        self.ignored_status_fields.contains(field)
    }
}

/// The fields of a receiver status the engine needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverStatus {
    /// Running application id
    pub app_id: Option<String>,
    /// Running application name
    pub display_name: Option<String>,
    /// Application session id
    pub session_id: Option<String>,
    /// Destination id of the running application
    pub transport_id: Option<String>,
    /// Namespaces served by the running application
    pub namespaces: Vec<String>,
    /// Whether the device is the active input of its display
    pub is_active_input: Option<bool>,
    /// Whether the display is in standby
    pub is_stand_by: Option<bool>,
    /// Volume level, 0.0 to 1.0
    pub volume_level: Option<f64>,
    /// Mute state
    pub volume_muted: Option<bool>,
}

impl ReceiverStatus {
    /// Parse the body of a `RECEIVER_STATUS` message
    pub fn parse(data: &Value, quirks: &DeviceQuirks) -> Option<Self> {
        let status = data.get("status")?;
        let field = |key: &str| {
            if quirks.ignores(key) {
                None
            } else {
                status.get(key)
            }
        };
        let volume = field("volume");
        let app = status
            .get("applications")
            .and_then(Value::as_array)
            .and_then(|apps| apps.first());
        let app_str = |key: &str| {
            app.and_then(|app| app.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Some(Self {
            app_id: app_str("appId"),
            display_name: app_str("displayName"),
            session_id: app_str(SESSION_ID),
            transport_id: app_str("transportId"),
            namespaces: app
                .and_then(|app| app.get("namespaces"))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            is_active_input: field("isActiveInput").and_then(Value::as_bool),
            is_stand_by: field("isStandBy").and_then(Value::as_bool),
            volume_level: volume.and_then(|v| v.get("level")).and_then(Value::as_f64),
            volume_muted: volume.and_then(|v| v.get("muted")).and_then(Value::as_bool),
        })
    }
}

/// Build a `CONNECT` for `destination`
pub fn build_connect(source_id: &str, destination: &str, user_agent: &str) -> Message {
    Message::json(
        NS_CONNECTION,
        source_id,
        destination,
        json!({
            "type": TYPE_CONNECT,
            "origin": {},
            "userAgent": user_agent,
            "senderInfo": {
                "sdkType": 2,
                "version": env!("CARGO_PKG_VERSION"),
                "platform": 4,
                "systemVersion": std::env::consts::OS,
                "connectionType": 1,
            },
        }),
    )
}

/// Build a `CLOSE` for `destination`
pub fn build_close(source_id: &str, destination: &str) -> Message {
    Message::json(
        NS_CONNECTION,
        source_id,
        destination,
        json!({ "type": TYPE_CLOSE, "origin": {} }),
    )
}

/// Build a `GET_STATUS` for the platform receiver
pub fn build_get_status(source_id: &str, request_id: u64) -> Message {
    Message::json(
        NS_RECEIVER,
        source_id,
        PLATFORM_DESTINATION_ID,
        json!({ "type": TYPE_GET_STATUS, REQUEST_ID: request_id }),
    )
}

/// Open virtual connections of one session
#[derive(Debug)]
pub struct VirtualChannels {
    source_id: String,
    user_agent: String,
    open: HashSet<String>,
    app_transport: Option<String>,
}

impl VirtualChannels {
    /// No channel open yet
    pub fn new(source_id: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            user_agent: user_agent.into(),
            open: HashSet::new(),
            app_transport: None,
        }
    }

    /// Whether a channel to `destination` is open
    pub fn is_open(&self, destination: &str) -> bool {
        self.open.contains(destination)
    }

    /// Destinations with an open channel, platform last
    pub fn open_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .open
            .iter()
            .filter(|d| d.as_str() != PLATFORM_DESTINATION_ID)
            .cloned()
            .collect();
        destinations.sort();
        if self.is_open(PLATFORM_DESTINATION_ID) {
            destinations.push(PLATFORM_DESTINATION_ID.to_string());
        }
        destinations
    }

    /// Transport id of the application we last saw running
    pub fn app_transport(&self) -> Option<&str> {
        self.app_transport.as_deref()
    }

    /// `CONNECT` to send before the first message to `destination`, if any.
    ///
    /// The broadcast destination `*` never needs one.
    pub fn ensure_open(&mut self, destination: &str) -> Option<Message> {
        if destination == "*" || !self.open.insert(destination.to_string()) {
            return None;
        }
        debug!("Opening virtual connection to {}", destination);
        Some(build_connect(&self.source_id, destination, &self.user_agent))
    }

    /// `CLOSE` to send for `destination`, if a channel was open
    pub fn close(&mut self, destination: &str) -> Option<Message> {
        if !self.open.remove(destination) {
            return None;
        }
        debug!("Closing virtual connection to {}", destination);
        Some(build_close(&self.source_id, destination))
    }

    /// The device closed the channel from `source`
    pub fn closed_by_peer(&mut self, source: &str) -> bool {
        self.open.remove(source)
    }

    /// Follow the running application.
    ///
    /// When the app transport changes, the channel to the previous transport
    /// is closed, and a channel to the new one is opened if the app serves
    /// any of `registered` namespaces. Returns the messages to write.
    pub fn on_receiver_status(
        &mut self,
        status: &ReceiverStatus,
        registered: &[String],
    ) -> Vec<Message> {
        if status.transport_id == self.app_transport {
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(previous) = self.app_transport.take() {
            out.extend(self.close(&previous));
        }
        self.app_transport = status.transport_id.clone();

        if let Some(transport) = &status.transport_id {
            let wanted = status
                .namespaces
                .iter()
                .any(|namespace| registered.contains(namespace));
            if wanted {
                let transport = transport.clone();
                out.extend(self.ensure_open(&transport));
            }
        }
        out
    }
}
