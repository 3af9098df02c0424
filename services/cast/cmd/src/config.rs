//! Configuration handling for the cast client.
//!
//! Values come from an optional YAML file, then `CAST_*` environment
//! variables; command line flags are applied last by `main`.

use anyhow::{Context, Result};
use cast_session::{
    ClientConfig, DeviceQuirks, Endpoint, HeartbeatConfig, ReconnectPolicy, TrustAnchors,
    DEFAULT_PORT,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Cast client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Device address
    pub host: Option<String>,
    /// Device name shown in log lines
    pub name: Option<String>,
    /// Device port
    pub port: u16,
    /// Source id used on the wire
    pub source_id: String,
    /// PEM file with the trusted device roots
    pub trust_anchors: Option<PathBuf>,
    /// CRL file (PEM or DER)
    pub crl: Option<PathBuf>,
    /// Expected SHA-256 fingerprint of the device's TLS certificate
    pub fingerprint: Option<String>,
    /// Connect, TLS and auth timeout, e.g. "10s"
    pub connect_timeout: String,
    /// Request timeout, e.g. "10s"
    pub request_timeout: String,
    /// Heartbeat timing
    pub heartbeat: HeartbeatSection,
    /// Reconnect schedule
    pub reconnect: ReconnectSection,
    /// Receiver status fields this device reports incorrectly
    pub ignored_status_fields: Vec<String>,
}

/// Heartbeat timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub ping_interval: String,
    pub pong_timeout: String,
}

/// Reconnect schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    /// Retries after a failure; absent retries forever
    pub max_retries: Option<u32>,
    pub initial_backoff: String,
    pub max_backoff: String,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            ping_interval: "10s".to_string(),
            pong_timeout: "10s".to_string(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff: "1s".to_string(),
            max_backoff: "30s".to_string(),
        }
    }
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            host: None,
            name: None,
            port: DEFAULT_PORT,
            source_id: "sender-0".to_string(),
            trust_anchors: None,
            crl: None,
            fingerprint: None,
            connect_timeout: "10s".to_string(),
            request_timeout: "10s".to_string(),
            heartbeat: HeartbeatSection::default(),
            reconnect: ReconnectSection::default(),
            ignored_status_fields: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    cast: Option<CastConfig>,
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {}: {:?}", field, value))
}

impl CastConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.cast.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CAST_*` overrides from `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CAST_HOST") {
            info!("Host overridden by environment: {}", host);
            self.host = Some(host);
        }

        if let Some(port) = lookup("CAST_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid CAST_PORT {:?}", port),
            }
        }

        if let Some(path) = lookup("CAST_TRUST_ANCHORS") {
            info!("Trust anchors overridden by environment: {}", path);
            self.trust_anchors = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("CAST_CRL") {
            info!("CRL overridden by environment: {}", path);
            self.crl = Some(PathBuf::from(path));
        }
    }

    /// Device endpoint described by this configuration
    pub fn endpoint(&self) -> Result<Endpoint> {
        let host = self
            .host
            .as_deref()
            .context("no device host configured (use --host, CAST_HOST or the config file)")?;
        let address: IpAddr = host
            .parse()
            .with_context(|| format!("invalid device address {:?}", host))?;

        let mut endpoint = Endpoint::new(address).with_port(self.port);
        endpoint.friendly_name = self.name.clone();
        endpoint.fingerprint_hint = self.fingerprint.clone();
        Ok(endpoint)
    }

    /// Library configuration, with trust material loaded from disk
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut trust_anchors = match &self.trust_anchors {
            Some(path) => TrustAnchors::load_pem_file(path)
                .with_context(|| format!("Failed to load trust anchors from {:?}", path))?,
            None => {
                warn!("No trust anchors configured, every device will fail authentication");
                TrustAnchors::new()
            }
        };
        if let Some(path) = &self.crl {
            trust_anchors
                .load_crl_file(path)
                .with_context(|| format!("Failed to load CRL from {:?}", path))?;
        }

        Ok(ClientConfig {
            source_id: self.source_id.clone(),
            connect_timeout: duration("connect_timeout", &self.connect_timeout)?,
            request_timeout: duration("request_timeout", &self.request_timeout)?,
            heartbeat: HeartbeatConfig {
                ping_interval: duration("heartbeat.ping_interval", &self.heartbeat.ping_interval)?,
                pong_timeout: duration("heartbeat.pong_timeout", &self.heartbeat.pong_timeout)?,
            },
            trust_anchors,
            reconnect: ReconnectPolicy {
                max_retries: self.reconnect.max_retries,
                initial_backoff: duration("reconnect.initial_backoff", &self.reconnect.initial_backoff)?,
                max_backoff: duration("reconnect.max_backoff", &self.reconnect.max_backoff)?,
                ..Default::default()
            },
            quirks: DeviceQuirks::ignoring(self.ignored_status_fields.iter().cloned()),
            ..Default::default()
        })
    }
}
