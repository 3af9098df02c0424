//! Public client handle and the supervisor task behind it.

use crate::auth::{AuthPreferences, TrustAnchors};
use crate::channels::{DeviceQuirks, ReceiverStatus, DEFAULT_USER_AGENT};
use crate::connector::Connector;
use crate::dispatcher::{Dispatcher, NamespaceHandler, RequestOutcome};
use crate::error::{ClientError, RequestError};
use crate::keepalive::HeartbeatConfig;
use crate::reconnect::ReconnectPolicy;
use crate::session::{handle_offline_command, run_session, Command, SessionEnd, WorkerContext};
use crate::state::{Connection, ConnectionState, ConnectionStatus, ErrorCause};
use cast_wire::{
    Message, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SOURCE_ID, NS_RECEIVER, PLATFORM_DESTINATION_ID,
    REQUEST_ID, TYPE_GET_STATUS,
};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Default Cast V2 port
pub const DEFAULT_PORT: u16 = 8009;

/// A Cast device as found by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Device address
    pub address: IpAddr,
    /// Device port
    pub port: u16,
    /// Name advertised by the device
    pub friendly_name: Option<String>,
    /// Expected SHA-256 fingerprint of the TLS certificate, hex
    pub fingerprint_hint: Option<String>,
}

impl Endpoint {
    /// Endpoint on the default port
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: DEFAULT_PORT,
            friendly_name: None,
            fingerprint_hint: None,
        }
    }

    /// Use a non-default port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Attach the advertised name
    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    /// Address to dial
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// `Name (address:port)`, or the bare address when no name is known
    pub fn label(&self) -> String {
        match &self.friendly_name {
            Some(name) => format!("{} ({})", name, self.socket_addr()),
            None => self.socket_addr().to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our source id on the wire
    pub source_id: String,
    /// User agent announced on CONNECT
    pub user_agent: String,
    /// Bound on TCP connect, TLS handshake and the auth reply
    pub connect_timeout: Duration,
    /// Default bound on waiting for a request's reply
    pub request_timeout: Duration,
    /// Bound on a single socket write
    pub io_timeout: Duration,
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// Algorithms requested in the auth challenge
    pub auth: AuthPreferences,
    /// Roots and revocation lists for device certificates
    pub trust_anchors: TrustAnchors,
    /// Reconnect schedule
    pub reconnect: ReconnectPolicy,
    /// Per-device workarounds
    pub quirks: DeviceQuirks,
    /// Capacity of the command queue
    pub command_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            source_id: DEFAULT_SOURCE_ID.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            auth: AuthPreferences::default(),
            trust_anchors: TrustAnchors::new(),
            reconnect: ReconnectPolicy::default(),
            quirks: DeviceQuirks::default(),
            command_queue: 256,
        }
    }
}

/// Pending reply to a submitted request
#[derive(Debug)]
pub struct RequestHandle {
    request_id: u64,
    reply: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    /// Id the reply is correlated by
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the reply or the reason there is none
    pub async fn wait(self) -> RequestOutcome {
        self.reply.await.unwrap_or(Err(RequestError::Cancelled))
    }
}

/// Handle to a persistent authenticated connection.
///
/// Cheap to clone. All clones talk to the same supervisor task, which
/// reconnects per the configured policy until [`CastClient::close`] is called
/// or a failure is not retryable.
#[derive(Clone)]
pub struct CastClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    receiver: watch::Receiver<Option<ReceiverStatus>>,
    request_ids: Arc<AtomicU64>,
    source_id: String,
    request_timeout: Duration,
    quirks: DeviceQuirks,
}

impl CastClient {
    /// Start connecting to `endpoint`. Must be called within a tokio runtime.
    pub fn spawn(endpoint: Endpoint, config: ClientConfig) -> anyhow::Result<Self> {
        if config.source_id.is_empty() {
            anyhow::bail!("source id must not be empty");
        }
        if config.command_queue == 0 {
            anyhow::bail!("command queue capacity must be positive");
        }

        let address = endpoint.socket_addr();
        let device = endpoint.label();
        let connector = Connector::new(endpoint)?;
        let connection = Connection::new(1);

        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::of(&connection, address));
        let (receiver_tx, receiver_rx) = watch::channel(None);
        // Request id 0 is reserved for unsolicited device messages
        let request_ids = Arc::new(AtomicU64::new(1));

        let client = Self {
            commands: commands_tx,
            status: status_rx,
            receiver: receiver_rx,
            request_ids: request_ids.clone(),
            source_id: config.source_id.clone(),
            request_timeout: config.request_timeout,
            quirks: config.quirks.clone(),
        };

        let ctx = WorkerContext {
            config,
            address,
            device,
            status: status_tx,
            receiver: receiver_tx,
            request_ids,
        };
        tokio::spawn(supervise(connector, connection, commands_rx, ctx));

        Ok(client)
    }

    /// Route messages on `namespace` to `handler`.
    ///
    /// Only a weak reference is kept; dropping the last `Arc` unregisters.
    pub async fn register<H>(&self, namespace: &str, handler: &Arc<H>) -> Result<(), ClientError>
    where
        H: NamespaceHandler + 'static,
    {
        let handler: Arc<dyn NamespaceHandler> = handler.clone();
        let handler: Weak<dyn NamespaceHandler> = Arc::downgrade(&handler);
        self.command(Command::Register {
            namespace: namespace.to_string(),
            handler,
        })
        .await
    }

    /// Stop routing messages on `namespace`
    pub async fn unregister(&self, namespace: &str) -> Result<(), ClientError> {
        self.command(Command::Unregister {
            namespace: namespace.to_string(),
        })
        .await
    }

    /// Queue `message` for writing.
    ///
    /// With `awaits_reply` the message must carry a request id and a handle
    /// to its reply is returned. Without it, this returns once the frame is
    /// written, or with [`ClientError::NotConnected`] when it was not.
    pub async fn submit(
        &self,
        message: Message,
        awaits_reply: bool,
    ) -> Result<Option<RequestHandle>, ClientError> {
        self.submit_with_timeout(message, awaits_reply, self.request_timeout)
            .await
    }

    /// [`CastClient::submit`] with an explicit reply timeout
    pub async fn submit_with_timeout(
        &self,
        message: Message,
        awaits_reply: bool,
        timeout: Duration,
    ) -> Result<Option<RequestHandle>, ClientError> {
        if !awaits_reply {
            let (written, ack) = oneshot::channel();
            self.command(Command::Submit {
                message,
                awaits_reply,
                slot: None,
                written: Some(written),
                timeout,
            })
            .await?;
            return match ack.await {
                Ok(Ok(())) => Ok(None),
                Ok(Err(RequestError::Encode(reason))) => Err(ClientError::InvalidMessage(reason)),
                Ok(Err(RequestError::NotConnected)) => Err(ClientError::NotConnected),
                Ok(Err(_)) | Err(_) => Err(ClientError::Closed),
            };
        }

        let request_id = message.request_id().ok_or_else(|| {
            ClientError::InvalidMessage("a request needs a requestId".to_string())
        })?;
        let (slot, reply) = oneshot::channel();
        self.command(Command::Submit {
            message,
            awaits_reply,
            slot: Some(slot),
            written: None,
            timeout,
        })
        .await?;

        Ok(Some(RequestHandle { request_id, reply }))
    }

    /// JSON message without a tracked reply; returns once it is written
    pub async fn send(
        &self,
        namespace: &str,
        destination: &str,
        payload: Value,
    ) -> Result<(), ClientError> {
        let message = Message::json(namespace, self.source_id.as_str(), destination, payload);
        self.submit(message, false).await.map(|_| ())
    }

    /// Send a JSON request and wait for the correlated reply.
    ///
    /// A `requestId` is assigned when the payload has none.
    pub async fn request(
        &self,
        namespace: &str,
        destination: &str,
        mut payload: Value,
    ) -> Result<Value, RequestError> {
        let Some(object) = payload.as_object_mut() else {
            return Err(RequestError::Encode("payload must be a JSON object".to_string()));
        };
        if !object.contains_key(REQUEST_ID) {
            let id = self.next_request_id();
            object.insert(REQUEST_ID.to_string(), json!(id));
        }

        let message = Message::json(namespace, self.source_id.as_str(), destination, payload);
        match self.submit(message, true).await {
            Ok(Some(handle)) => handle.wait().await,
            Ok(None) => Err(RequestError::Encode("payload has no usable requestId".to_string())),
            Err(ClientError::InvalidMessage(reason)) => Err(RequestError::Encode(reason)),
            Err(ClientError::NotConnected) => Err(RequestError::NotConnected),
            Err(_) => Err(RequestError::Closed),
        }
    }

    /// Fire-and-forget message to the platform receiver
    pub async fn send_platform(&self, payload: Value) -> Result<(), ClientError> {
        self.send(NS_RECEIVER, PLATFORM_DESTINATION_ID, payload).await
    }

    /// Request to the platform receiver
    pub async fn request_platform(&self, payload: Value) -> Result<Value, RequestError> {
        self.request(NS_RECEIVER, PLATFORM_DESTINATION_ID, payload)
            .await
    }

    /// Message to the running application on one of its namespaces
    pub async fn send_app(&self, namespace: &str, payload: Value) -> Result<(), ClientError> {
        let destination = self.app_destination(namespace).map_err(|e| match e {
            RequestError::UnsupportedNamespace(ns) => ClientError::UnsupportedNamespace(ns),
            _ => ClientError::NotConnected,
        })?;
        self.send(namespace, &destination, payload).await
    }

    /// Request to the running application on one of its namespaces
    pub async fn request_app(&self, namespace: &str, payload: Value) -> Result<Value, RequestError> {
        let destination = self.app_destination(namespace)?;
        self.request(namespace, &destination, payload).await
    }

    /// Transport id of the running app, if it serves `namespace`
    fn app_destination(&self, namespace: &str) -> Result<String, RequestError> {
        let receiver = self.receiver.borrow();
        let Some(status) = receiver.as_ref() else {
            return Err(RequestError::NotConnected);
        };
        let Some(transport) = &status.transport_id else {
            debug!("No application running, cannot use {}", namespace);
            return Err(RequestError::NotConnected);
        };
        if !status.namespaces.iter().any(|ns| ns == namespace) {
            return Err(RequestError::UnsupportedNamespace(namespace.to_string()));
        }
        Ok(transport.clone())
    }

    /// Ask the device for a fresh receiver status
    pub async fn get_status(&self) -> Result<Option<ReceiverStatus>, RequestError> {
        let reply = self
            .request_platform(json!({ "type": TYPE_GET_STATUS }))
            .await?;
        Ok(ReceiverStatus::parse(&reply, &self.quirks))
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Observer of connection state changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Last receiver status seen on the current connection
    pub fn receiver_status(&self) -> Option<ReceiverStatus> {
        self.receiver.borrow().clone()
    }

    /// Observer of receiver status updates
    pub fn watch_receiver_status(&self) -> watch::Receiver<Option<ReceiverStatus>> {
        self.receiver.clone()
    }

    /// Wait until the connection is `Established`.
    ///
    /// Fails early on an auth failure or when the client stops for good.
    pub async fn wait_established(&self, timeout: Duration) -> Result<ConnectionStatus, ClientError> {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    match &current.state {
                        ConnectionState::Established => return Ok(current.clone()),
                        ConnectionState::Error(ErrorCause::Auth(failure)) => {
                            return Err(ClientError::Auth(failure.clone()))
                        }
                        ConnectionState::Closing | ConnectionState::Closed => {
                            return Err(ClientError::Closed)
                        }
                        _ => {}
                    }
                }

                if status.changed().await.is_err() {
                    // Supervisor is gone; the last state says why
                    let last = status.borrow().clone();
                    return match last.state {
                        ConnectionState::Established => Ok(last),
                        ConnectionState::Error(cause) => Err(ClientError::Failed(cause)),
                        _ => Err(ClientError::Closed),
                    };
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(ClientError::Timeout))
    }

    /// Close the connection and stop the supervisor.
    ///
    /// Pending requests complete with `Cancelled`. Returns once the
    /// supervisor has finished.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }

    /// Whether the supervisor is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

/// Owns the dispatcher and the command queue for the life of the client.
///
/// Each iteration is one connection generation: establish, run the session,
/// then decide whether to retry.
async fn supervise(
    mut connector: Connector,
    mut connection: Connection,
    mut commands: mpsc::Receiver<Command>,
    ctx: WorkerContext,
) {
    let mut dispatcher = Dispatcher::new();
    let mut retries: u32 = 0;

    info!("Starting Cast client for {}", ctx.device);

    loop {
        let established = {
            let connect = connector.establish(&mut connection, &ctx);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    command = commands.recv() => match command {
                        Some(Command::Shutdown) | None => break None,
                        Some(command) => handle_offline_command(command, &mut dispatcher),
                    },
                }
            }
        };

        let end = match established {
            None => SessionEnd::Shutdown,
            Some(Ok((stream, read_buf))) => {
                retries = 0;
                run_session(
                    stream,
                    read_buf,
                    &mut connection,
                    &mut dispatcher,
                    &mut commands,
                    &ctx,
                )
                .await
            }
            Some(Err(cause)) => SessionEnd::Failed(cause),
        };

        match end {
            SessionEnd::Shutdown => {
                shut_down(&mut connection, &mut dispatcher, &ctx);
                return;
            }
            SessionEnd::Failed(cause) => {
                if connection.fail(cause.clone()).is_ok() {
                    ctx.publish(&connection);
                }
                ctx.receiver.send_replace(None);

                let next = connection.next_attempt();
                let stale = dispatcher.invalidate(next.generation());
                if stale > 0 {
                    debug!("{} request(s) of generation {} are stale", stale, connection.generation());
                }

                if !ctx.config.reconnect.should_retry(&cause) {
                    error!("Giving up on {}: {}", ctx.device, cause);
                    dispatcher.cancel_all();
                    return;
                }

                retries += 1;
                let Some(delay) = ctx.config.reconnect.delay_for(retries) else {
                    error!("Giving up on {} after {} retries: {}", ctx.device, retries - 1, cause);
                    dispatcher.cancel_all();
                    return;
                };

                warn!("Reconnecting to {} in {:?} (retry {})", ctx.device, delay, retries);
                connection = next;
                if !backoff(delay, &mut commands, &mut dispatcher).await {
                    shut_down(&mut connection, &mut dispatcher, &ctx);
                    return;
                }
            }
        }
    }
}

/// Sleep before a retry. Returns false when shutdown was requested.
async fn backoff(
    delay: Duration,
    commands: &mut mpsc::Receiver<Command>,
    dispatcher: &mut Dispatcher,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => return false,
                Some(command) => handle_offline_command(command, dispatcher),
            },
        }
    }
}

fn shut_down(connection: &mut Connection, dispatcher: &mut Dispatcher, ctx: &WorkerContext) {
    let cancelled = dispatcher.cancel_all();
    if cancelled > 0 {
        debug!("Cancelled {} pending request(s)", cancelled);
    }
    if !matches!(connection.state(), ConnectionState::Closing) {
        let _ = ctx.advance(connection, ConnectionState::Closing);
    }
    let _ = ctx.advance(connection, ConnectionState::Closed);
    ctx.receiver.send_replace(None);
    info!("Cast client for {} stopped", ctx.device);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthFailure;
    use crate::testing::{
        Behavior, DevicePki, FakeDevice, APP_TRANSPORT, NS_DROP, NS_ECHO, NS_SILENT,
    };

    fn endpoint(device: &FakeDevice) -> Endpoint {
        Endpoint::new(device.addr.ip()).with_port(device.addr.port())
    }

    fn config(root_der: &[u8]) -> ClientConfig {
        ClientConfig {
            trust_anchors: TrustAnchors::from_der([root_der.to_vec()]).unwrap(),
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn wait_for<F>(client: &CastClient, mut predicate: F) -> ConnectionStatus
    where
        F: FnMut(&ConnectionStatus) -> bool,
    {
        let mut status = client.watch_status();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if predicate(&status.borrow_and_update()) {
                    return status.borrow().clone();
                }
                status.changed().await.unwrap();
            }
        })
        .await;
        found.unwrap()
    }

    async fn wait_for_receiver(client: &CastClient) -> ReceiverStatus {
        let mut receiver = client.watch_receiver_status();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(status) = receiver.borrow_and_update().clone() {
                    return status;
                }
                receiver.changed().await.unwrap();
            }
        })
        .await;
        found.unwrap()
    }

    /// A port nothing listens on
    async fn dead_endpoint() -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::new(addr.ip()).with_port(addr.port())
    }

    #[tokio::test]
    async fn test_authenticated_device_reaches_established() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();

        let status = client.wait_established(Duration::from_secs(10)).await.unwrap();
        assert_eq!(status.generation, 1);
        assert_eq!(status.address, device.addr);

        let receiver = client.get_status().await.unwrap().unwrap();
        assert_eq!(receiver.is_active_input, Some(true));
        assert_eq!(receiver.volume_level, Some(0.5));

        client.close().await;
        assert_eq!(client.status().state, ConnectionState::Closed);
        assert!(!client.is_running());
        assert_eq!(device.accepted(), 1);
    }

    #[tokio::test]
    async fn test_expired_device_certificate_never_establishes() {
        let pki = DevicePki::generate((2020, 1, 1), (2021, 1, 1));
        let device = FakeDevice::start(pki, Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();

        let result = client.wait_established(Duration::from_secs(10)).await;
        assert_eq!(result, Err(ClientError::Auth(AuthFailure::ExpiredCert)));

        // Terminal: no retry
        client.close().await;
        assert_eq!(
            client.status().state,
            ConnectionState::Error(ErrorCause::Auth(AuthFailure::ExpiredCert))
        );
        assert_eq!(device.accepted(), 1);
    }

    #[tokio::test]
    async fn test_unknown_root_is_untrusted() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let other = DevicePki::valid();
        let client = CastClient::spawn(endpoint(&device), config(&other.root_der)).unwrap();

        let result = client.wait_established(Duration::from_secs(10)).await;
        assert!(matches!(
            result,
            Err(ClientError::Auth(AuthFailure::ChainUntrusted(_)))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_answered_out_of_order() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        // The device holds both and answers the second first
        let (first, second) = tokio::join!(
            client.request(NS_ECHO, PLATFORM_DESTINATION_ID, json!({"tag": "first", "batch": 2})),
            client.request(NS_ECHO, PLATFORM_DESTINATION_ID, json!({"tag": "second", "batch": 2})),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first["tag"], "first");
        assert_eq!(second["tag"], "second");
        assert_eq!(first["echo"], true);
        assert_ne!(first[REQUEST_ID], second[REQUEST_ID]);

        client.close().await;
    }

    #[tokio::test]
    async fn test_request_of_dropped_session_is_stale_and_client_reconnects() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        let message = Message::json(
            NS_SILENT,
            DEFAULT_SOURCE_ID,
            PLATFORM_DESTINATION_ID,
            json!({"type": "WAIT", "requestId": 9000}),
        );
        let pending = client.submit(message, true).await.unwrap().unwrap();
        assert_eq!(pending.request_id(), 9000);
        client
            .send(NS_DROP, PLATFORM_DESTINATION_ID, json!({"type": "DROP"}))
            .await
            .unwrap();

        assert_eq!(pending.wait().await, Err(RequestError::Stale));

        let status = wait_for(&client, |s| {
            s.generation == 2 && s.state == ConnectionState::Established
        })
        .await;
        assert_eq!(status.generation, 2);
        assert_eq!(device.accepted(), 2);

        client.close().await;
    }

    #[tokio::test]
    async fn test_missing_pongs_trigger_reconnect() {
        let behavior = Behavior {
            answer_pings: false,
            ..Default::default()
        };
        let device = FakeDevice::start(DevicePki::valid(), behavior).await;
        let mut config = config(&device.root_der);
        config.heartbeat = HeartbeatConfig {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(200),
        };
        // Long enough for the Error state to be observed before the retry
        config.reconnect.initial_backoff = Duration::from_millis(500);
        config.reconnect.max_backoff = Duration::from_secs(1);
        let client = CastClient::spawn(endpoint(&device), config).unwrap();

        let failed = wait_for(&client, |s| matches!(s.state, ConnectionState::Error(_))).await;
        assert_eq!(
            failed.state,
            ConnectionState::Error(ErrorCause::HeartbeatTimeout)
        );
        wait_for(&client, |s| s.generation >= 2).await;

        client.close().await;
    }

    #[tokio::test]
    async fn test_requests_while_offline_fail_fast() {
        let client = CastClient::spawn(dead_endpoint().await, ClientConfig::default()).unwrap();

        let result = client
            .request_platform(json!({"type": "GET_STATUS"}))
            .await;
        assert_eq!(result, Err(RequestError::NotConnected));
        assert_eq!(
            client.wait_established(Duration::from_millis(300)).await,
            Err(ClientError::Timeout)
        );

        client.close().await;
        assert_eq!(client.status().state, ConnectionState::Closed);
        assert_eq!(
            client.send_platform(json!({"type": "PING"})).await,
            Err(ClientError::Closed)
        );
    }

    #[tokio::test]
    async fn test_send_while_offline_reports_not_connected() {
        let client = CastClient::spawn(dead_endpoint().await, ClientConfig::default()).unwrap();

        assert_eq!(
            client.send_platform(json!({"type": "LAUNCH"})).await,
            Err(ClientError::NotConnected)
        );
        let message = Message::json(NS_ECHO, "sender-0", "web-1", json!({"type": "HELLO"}));
        assert!(matches!(
            client.submit(message, false).await,
            Err(ClientError::NotConnected)
        ));
        assert_ne!(client.status().state, ConnectionState::Established);

        client.close().await;
    }

    #[tokio::test]
    async fn test_app_messages_go_to_running_app() {
        let behavior = Behavior {
            app_running: true,
            ..Default::default()
        };
        let device = FakeDevice::start(DevicePki::valid(), behavior).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        let status = wait_for_receiver(&client).await;
        assert_eq!(status.transport_id.as_deref(), Some(APP_TRANSPORT));

        let reply = client
            .request_app(NS_ECHO, json!({"type": "HELLO"}))
            .await
            .unwrap();
        assert_eq!(reply["type"], "HELLO");
        assert_eq!(reply["echo"], true);
        assert_eq!(client.send_app(NS_ECHO, json!({"type": "NOTE"})).await, Ok(()));

        let other = "urn:x-cast:com.example.other";
        assert_eq!(
            client.request_app(other, json!({"type": "HELLO"})).await,
            Err(RequestError::UnsupportedNamespace(other.to_string()))
        );
        assert_eq!(
            client.send_app(other, json!({"type": "HELLO"})).await,
            Err(ClientError::UnsupportedNamespace(other.to_string()))
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_app_messages_without_running_app() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        let status = wait_for_receiver(&client).await;
        assert_eq!(status.transport_id, None);

        assert_eq!(
            client.request_app(NS_ECHO, json!({"type": "HELLO"})).await,
            Err(RequestError::NotConnected)
        );
        assert_eq!(
            client.send_app(NS_ECHO, json!({"type": "HELLO"})).await,
            Err(ClientError::NotConnected)
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_retry_limit_stops_client() {
        let mut config = ClientConfig::default();
        config.reconnect = ReconnectPolicy::never();
        let client = CastClient::spawn(dead_endpoint().await, config).unwrap();

        let result = client.wait_established(Duration::from_secs(10)).await;
        assert!(matches!(
            result,
            Err(ClientError::Failed(ErrorCause::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_cancels_pending_requests() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        let message = Message::json(
            NS_SILENT,
            DEFAULT_SOURCE_ID,
            PLATFORM_DESTINATION_ID,
            json!({"type": "WAIT", "requestId": 77}),
        );
        let pending = client.submit(message, true).await.unwrap().unwrap();

        client.close().await;
        assert_eq!(pending.wait().await, Err(RequestError::Cancelled));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let device = FakeDevice::start(DevicePki::valid(), Behavior::default()).await;
        let client = CastClient::spawn(endpoint(&device), config(&device.root_der)).unwrap();
        client.wait_established(Duration::from_secs(10)).await.unwrap();

        let message = Message::json(
            NS_SILENT,
            DEFAULT_SOURCE_ID,
            PLATFORM_DESTINATION_ID,
            json!({"type": "WAIT", "requestId": 5}),
        );
        let pending = client
            .submit_with_timeout(message, true, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.wait().await, Err(RequestError::Timeout));

        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_locally() {
        let client = CastClient::spawn(dead_endpoint().await, ClientConfig::default()).unwrap();

        let no_id = Message::json(NS_ECHO, DEFAULT_SOURCE_ID, PLATFORM_DESTINATION_ID, json!({}));
        assert!(matches!(
            client.submit(no_id, true).await,
            Err(ClientError::InvalidMessage(_))
        ));
        assert!(matches!(
            client.request(NS_ECHO, PLATFORM_DESTINATION_ID, json!([1, 2])).await,
            Err(RequestError::Encode(_))
        ));

        client.close().await;
    }

    #[test]
    fn test_endpoint_label() {
        let endpoint = Endpoint::new("192.168.1.40".parse().unwrap());
        assert_eq!(endpoint.label(), "192.168.1.40:8009");
        assert_eq!(
            endpoint.with_friendly_name("Living Room").with_port(8010).label(),
            "Living Room (192.168.1.40:8010)"
        );
    }

    #[test]
    fn test_spawn_rejects_empty_source_id() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let config = ClientConfig {
                source_id: String::new(),
                ..Default::default()
            };
            let endpoint = Endpoint::new(IpAddr::from([127, 0, 0, 1]));
            assert!(CastClient::spawn(endpoint, config).is_err());
        });
    }
}
