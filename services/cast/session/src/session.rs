//! The worker loop of one established connection.
//!
//! The loop owns the socket, the frame decoder and the per-session channel
//! table, and borrows the dispatcher from the supervisor for the lifetime of
//! the session. Every socket read/write and every dispatcher mutation happens
//! here; other tasks only reach it through the command queue.

use crate::channels::{build_get_status, ReceiverStatus, VirtualChannels};
use crate::client::ClientConfig;
use crate::dispatcher::{Dispatcher, NamespaceHandler, RequestOutcome};
use crate::error::{RequestError, TransportError};
use crate::keepalive::{build_ping, build_pong, Heartbeat};
use crate::state::{Connection, ConnectionState, ConnectionStatus, ErrorCause};
use bytes::BytesMut;
use cast_wire::{
    encode, FrameDecoder, Message, NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER,
    PLATFORM_DESTINATION_ID, TYPE_CLOSE, TYPE_PING, TYPE_PONG, TYPE_RECEIVER_STATUS,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Requests crossing into the worker
pub enum Command {
    /// Write a message, optionally tracking its reply
    Submit {
        /// Message to write
        message: Message,
        /// Whether the caller awaits a correlated reply
        awaits_reply: bool,
        /// Completion slot, present when a reply is tracked
        slot: Option<oneshot::Sender<RequestOutcome>>,
        /// Told once the frame is written, or why it was not
        written: Option<oneshot::Sender<Result<(), RequestError>>>,
        /// Bound on waiting for the reply
        timeout: Duration,
    },
    /// Attach a handler to a namespace
    Register {
        /// Namespace
        namespace: String,
        /// Non-owning handler reference
        handler: Weak<dyn NamespaceHandler>,
    },
    /// Detach the handler of a namespace
    Unregister {
        /// Namespace
        namespace: String,
    },
    /// Close the connection and stop the worker
    Shutdown,
}

/// State shared by the supervisor and the session loop
pub(crate) struct WorkerContext {
    pub config: ClientConfig,
    pub address: SocketAddr,
    /// Device label for log lines
    pub device: String,
    pub status: watch::Sender<ConnectionStatus>,
    pub receiver: watch::Sender<Option<ReceiverStatus>>,
    pub request_ids: Arc<AtomicU64>,
}

impl WorkerContext {
    /// Publish the state of `connection` to observers
    pub fn publish(&self, connection: &Connection) {
        info!(
            "Connection to {} (generation {}) is {}",
            self.device,
            connection.generation(),
            connection.state()
        );
        self.status
            .send_replace(ConnectionStatus::of(connection, self.address));
    }

    /// Apply a transition and publish it
    pub fn advance(
        &self,
        connection: &mut Connection,
        next: ConnectionState,
    ) -> Result<(), ErrorCause> {
        connection.transition(next).map_err(|e| {
            error!("{}", e);
            ErrorCause::Transport(e.to_string())
        })?;
        self.publish(connection);
        Ok(())
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Shutdown was requested
    Shutdown,
    /// The connection failed
    Failed(ErrorCause),
}

/// Apply a command that arrives while no session is established
pub(crate) fn handle_offline_command(command: Command, dispatcher: &mut Dispatcher) {
    match command {
        Command::Submit {
            message,
            slot,
            written,
            ..
        } => {
            debug!("Not connected, rejecting message on {}", message.namespace);
            if let Some(slot) = slot {
                let _ = slot.send(Err(RequestError::NotConnected));
            }
            if let Some(written) = written {
                let _ = written.send(Err(RequestError::NotConnected));
            }
        }
        Command::Register { namespace, handler } => dispatcher.register(namespace, handler),
        Command::Unregister { namespace } => {
            dispatcher.unregister(&namespace);
        }
        // Handled by the caller
        Command::Shutdown => {}
    }
}

struct SessionLoop<'a, S> {
    stream: S,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    generation: u64,
    dispatcher: &'a mut Dispatcher,
    ctx: &'a WorkerContext,
    heartbeat: Heartbeat,
    channels: VirtualChannels,
}

/// Drive an established connection until it fails or shutdown is requested.
///
/// `read_buf` carries bytes that arrived after the auth reply.
pub(crate) async fn run_session<S>(
    stream: S,
    read_buf: BytesMut,
    connection: &mut Connection,
    dispatcher: &mut Dispatcher,
    commands: &mut mpsc::Receiver<Command>,
    ctx: &WorkerContext,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = SessionLoop {
        stream,
        read_buf,
        decoder: FrameDecoder::with_max_frame_size(ctx.config.max_frame_size),
        generation: connection.generation(),
        dispatcher,
        ctx,
        heartbeat: Heartbeat::new(ctx.config.heartbeat, Instant::now()),
        channels: VirtualChannels::new(&ctx.config.source_id, &ctx.config.user_agent),
    };

    if let Err(cause) = session.open().await {
        return SessionEnd::Failed(cause);
    }

    loop {
        // Frames that arrived together with the auth reply
        if let Err(cause) = session.drain_frames().await {
            return SessionEnd::Failed(cause);
        }

        let deadline = session.next_deadline();

        tokio::select! {
            biased;

            command = commands.recv() => {
                match command {
                    Some(Command::Shutdown) | None => {
                        if ctx.advance(connection, ConnectionState::Closing).is_ok() {
                            session.close().await;
                        }
                        return SessionEnd::Shutdown;
                    }
                    Some(command) => {
                        if let Err(cause) = session.handle_command(command).await {
                            return SessionEnd::Failed(cause);
                        }
                    }
                }
            }

            read = session.stream.read_buf(&mut session.read_buf) => {
                match read {
                    Ok(0) => {
                        info!("Connection to {} closed by device", ctx.device);
                        return SessionEnd::Failed(ErrorCause::PeerClosed);
                    }
                    Ok(n) => trace!("Read {} bytes from {}", n, ctx.device),
                    Err(e) => {
                        warn!("Read from {} failed: {}", ctx.device, e);
                        return SessionEnd::Failed(ErrorCause::Transport(e.to_string()));
                    }
                }
            }

            _ = sleep_until(deadline) => {
                if let Err(cause) = session.on_tick().await {
                    return SessionEnd::Failed(cause);
                }
            }
        }
    }
}

impl<S> SessionLoop<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Open the platform channel and ask for the receiver status
    async fn open(&mut self) -> Result<(), ErrorCause> {
        if let Some(connect) = self.channels.ensure_open(PLATFORM_DESTINATION_ID) {
            self.write(&connect).await?;
        }
        self.request_status().await
    }

    async fn request_status(&mut self) -> Result<(), ErrorCause> {
        let get_status = build_get_status(&self.ctx.config.source_id, self.ctx.next_request_id());
        self.write(&get_status).await
    }

    /// Best-effort goodbye: CLOSE every open channel, then shut the socket
    async fn close(&mut self) {
        for destination in self.channels.open_destinations() {
            if let Some(close) = self.channels.close(&destination) {
                if let Err(cause) = self.write(&close).await {
                    debug!("CLOSE to {} not delivered: {}", destination, cause);
                    break;
                }
            }
        }
        let _ = tokio::time::timeout(self.ctx.config.io_timeout, self.stream.shutdown()).await;
    }

    fn next_deadline(&self) -> Instant {
        match self.dispatcher.next_deadline() {
            Some(request) => request.min(self.heartbeat.next_deadline()),
            None => self.heartbeat.next_deadline(),
        }
    }

    async fn on_tick(&mut self) -> Result<(), ErrorCause> {
        let now = Instant::now();

        if self.heartbeat.is_expired(now) {
            warn!(
                "No PONG from {} within {:?}, treating device as dead",
                self.ctx.device, self.ctx.config.heartbeat.pong_timeout
            );
            return Err(ErrorCause::HeartbeatTimeout);
        }

        if self.heartbeat.ping_due(now) {
            let ping = build_ping(&self.ctx.config.source_id);
            self.write(&ping).await?;
            self.heartbeat.ping_sent(now);
        }

        let expired = self.dispatcher.expire(now);
        if expired > 0 {
            debug!("{} request(s) timed out", expired);
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ErrorCause> {
        match command {
            Command::Submit {
                message,
                awaits_reply,
                slot,
                written,
                timeout,
            } => {
                let result = self.submit(message, awaits_reply, slot, timeout).await;
                if let Some(written) = written {
                    let _ = written.send(match &result {
                        Ok(outcome) => outcome.clone(),
                        Err(_) => Err(RequestError::NotConnected),
                    });
                }
                result.map(|_| ())
            }
            Command::Register { namespace, handler } => {
                self.dispatcher.register(namespace.clone(), handler);
                self.join_app_for(&namespace).await
            }
            Command::Unregister { namespace } => {
                self.dispatcher.unregister(&namespace);
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn submit(
        &mut self,
        message: Message,
        awaits_reply: bool,
        slot: Option<oneshot::Sender<RequestOutcome>>,
        timeout: Duration,
    ) -> Result<Result<(), RequestError>, ErrorCause> {
        // Encode first: an oversized message fails alone
        let frame = match encode(&message, self.ctx.config.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot send message on {}: {}", message.namespace, e);
                let rejected = RequestError::Encode(e.to_string());
                if let Some(slot) = slot {
                    let _ = slot.send(Err(rejected.clone()));
                }
                return Ok(Err(rejected));
            }
        };

        // The record must exist before the frame hits the wire
        if let Some(slot) = slot {
            let deadline = Instant::now() + timeout;
            let tracked =
                self.dispatcher
                    .submit(&message, awaits_reply, slot, deadline, self.generation);
            if tracked.is_none() {
                return Ok(Err(RequestError::Duplicate(
                    message.request_id().unwrap_or_default(),
                )));
            }
        }

        if let Some(connect) = self.channels.ensure_open(&message.destination_id) {
            self.write(&connect).await?;
        }

        debug!("Sending {}", message);
        self.write_frame(&frame).await?;
        Ok(Ok(()))
    }

    /// Open the app channel if the running app serves `namespace`
    async fn join_app_for(&mut self, namespace: &str) -> Result<(), ErrorCause> {
        let transport = {
            let receiver = self.ctx.receiver.borrow();
            match receiver.as_ref() {
                Some(status) if status.namespaces.iter().any(|ns| ns == namespace) => {
                    status.transport_id.clone()
                }
                _ => None,
            }
        };

        if let Some(transport) = transport {
            if let Some(connect) = self.channels.ensure_open(&transport) {
                self.write(&connect).await?;
            }
        }
        Ok(())
    }

    async fn drain_frames(&mut self) -> Result<(), ErrorCause> {
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(message)) => self.on_message(message).await?,
                Ok(None) => return Ok(()),
                Err(e) if !e.is_fatal() => {
                    warn!("Dropping message from {}: {}", self.ctx.device, e);
                }
                Err(e) => {
                    error!("Framing error from {}: {}", self.ctx.device, e);
                    return Err(ErrorCause::Frame(e.to_string()));
                }
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), ErrorCause> {
        if message.namespace == NS_HEARTBEAT {
            trace!("Received {}", message);
        } else {
            debug!("Received {}", message);
        }

        match (message.namespace.as_str(), message.message_type()) {
            (NS_HEARTBEAT, Some(TYPE_PING)) => {
                let pong = build_pong(&self.ctx.config.source_id);
                self.write(&pong).await?;
            }
            (NS_HEARTBEAT, Some(TYPE_PONG)) => {
                if let Some(rtt) = self.heartbeat.pong_received(Instant::now()) {
                    trace!("Heartbeat RTT to {}: {:?}", self.ctx.device, rtt);
                }
            }
            (NS_CONNECTION, Some(TYPE_CLOSE)) => {
                if message.source_id == PLATFORM_DESTINATION_ID {
                    info!("Device {} closed the platform channel", self.ctx.device);
                    return Err(ErrorCause::PeerClosed);
                }
                if self.channels.closed_by_peer(&message.source_id) {
                    debug!("Device closed channel {}", message.source_id);
                }
                self.request_status().await?;
            }
            (NS_RECEIVER, Some(TYPE_RECEIVER_STATUS)) => self.on_receiver_status(&message).await?,
            _ => {}
        }

        let report = self.dispatcher.on_frame_received(&message, self.generation);
        trace!(
            "Dispatched message on {}: correlated={} delivery={:?}",
            message.namespace,
            report.correlated,
            report.delivery
        );
        Ok(())
    }

    async fn on_receiver_status(&mut self, message: &Message) -> Result<(), ErrorCause> {
        let Some(data) = message.data() else {
            return Ok(());
        };
        let Some(status) = ReceiverStatus::parse(data, &self.ctx.config.quirks) else {
            debug!("Receiver status without status object from {}", self.ctx.device);
            return Ok(());
        };

        let registered = self.dispatcher.registered_namespaces();
        let previous_transport = self.channels.app_transport().map(str::to_string);
        let writes = self.channels.on_receiver_status(&status, &registered);
        if status.transport_id != previous_transport {
            info!(
                "Running application on {}: {}",
                self.ctx.device,
                status.display_name.as_deref().unwrap_or("none")
            );
        }
        self.ctx.receiver.send_replace(Some(status));

        for message in writes {
            self.write(&message).await?;
        }
        Ok(())
    }

    async fn write(&mut self, message: &Message) -> Result<(), ErrorCause> {
        let frame = encode(message, self.ctx.config.max_frame_size)
            .map_err(|e| ErrorCause::Frame(e.to_string()))?;
        if message.namespace != NS_HEARTBEAT {
            trace!("Writing {}", message);
        }
        self.write_frame(&frame).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ErrorCause> {
        let write = async {
            self.stream.write_all(frame).await?;
            self.stream.flush().await?;
            Ok::<(), TransportError>(())
        };
        match tokio::time::timeout(self.ctx.config.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", self.ctx.device, e);
                Err(ErrorCause::Transport(e.to_string()))
            }
            Err(_) => {
                warn!("Write to {} timed out", self.ctx.device);
                Err(ErrorCause::Transport("write timed out".to_string()))
            }
        }
    }
}
