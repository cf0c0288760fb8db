// Connection manager: a single actor task that owns at most one live
// transport, reopens it according to the reconnection policy and keeps the
// heartbeat running while it is open.

use std::sync::Arc;

use chrono::Utc;
use draftline_core::protocol::{self, ClientMessage, MessageKind};
use draftline_core::reconnect::{
    CloseCause, ReconnectConfig, ReconnectPolicy, RetryDecision, CLOSE_NORMAL,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::heartbeat::{HeartbeatLink, HeartbeatMonitor};
use crate::transport::{Connector, Outbound, Transport, TransportError, TransportEvent};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected.
    Idle,
    Connecting,
    Open,
    /// Closed; a retry may be scheduled.
    Closed,
    /// Reconnection attempts exhausted. Only `connect()` leaves this state.
    Unreachable,
}

/// What the connection manager reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Status(ConnectionStatus),
    /// A text frame from the server.
    Frame(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection manager has shut down")]
    Gone,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub draft_id: String,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect { reason: String },
    Send(ClientMessage),
    SetBackground(bool),
    Shutdown,
}

/// Cloneable handle to the connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    /// Open the connection. A no-op while connecting or open. Failures are
    /// never returned here; they surface as status changes.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Connect).await
    }

    /// Close intentionally. No reconnection follows.
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<(), ConnectionError> {
        self.command(Command::Disconnect {
            reason: reason.into(),
        })
        .await
    }

    /// Send a message if the connection is open; dropped otherwise.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        self.command(Command::Send(message)).await
    }

    pub async fn set_background(&self, background: bool) -> Result<(), ConnectionError> {
        self.command(Command::SetBackground(background)).await
    }

    /// Disconnect and end the actor task.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.command(Command::Shutdown).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Gone)
    }
}

/// Start the connection actor. It stays idle until `connect()` is called.
pub fn spawn(
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::channel(256);
    let (stale_tx, stale_rx) = mpsc::unbounded_channel();

    let actor = Actor {
        connector,
        policy: ReconnectPolicy::new(settings.reconnect.clone()),
        settings,
        status_tx,
        events: event_tx,
        internal_tx,
        stale_tx,
        generation: 0,
        live: None,
        retry_at: None,
        stopped: false,
    };
    tokio::spawn(actor.run(command_rx, internal_rx, stale_rx));

    (
        ConnectionHandle {
            commands: command_tx,
            status: status_rx,
        },
        event_rx,
    )
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Internal {
    Opened {
        generation: u64,
        result: Result<Transport, TransportError>,
    },
    Event {
        generation: u64,
        event: TransportEvent,
    },
}

struct Live {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    ack: watch::Sender<Instant>,
    heartbeat: HeartbeatMonitor,
    reader: JoinHandle<()>,
}

struct Actor {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    policy: ReconnectPolicy,
    status_tx: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    internal_tx: mpsc::Sender<Internal>,
    stale_tx: mpsc::UnboundedSender<u64>,
    /// Bumped for every connection attempt and every intentional close;
    /// anything tagged with an older generation is ignored.
    generation: u64,
    live: Option<Live>,
    retry_at: Option<Instant>,
    /// Set by intentional closes. Checked before a scheduled retry fires.
    stopped: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut stale: mpsc::UnboundedReceiver<u64>,
    ) {
        info!("Connection manager started for {}", self.settings.url);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            self.disconnect("shutdown");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(message) = internal.recv() => self.handle_internal(message),
                Some(generation) = stale.recv() => self.handle_stale(generation),
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    if self.stopped {
                        debug!("Scheduled retry skipped; connection stopped");
                    } else {
                        self.begin_connect();
                    }
                }
            }
        }

        info!("Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let status = self.status();
                if matches!(status, ConnectionStatus::Connecting | ConnectionStatus::Open) {
                    debug!("connect() while {status:?}; nothing to do");
                    return;
                }
                if status == ConnectionStatus::Unreachable {
                    self.policy.reset();
                }
                self.stopped = false;
                self.retry_at = None;
                self.begin_connect();
            }
            Command::Disconnect { reason } => self.disconnect(&reason),
            Command::Send(message) => {
                let Some(live) = &self.live else {
                    debug!("Not connected; dropping outbound {:?}", message.kind());
                    return;
                };
                let text = message.encode(&self.settings.draft_id, Utc::now().timestamp_millis());
                if live.outbound.try_send(Outbound::Text(text)).is_err() {
                    warn!("Outbound queue full or closed; dropping {:?}", message.kind());
                }
            }
            Command::SetBackground(background) => {
                let disconnected = !self.stopped
                    && self.live.is_none()
                    && self.status() == ConnectionStatus::Closed;
                if let Some(RetryDecision::Retry { delay, .. }) =
                    self.policy.set_background(background, disconnected)
                {
                    info!("Back in foreground while disconnected; retrying in {delay:?}");
                    self.retry_at = Some(Instant::now() + delay);
                }
            }
            Command::Shutdown => self.disconnect("shutdown"),
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { generation, result } => {
                if generation != self.generation || self.stopped {
                    if let Ok(transport) = result {
                        debug!("Discarding transport from superseded attempt {generation}");
                        let _ = transport.outbound.try_send(Outbound::Close {
                            code: CLOSE_NORMAL,
                            reason: "superseded".into(),
                        });
                    }
                    return;
                }
                match result {
                    Ok(transport) => self.on_open(generation, transport),
                    Err(e) => {
                        warn!("Connection attempt {generation} failed: {e}");
                        self.on_close(CloseCause::Failed(e.to_string()));
                    }
                }
            }
            Internal::Event { generation, event } => self.handle_transport_event(generation, event),
        }
    }

    fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(live) = &self.live else {
            debug!("Ignoring event from closed transport {generation}");
            return;
        };
        if live.generation != generation {
            debug!("Ignoring event from superseded transport {generation}");
            return;
        }

        match event {
            TransportEvent::Text(text) => {
                // Any inbound frame counts as a liveness acknowledgment.
                live.ack.send_replace(Instant::now());
                if protocol::peek_kind(&text) == Some(MessageKind::Ping) {
                    let pong = ClientMessage::Pong
                        .encode(&self.settings.draft_id, Utc::now().timestamp_millis());
                    if live.outbound.try_send(Outbound::Text(pong)).is_err() {
                        warn!("Could not queue pong");
                    }
                }
                let _ = self.events.send(ConnectionEvent::Frame(text));
            }
            TransportEvent::Closed { code, reason } => {
                self.teardown(None);
                let cause = match code {
                    Some(code) => CloseCause::Remote { code, reason },
                    None => CloseCause::Failed("closed without a status code".into()),
                };
                self.on_close(cause);
            }
            TransportEvent::Failed(message) => {
                self.teardown(None);
                self.on_close(CloseCause::Failed(message));
            }
        }
    }

    fn handle_stale(&mut self, generation: u64) {
        if self.live.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        warn!("Connection {generation} unresponsive; closing it");
        self.teardown(Some("heartbeat timeout"));
        self.on_close(CloseCause::Unresponsive);
    }

    fn begin_connect(&mut self) {
        self.teardown(Some("reconnecting"));
        self.generation += 1;
        let generation = self.generation;
        self.set_status(ConnectionStatus::Connecting);
        info!(
            "Connecting to {} (attempt {})",
            self.settings.url,
            self.policy.attempt() + 1
        );

        let connector = self.connector.clone();
        let url = self.settings.url.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = tx.send(Internal::Opened { generation, result }).await;
        });
    }

    fn on_open(&mut self, generation: u64, transport: Transport) {
        let Transport {
            outbound,
            mut inbound,
        } = transport;
        self.policy.on_open();

        let tx = self.internal_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let terminal = !matches!(event, TransportEvent::Text(_));
                if tx.send(Internal::Event { generation, event }).await.is_err() || terminal {
                    return;
                }
            }
            let event = TransportEvent::Failed("transport dropped".into());
            let _ = tx.send(Internal::Event { generation, event }).await;
        });

        self.set_status(ConnectionStatus::Open);
        let (ack, last_ack) = watch::channel(Instant::now());
        let heartbeat = HeartbeatMonitor::start(
            self.settings.heartbeat,
            HeartbeatLink {
                generation,
                draft_id: self.settings.draft_id.clone(),
                outbound: outbound.clone(),
                status: self.status_tx.subscribe(),
                last_ack,
                stale: self.stale_tx.clone(),
            },
        );
        self.live = Some(Live {
            generation,
            outbound,
            ack,
            heartbeat,
            reader,
        });
        info!("Connection {generation} open");
    }

    fn on_close(&mut self, cause: CloseCause) {
        if self.stopped {
            self.set_status(ConnectionStatus::Closed);
            return;
        }
        match self.policy.on_close(&cause) {
            RetryDecision::Retry { delay, attempt } => {
                info!("Connection closed ({cause:?}); retry {attempt} in {delay:?}");
                self.retry_at = Some(Instant::now() + delay);
                self.set_status(ConnectionStatus::Closed);
            }
            RetryDecision::Stop => {
                info!("Connection closed by server ({cause:?}); not retrying");
                self.stopped = true;
                self.set_status(ConnectionStatus::Closed);
            }
            RetryDecision::GiveUp => {
                warn!(
                    "Giving up after {} attempts; server unreachable",
                    self.policy.attempt()
                );
                self.set_status(ConnectionStatus::Unreachable);
            }
        }
    }

    fn disconnect(&mut self, reason: &str) {
        info!("Disconnecting: {reason}");
        self.stopped = true;
        self.retry_at = None;
        // Invalidate any attempt still in flight.
        self.generation += 1;
        self.teardown(Some(reason));
        if self.status() != ConnectionStatus::Idle {
            self.set_status(ConnectionStatus::Closed);
        }
    }

    /// Drop the live transport, optionally sending a normal close frame first.
    fn teardown(&mut self, close_reason: Option<&str>) {
        let Some(live) = self.live.take() else {
            return;
        };
        if let Some(reason) = close_reason {
            let _ = live.outbound.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
        live.reader.abort();
        live.heartbeat.stop();
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.status() == status {
            return;
        }
        debug!("Connection status {:?} -> {status:?}", self.status());
        self.status_tx.send_replace(status);
        let _ = self.events.send(ConnectionEvent::Status(status));
    }
}
