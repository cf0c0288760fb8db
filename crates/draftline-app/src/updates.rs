// Where live draft updates come from: pushed over the WebSocket, or polled
// from the snapshot endpoint when push is unavailable. The session consumes
// both through `DraftUpdates` and never knows which one it has.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use draftline_core::protocol::{self, ClientMessage, Inbound, ProtocolError, ServerMessage};
use draftline_core::reconnect::CLOSE_NORMAL;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::DraftApi;
use crate::config::TransportConfig;
use crate::connection::{self, ConnectionEvent, ConnectionHandle, ConnectionSettings, ConnectionStatus};
use crate::transport::{Connector, Outbound};

/// One item from an update source.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Connection(ConnectionStatus),
    Message(Inbound),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Push,
    Poll,
}

/// A source of authoritative draft updates.
#[async_trait]
pub trait DraftUpdates: Send {
    fn mode(&self) -> UpdateMode;

    async fn start(&mut self);

    /// Next event, or `None` once the source has shut down. Cancel-safe.
    async fn next(&mut self) -> Option<UpdateEvent>;

    /// Ask for a full `draft_state` as soon as possible.
    async fn request_resync(&mut self);

    async fn set_background(&mut self, background: bool);

    /// Manual retry, e.g. after the connection gave up.
    async fn reconnect(&mut self);

    async fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Updates pushed over the managed WebSocket connection.
pub struct PushUpdates {
    connection: ConnectionHandle,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl PushUpdates {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        let (connection, events) = connection::spawn(connector, settings);
        Self { connection, events }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

#[async_trait]
impl DraftUpdates for PushUpdates {
    fn mode(&self) -> UpdateMode {
        UpdateMode::Push
    }

    async fn start(&mut self) {
        if self.connection.connect().await.is_err() {
            warn!("Connection manager is gone; push updates unavailable");
        }
    }

    async fn next(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.events.recv().await? {
                ConnectionEvent::Status(status) => return Some(UpdateEvent::Connection(status)),
                ConnectionEvent::Frame(text) => match protocol::decode(&text) {
                    Ok(inbound) => return Some(UpdateEvent::Message(inbound)),
                    Err(ProtocolError::Unsupported(kind)) => {
                        debug!("Ignoring unsupported message type {kind:?}");
                    }
                    Err(e) => warn!("Dropping malformed frame: {e}"),
                },
            }
        }
    }

    async fn request_resync(&mut self) {
        if self.connection.status() != ConnectionStatus::Open {
            debug!("Resync requested while not connected; the session refetches state on open");
            return;
        }
        info!("Requesting full draft state");
        let _ = self.connection.send(ClientMessage::SyncRequest).await;
    }

    async fn set_background(&mut self, background: bool) {
        let _ = self.connection.set_background(background).await;
    }

    async fn reconnect(&mut self) {
        let _ = self.connection.connect().await;
    }

    async fn stop(&mut self) {
        let _ = self.connection.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Updates fetched from the snapshot endpoint on a fixed interval. Every
/// fetch is delivered as an epoch-less `draft_state`.
pub struct PollUpdates {
    api: Arc<dyn DraftApi>,
    draft_id: String,
    interval: Duration,
    wake: Arc<Notify>,
    tx: mpsc::Sender<UpdateEvent>,
    rx: mpsc::Receiver<UpdateEvent>,
    task: Option<JoinHandle<()>>,
}

impl PollUpdates {
    pub fn new(api: Arc<dyn DraftApi>, draft_id: impl Into<String>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            api,
            draft_id: draft_id.into(),
            interval,
            wake: Arc::new(Notify::new()),
            tx,
            rx,
            task: None,
        }
    }
}

impl Drop for PollUpdates {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn poll_loop(
    api: Arc<dyn DraftApi>,
    draft_id: String,
    interval: Duration,
    wake: Arc<Notify>,
    tx: mpsc::Sender<UpdateEvent>,
) {
    let mut status = ConnectionStatus::Connecting;
    if tx.send(UpdateEvent::Connection(status)).await.is_err() {
        return;
    }

    loop {
        let next_status = match api.fetch_snapshot(&draft_id).await {
            Ok(snapshot) => {
                if status != ConnectionStatus::Open
                    && tx
                        .send(UpdateEvent::Connection(ConnectionStatus::Open))
                        .await
                        .is_err()
                {
                    return;
                }
                let inbound = Inbound {
                    draft_id: draft_id.clone(),
                    turn_epoch: None,
                    seq: None,
                    timestamp: None,
                    message: ServerMessage::DraftState(Box::new(snapshot)),
                };
                if tx.send(UpdateEvent::Message(inbound)).await.is_err() {
                    return;
                }
                ConnectionStatus::Open
            }
            Err(e) => {
                warn!("Snapshot poll failed: {e}");
                if status != ConnectionStatus::Closed
                    && tx
                        .send(UpdateEvent::Connection(ConnectionStatus::Closed))
                        .await
                        .is_err()
                {
                    return;
                }
                ConnectionStatus::Closed
            }
        };
        status = next_status;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => debug!("Immediate poll requested"),
        }
    }
}

#[async_trait]
impl DraftUpdates for PollUpdates {
    fn mode(&self) -> UpdateMode {
        UpdateMode::Poll
    }

    async fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        info!("Polling draft {} every {:?}", self.draft_id, self.interval);
        self.task = Some(tokio::spawn(poll_loop(
            self.api.clone(),
            self.draft_id.clone(),
            self.interval,
            self.wake.clone(),
            self.tx.clone(),
        )));
    }

    async fn next(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    async fn request_resync(&mut self) {
        self.wake.notify_one();
    }

    async fn set_background(&mut self, background: bool) {
        if !background {
            self.wake.notify_one();
        }
    }

    async fn reconnect(&mut self) {
        self.wake.notify_one();
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Capability probe
// ---------------------------------------------------------------------------

/// Try to open a push connection up to `attempts` times. The probe
/// connection is closed straight away.
pub async fn probe_push(
    connector: &dyn Connector,
    url: &str,
    attempts: u32,
    timeout: Duration,
) -> bool {
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, connector.connect(url)).await {
            Ok(Ok(transport)) => {
                let _ = transport.outbound.try_send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "probe".into(),
                });
                return true;
            }
            Ok(Err(e)) => warn!("Push probe {attempt}/{attempts} failed: {e}"),
            Err(_) => warn!("Push probe {attempt}/{attempts} timed out after {timeout:?}"),
        }
    }
    false
}

/// Pick push when the probe succeeds, polling otherwise.
pub async fn select_updates(
    connector: Arc<dyn Connector>,
    api: Arc<dyn DraftApi>,
    settings: ConnectionSettings,
    transport: &TransportConfig,
) -> Box<dyn DraftUpdates> {
    let push_ok = probe_push(
        connector.as_ref(),
        &settings.url,
        transport.probe_attempts,
        transport.probe_timeout,
    )
    .await;

    if push_ok {
        info!("Push updates available at {}", settings.url);
        Box::new(PushUpdates::new(connector, settings))
    } else {
        warn!("Push updates unavailable; falling back to polling");
        Box::new(PollUpdates::new(api, settings.draft_id, transport.poll_interval))
    }
}
