// WebSocket transport for the live draft channel.
//
// A `Transport` is a pair of channels: frames the connection manager wants
// written, and events read from the socket. `TungsteniteConnector` pumps
// them to and from a real WebSocket; tests hand out in-memory pairs.

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request for {url}: {message}")]
    InvalidRequest { url: String, message: String },

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<WsError>,
    },

    #[error("connection attempt timed out")]
    Timeout,
}

/// Something read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame (raw JSON).
    Text(String),
    /// The peer sent a close frame. `code` is `None` when the frame had no status.
    Closed { code: Option<u16>, reason: String },
    /// The socket broke without a close frame.
    Failed(String),
}

/// Something to write to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// One live connection as seen by the connection manager.
#[derive(Debug)]
pub struct Transport {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// The far side of a [`Transport`]: whatever drives the actual socket.
#[derive(Debug)]
pub struct TransportPeer {
    pub outbound: mpsc::Receiver<Outbound>,
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl Transport {
    /// A connected transport/peer pair.
    pub fn pair() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Transport {
                outbound: out_tx,
                inbound: in_rx,
            },
            TransportPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// Opens transports. Kept behind a trait so the connection manager can run
/// against an in-memory implementation.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError>;
}

// ---------------------------------------------------------------------------
// Tungstenite implementation
// ---------------------------------------------------------------------------

/// Connects with tokio-tungstenite, authenticating with a bearer token.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    token: Option<String>,
}

impl TungsteniteConnector {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        let mut request =
            url.into_client_request()
                .map_err(|e| TransportError::InvalidRequest {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                TransportError::InvalidRequest {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            })?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                source: Box::new(e),
            })?;
        info!("WebSocket connected to {url}");

        let (write, read) = ws_stream.split();
        let (transport, peer) = Transport::pair();
        let TransportPeer { outbound, inbound } = peer;

        let addr = url.to_string();
        tokio::spawn(async move {
            pump_inbound(read, &inbound, &addr).await;
        });
        tokio::spawn(async move {
            pump_outbound(write, outbound).await;
        });

        Ok(transport)
    }
}

/// Forward frames from any [`Stream`] of WebSocket messages as
/// [`TransportEvent`]s. Text frames pass through, a close frame or read
/// error ends the stream with exactly one terminal event, and binary and
/// control frames are ignored.
pub async fn pump_inbound<St>(mut stream: St, tx: &mpsc::Sender<TransportEvent>, addr: &str)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let terminal = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if tx.send(TransportEvent::Text(text.to_string())).await.is_err() {
                    // Connection manager dropped this transport.
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                info!("{addr} sent close frame (code {code:?}, reason {reason:?})");
                break TransportEvent::Closed { code, reason };
            }
            Some(Err(e)) => {
                warn!("WebSocket error from {addr}: {e}");
                break TransportEvent::Failed(e.to_string());
            }
            Some(Ok(_)) => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
            None => {
                break TransportEvent::Failed("stream ended without a close frame".into());
            }
        }
    };
    let _ = tx.send(terminal).await;
}

/// Write [`Outbound`] items to any WebSocket [`Sink`] until a close is
/// requested or the sender side is dropped (which also closes the socket).
pub async fn pump_outbound<Si>(mut sink: Si, mut rx: mpsc::Receiver<Outbound>)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("WebSocket write failed: {e}");
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                debug!("Closing WebSocket with code {code}");
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = sink.close().await;
                return;
            }
        }
    }
    let _ = sink.close().await;
}
