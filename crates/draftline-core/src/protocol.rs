// Wire protocol for the live draft channel.
//
// Every frame is a JSON envelope `{ type, draftId, turnEpoch?, seq?, data,
// timestamp }`. Turn-scoped messages carry the epoch and a per-epoch
// sequence number; the payload shape depends on `type`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::draft::{DraftSession, Item, Pick};
use crate::sync::TurnEpoch;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported message type {0:?}")]
    Unsupported(MessageKind),
}

/// The `type` field of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connected,
    Ping,
    Pong,
    PickMade,
    AutoPick,
    TimerUpdate,
    DraftState,
    DraftCompleted,
    SyncRequest,
    #[serde(other)]
    Unknown,
}

/// Raw envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub draft_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_epoch: Option<TurnEpoch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sender clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Full authoritative state: session, pick log and item catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSnapshot {
    pub session: DraftSession,
    #[serde(default)]
    pub picks: Vec<Pick>,
    #[serde(default)]
    pub items: Vec<Item>,
    /// Seconds left on the current turn when the snapshot was taken.
    #[serde(default)]
    pub seconds_remaining: Option<u32>,
}

/// Payload of `pick_made` and `auto_pick`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickNotice {
    pub pick: Pick,
    #[serde(default)]
    pub current_round: Option<u32>,
    #[serde(default)]
    pub current_pick: Option<u32>,
    /// Time granted to the next turn.
    #[serde(default)]
    pub seconds_remaining: Option<u32>,
}

/// Payload of `timer_update`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    pub seconds_remaining: f64,
}

/// Decoded server message body.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Connected,
    Ping,
    Pong,
    PickMade(PickNotice),
    AutoPick(PickNotice),
    TimerUpdate(TimerPayload),
    DraftState(Box<DraftSnapshot>),
    DraftCompleted,
}

/// A decoded inbound frame with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub draft_id: String,
    pub turn_epoch: Option<TurnEpoch>,
    pub seq: Option<u64>,
    pub timestamp: Option<i64>,
    pub message: ServerMessage,
}

impl Inbound {
    pub fn kind(&self) -> MessageKind {
        match self.message {
            ServerMessage::Connected => MessageKind::Connected,
            ServerMessage::Ping => MessageKind::Ping,
            ServerMessage::Pong => MessageKind::Pong,
            ServerMessage::PickMade(_) => MessageKind::PickMade,
            ServerMessage::AutoPick(_) => MessageKind::AutoPick,
            ServerMessage::TimerUpdate(_) => MessageKind::TimerUpdate,
            ServerMessage::DraftState(_) => MessageKind::DraftState,
            ServerMessage::DraftCompleted => MessageKind::DraftCompleted,
        }
    }
}

/// Decode a text frame into an [`Inbound`] message.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let Envelope {
        kind,
        draft_id,
        turn_epoch,
        seq,
        data,
        timestamp,
    } = envelope;

    let message = match kind {
        MessageKind::Connected => ServerMessage::Connected,
        MessageKind::Ping => ServerMessage::Ping,
        MessageKind::Pong => ServerMessage::Pong,
        MessageKind::PickMade => ServerMessage::PickMade(serde_json::from_value(data)?),
        MessageKind::AutoPick => ServerMessage::AutoPick(serde_json::from_value(data)?),
        MessageKind::TimerUpdate => ServerMessage::TimerUpdate(serde_json::from_value(data)?),
        MessageKind::DraftState => {
            ServerMessage::DraftState(Box::new(serde_json::from_value(data)?))
        }
        MessageKind::DraftCompleted => ServerMessage::DraftCompleted,
        other @ (MessageKind::SyncRequest | MessageKind::Unknown) => {
            return Err(ProtocolError::Unsupported(other))
        }
    };

    Ok(Inbound {
        draft_id,
        turn_epoch,
        seq,
        timestamp,
        message,
    })
}

/// Read only the `type` of a frame. Returns `None` for non-JSON text.
pub fn peek_kind(text: &str) -> Option<MessageKind> {
    #[derive(Deserialize)]
    struct KindOnly {
        #[serde(rename = "type")]
        kind: MessageKind,
    }
    serde_json::from_str::<KindOnly>(text).ok().map(|k| k.kind)
}

/// Messages the client sends over the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// Liveness probe.
    Ping,
    /// Reply to a server probe.
    Pong,
    /// Ask the server to push a full `draft_state`.
    SyncRequest,
}

impl ClientMessage {
    pub fn kind(self) -> MessageKind {
        match self {
            ClientMessage::Ping => MessageKind::Ping,
            ClientMessage::Pong => MessageKind::Pong,
            ClientMessage::SyncRequest => MessageKind::SyncRequest,
        }
    }

    /// Encode as an envelope stamped with the client clock.
    pub fn encode(self, draft_id: &str, timestamp_ms: i64) -> String {
        let envelope = Envelope {
            kind: self.kind(),
            draft_id: draft_id.to_string(),
            turn_epoch: None,
            seq: None,
            data: serde_json::Value::Object(Default::default()),
            timestamp: Some(timestamp_ms),
        };
        // Envelope contains only plain strings, integers and an empty map.
        serde_json::to_string(&envelope).unwrap_or_default()
    }
}
