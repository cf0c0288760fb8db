// Update sources: push over the managed connection, the polling fallback
// and the capability probe that chooses between them.

mod common;

use std::time::Duration;

use common::*;
use draftline_app::config::{HeartbeatConfig, TransportConfig};
use draftline_app::connection::{ConnectionSettings, ConnectionStatus};
use draftline_app::transport::{Outbound, TransportEvent};
use draftline_app::updates::{
    probe_push, select_updates, DraftUpdates, PollUpdates, PushUpdates, UpdateEvent, UpdateMode,
};
use draftline_core::draft::DraftStatus;
use draftline_core::protocol::ServerMessage;
use draftline_core::reconnect::ReconnectConfig;
use tokio::time::Instant;

const URL: &str = "ws://draft.test/live?draftId=league-7";

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        url: URL.into(),
        draft_id: DRAFT.into(),
        reconnect: ReconnectConfig::default(),
        heartbeat: HeartbeatConfig::default(),
    }
}

fn is_draft_state(event: &Option<UpdateEvent>) -> bool {
    matches!(
        event,
        Some(UpdateEvent::Message(inbound)) if matches!(inbound.message, ServerMessage::DraftState(_))
    )
}

// ===========================================================================
// Probe
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn probe_gives_up_after_the_configured_attempts() {
    let (connector, _peers) = MockConnector::new();
    connector.script(&[Dial::Refuse, Dial::Refuse, Dial::Refuse]);

    assert!(!probe_push(connector.as_ref(), URL, 3, Duration::from_secs(3)).await);
    assert_eq!(connector.attempts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn probe_closes_its_connection() {
    let (connector, mut peers) = MockConnector::new();
    connector.script(&[Dial::Refuse]);

    assert!(probe_push(connector.as_ref(), URL, 3, Duration::from_secs(3)).await);
    assert_eq!(connector.attempts().len(), 2);

    let mut peer = peers.recv().await.unwrap();
    assert_eq!(
        peer.outbound.recv().await,
        Some(Outbound::Close {
            code: 1000,
            reason: "probe".into()
        })
    );
    assert_eq!(peer.outbound.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn selection_falls_back_to_polling() {
    let transport = TransportConfig {
        probe_attempts: 2,
        ..TransportConfig::default()
    };

    let (connector, _peers) = MockConnector::new();
    connector.script(&[Dial::Refuse, Dial::Refuse]);
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(90)));
    let updates = select_updates(connector, api.clone(), settings(), &transport).await;
    assert_eq!(updates.mode(), UpdateMode::Poll);

    let (connector, _peers) = MockConnector::new();
    let updates = select_updates(connector, api, settings(), &transport).await;
    assert_eq!(updates.mode(), UpdateMode::Push);
}

// ===========================================================================
// Push
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn push_decodes_frames_and_skips_garbage() {
    let (connector, mut peers) = MockConnector::new();
    let mut updates = PushUpdates::new(connector, settings());

    // Not connected yet: the resync request has nowhere to go.
    updates.request_resync().await;

    updates.start().await;
    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Connecting))
    );
    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Open))
    );
    let mut peer = peers.recv().await.unwrap();

    for text in [
        "not json".to_string(),
        format!(r#"{{"type":"sync_request","draftId":"{DRAFT}"}}"#),
        timer_frame("E1", 1, 42.0),
    ] {
        peer.inbound.send(TransportEvent::Text(text)).await.unwrap();
    }
    let Some(UpdateEvent::Message(inbound)) = updates.next().await else {
        panic!("expected a decoded message");
    };
    assert_eq!(inbound.seq, Some(1));
    assert!(matches!(inbound.message, ServerMessage::TimerUpdate(t) if t.seconds_remaining == 42.0));

    updates.request_resync().await;
    let Some(Outbound::Text(text)) = peer.outbound.recv().await else {
        panic!("expected a sync request");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "sync_request");
    assert_eq!(value["draftId"], DRAFT);

    updates.stop().await;
    assert_eq!(
        peer.outbound.recv().await,
        Some(Outbound::Close {
            code: 1000,
            reason: "shutdown".into()
        })
    );
    assert_eq!(updates.connection().status(), ConnectionStatus::Closed);
}

// ===========================================================================
// Poll
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn poll_delivers_snapshots_on_its_interval() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(90)));
    let mut updates = PollUpdates::new(api.clone(), DRAFT, Duration::from_secs(2));
    updates.start().await;

    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Connecting))
    );
    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Open))
    );
    let first = updates.next().await;
    assert!(is_draft_state(&first));
    let Some(UpdateEvent::Message(inbound)) = first else {
        unreachable!()
    };
    assert_eq!(inbound.draft_id, DRAFT);
    assert_eq!(inbound.turn_epoch, None);

    // Open is reported once, not on every poll.
    let waited = Instant::now();
    assert!(is_draft_state(&updates.next().await));
    assert_near(waited.elapsed(), Duration::from_secs(2));

    // A resync request polls straight away.
    let asked = Instant::now();
    updates.request_resync().await;
    assert!(is_draft_state(&updates.next().await));
    assert_near(asked.elapsed(), Duration::ZERO);
    assert_eq!(api.calls().len(), 3);

    updates.stop().await;
}

#[tokio::test(start_paused = true)]
async fn poll_reports_outages_as_closed() {
    let api = std::sync::Arc::new(MockApi::default());
    let mut updates = PollUpdates::new(api.clone(), DRAFT, Duration::from_secs(2));
    updates.start().await;

    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Connecting))
    );
    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Closed))
    );

    *api.snapshot.lock().unwrap() = Some(snapshot(DraftStatus::NotStarted, vec![], None));
    assert_eq!(
        updates.next().await,
        Some(UpdateEvent::Connection(ConnectionStatus::Open))
    );
    assert!(is_draft_state(&updates.next().await));
    assert_eq!(api.calls().len(), 2);
}
