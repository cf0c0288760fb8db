// Live draft session scenarios: a scripted update source and collaborator
// API drive the session on a paused clock while the tests watch its view
// updates.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use draftline_app::api::{ApiError, RejectionCode};
use draftline_app::config::{RulesConfig, TimerSettings};
use draftline_app::connection::ConnectionStatus;
use draftline_app::session::{Command, LiveDraft, SessionConfig, ViewUpdate};
use draftline_app::updates::UpdateEvent;
use draftline_core::draft::{DraftStatus, PickRejection};
use draftline_core::sync::TimerPhase;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ===========================================================================
// Helpers
// ===========================================================================

fn config_for(user: &str) -> SessionConfig {
    SessionConfig {
        draft_id: DRAFT.into(),
        user_id: user.into(),
        timer: TimerSettings::default(),
        rules: RulesConfig::default(),
    }
}

struct Rig {
    draft: LiveDraft,
    view: mpsc::Receiver<ViewUpdate>,
    feed: mpsc::UnboundedSender<UpdateEvent>,
    probe: Arc<UpdatesProbe>,
    api: Arc<MockApi>,
}

fn start(user: &str, api: Arc<MockApi>) -> Rig {
    start_with(config_for(user), api)
}

fn start_with(config: SessionConfig, api: Arc<MockApi>) -> Rig {
    let (updates, feed, probe) = scripted_updates();
    let (draft, view) = LiveDraft::start(config, updates, api.clone());
    Rig {
        draft,
        view,
        feed,
        probe,
        api,
    }
}

fn is_snapshot(update: &ViewUpdate) -> bool {
    matches!(update, ViewUpdate::Snapshot(_))
}

fn is_turn(pick: u32) -> impl Fn(&ViewUpdate) -> bool {
    move |update| matches!(update, ViewUpdate::TurnChanged { pick_number, .. } if *pick_number == pick)
}

fn is_timer(seconds: u32) -> impl Fn(&ViewUpdate) -> bool {
    move |update| {
        matches!(update, ViewUpdate::Timer { seconds: s, phase: TimerPhase::Counting } if *s == seconds)
    }
}

// ===========================================================================
// Loading
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn loads_snapshot_and_announces_the_turn() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ben", api);

    let ViewUpdate::Snapshot(view) = expect_view(&mut rig.view, "snapshot", is_snapshot).await else {
        unreachable!()
    };
    assert_eq!(view.status, DraftStatus::Active);
    assert_eq!(view.pick, 1);
    assert_eq!(view.available, 9);
    assert_eq!(view.holder.as_deref(), Some("ana"));

    let turn = expect_view(&mut rig.view, "first turn", is_turn(1)).await;
    assert_eq!(
        turn,
        ViewUpdate::TurnChanged {
            pick_number: 1,
            holder: "ana".into(),
            just_picked: None,
            up_next: Some("ben".into()),
            yours: false,
        }
    );
    expect_view(&mut rig.view, "timer at 60", is_timer(60)).await;
    assert!(rig.probe.started.load(Ordering::SeqCst));
    assert_eq!(rig.api.calls(), vec![format!("fetch {DRAFT}")]);
}

#[tokio::test(start_paused = true)]
async fn updates_before_the_first_snapshot_are_replayed() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(90)));
    *api.fetch_delay.lock().unwrap() = Duration::from_secs(1);
    let mut rig = start("ben", api);

    rig.feed
        .send(frame(&pick_made_frame("E2", 1, "ana", "ari-sp", 90)))
        .unwrap();

    expect_view(&mut rig.view, "snapshot", is_snapshot).await;
    let made = expect_view(&mut rig.view, "replayed pick", |u| {
        matches!(u, ViewUpdate::PickMade(_))
    })
    .await;
    let ViewUpdate::PickMade(pick) = made else {
        unreachable!()
    };
    assert_eq!((pick.pick_number, pick.item_id.as_str()), (1, "ari-sp"));

    let turn = expect_view(&mut rig.view, "second turn", is_turn(2)).await;
    assert!(matches!(
        turn,
        ViewUpdate::TurnChanged { yours: true, ref holder, .. } if holder == "ben"
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_initial_load_asks_for_a_resync() {
    let api = Arc::new(MockApi::default());
    let mut rig = start("ana", api);

    expect_view(&mut rig.view, "load error", |u| matches!(u, ViewUpdate::RequestFailed(_))).await;
    assert_eq!(rig.probe.resyncs(), 1);

    // The pushed state is enough to get going.
    let state = serde_json::json!({
        "type": "draft_state",
        "draftId": DRAFT,
        "turnEpoch": "E1",
        "data": snapshot(DraftStatus::Active, vec![], Some(75)),
    });
    rig.feed.send(frame(&state.to_string())).unwrap();
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;
    expect_view(&mut rig.view, "timer at 75", is_timer(75)).await;
}

#[tokio::test(start_paused = true)]
async fn first_open_loads_state_after_a_failed_fetch() {
    let api = Arc::new(MockApi::default());
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "load error", |u| matches!(u, ViewUpdate::RequestFailed(_))).await;

    *rig.api.snapshot.lock().unwrap() = Some(snapshot(DraftStatus::Active, vec![], Some(90)));
    rig.feed
        .send(UpdateEvent::Connection(ConnectionStatus::Connecting))
        .unwrap();
    rig.feed.send(UpdateEvent::Connection(ConnectionStatus::Open)).unwrap();

    let ViewUpdate::Snapshot(view) = expect_view(&mut rig.view, "snapshot", is_snapshot).await else {
        unreachable!()
    };
    assert_eq!(view.holder.as_deref(), Some("ana"));
    expect_view(&mut rig.view, "first turn", is_turn(1)).await;
    assert_eq!(
        rig.api.calls(),
        vec![format!("fetch {DRAFT}"), format!("fetch {DRAFT}")]
    );
}

#[tokio::test(start_paused = true)]
async fn resync_asked_before_the_first_open_is_served_on_open() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    api.submit_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::Rejected {
            code: RejectionCode::AlreadyTaken,
            message: "gone".into(),
        }));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    rig.draft.send(Command::Pick("ari-sp".into())).await.unwrap();
    expect_view(&mut rig.view, "rejection", |u| matches!(u, ViewUpdate::PickRejected(_))).await;

    rig.feed.send(UpdateEvent::Connection(ConnectionStatus::Open)).unwrap();
    expect_view(&mut rig.view, "refreshed snapshot", is_snapshot).await;
    assert_eq!(
        rig.api.calls(),
        vec![
            format!("fetch {DRAFT}"),
            format!("pick {DRAFT} ari-sp"),
            format!("fetch {DRAFT}"),
        ]
    );

    // Once served, later opens fall back to the reopen rule.
    rig.feed.send(UpdateEvent::Connection(ConnectionStatus::Open)).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.api.calls().len(), 4);
}

// ===========================================================================
// Remote picks and timer
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn remote_pick_advances_turn_and_resets_timer() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("cy", api);
    expect_view(&mut rig.view, "timer at 60", is_timer(60)).await;

    rig.feed.send(frame(&timer_frame("E1", 1, 60.0))).unwrap();
    rig.feed.send(frame(&timer_frame("E1", 1, 60.0))).unwrap();
    rig.feed.send(frame(&pick_made_frame("E2", 1, "ana", "ari-sp", 120))).unwrap();
    // Duplicate delivery of the same notice.
    rig.feed.send(frame(&pick_made_frame("E2", 1, "ana", "ari-sp", 120))).unwrap();

    let made = expect_view(&mut rig.view, "pick", |u| matches!(u, ViewUpdate::PickMade(_))).await;
    assert!(matches!(made, ViewUpdate::PickMade(ref p) if p.user_id == "ana" && !p.is_auto_pick));
    let turn = expect_view(&mut rig.view, "second turn", is_turn(2)).await;
    assert_eq!(
        turn,
        ViewUpdate::TurnChanged {
            pick_number: 2,
            holder: "ben".into(),
            just_picked: Some("ana".into()),
            up_next: Some("cy".into()),
            yours: false,
        }
    );
    expect_view(&mut rig.view, "timer at 120", is_timer(120)).await;

    // A late tick for the finished turn changes nothing; the next pick
    // notice is the first thing to come through.
    rig.feed.send(frame(&timer_frame("E1", 2, 58.0))).unwrap();
    rig.feed.send(frame(&pick_made_frame("E3", 2, "ben", "atl-c", 90))).unwrap();
    let next = expect_view(&mut rig.view, "anything but the timer", |u| {
        !matches!(u, ViewUpdate::Timer { .. })
    })
    .await;
    assert!(matches!(next, ViewUpdate::PickMade(ref p) if p.pick_number == 2));
    assert_eq!(rig.probe.resyncs(), 0);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_picks_are_applied_in_sequence() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(90)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "first turn", is_turn(1)).await;

    rig.feed.send(frame(&pick_made_frame("E3", 2, "ben", "atl-c", 90))).unwrap();
    rig.feed.send(frame(&pick_made_frame("E2", 1, "ana", "ari-sp", 90))).unwrap();

    let mut numbers = Vec::new();
    while numbers.len() < 2 {
        if let ViewUpdate::PickMade(pick) =
            expect_view(&mut rig.view, "pick", |u| matches!(u, ViewUpdate::PickMade(_))).await
        {
            numbers.push(pick.pick_number);
        }
    }
    assert_eq!(numbers, vec![1, 2]);
    let turn = expect_view(&mut rig.view, "third turn", is_turn(3)).await;
    assert!(matches!(turn, ViewUpdate::TurnChanged { ref holder, .. } if holder == "cy"));
}

#[tokio::test(start_paused = true)]
async fn timer_for_an_unknown_epoch_requests_a_resync() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "timer at 60", is_timer(60)).await;

    rig.feed.send(frame(&timer_frame("E1", 1, 59.0))).unwrap();
    expect_view(&mut rig.view, "timer at 59", is_timer(59)).await;

    rig.feed.send(frame(&timer_frame("E9", 1, 80.0))).unwrap();
    rig.feed.send(UpdateEvent::Connection(ConnectionStatus::Open)).unwrap();
    expect_view(&mut rig.view, "connection", |u| matches!(u, ViewUpdate::Connection(_))).await;
    assert_eq!(rig.probe.resyncs(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_turn_is_auto_picked() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(3)));
    let mut rig = start("ben", api);
    let shown_at = {
        expect_view(&mut rig.view, "timer at 3", is_timer(3)).await;
        Instant::now()
    };

    expect_view(&mut rig.view, "grace", |u| {
        matches!(u, ViewUpdate::Timer { phase: TimerPhase::Grace, .. })
    })
    .await;
    let made = expect_view(&mut rig.view, "auto pick", |u| matches!(u, ViewUpdate::PickMade(_))).await;
    let ViewUpdate::PickMade(pick) = made else {
        unreachable!()
    };
    assert!(pick.is_auto_pick);
    assert_eq!(pick.user_id, "ana");
    assert_eq!(pick.item_id, "ari-sp");
    assert!(shown_at.elapsed() >= Duration::from_millis(4500));

    let turn = expect_view(&mut rig.view, "second turn", is_turn(2)).await;
    assert!(matches!(turn, ViewUpdate::TurnChanged { yours: true, .. }));
    expect_view(&mut rig.view, "fresh timer", is_timer(90)).await;
}

#[tokio::test(start_paused = true)]
async fn expiry_without_local_auto_pick_waits_for_the_server() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(1)));
    let mut config = config_for("ben");
    config.rules.local_auto_pick = false;
    let mut rig = start_with(config, api);

    expect_view(&mut rig.view, "expired", |u| {
        matches!(u, ViewUpdate::Timer { phase: TimerPhase::Expired, .. })
    })
    .await;
    // The resync request goes out before the expiry is published.
    assert_eq!(rig.probe.resyncs(), 1);

    rig.feed
        .send(frame(&pick_made_frame("E2", 1, "ana", "cin-2b", 90)))
        .unwrap();
    let made = expect_view(&mut rig.view, "server pick", |u| matches!(u, ViewUpdate::PickMade(_))).await;
    assert!(matches!(made, ViewUpdate::PickMade(ref p) if p.item_id == "cin-2b"));
}

#[tokio::test(start_paused = true)]
async fn draft_completed_stops_the_clock() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "timer at 60", is_timer(60)).await;

    rig.feed
        .send(frame(&format!(r#"{{"type":"draft_completed","draftId":"{DRAFT}"}}"#)))
        .unwrap();
    expect_view(&mut rig.view, "completed", |u| *u == ViewUpdate::Completed).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rig.view.try_recv().is_err());
}

// ===========================================================================
// Picks
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn local_validation_rejects_without_calling_the_server() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ben", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    rig.draft.send(Command::Pick("ari-sp".into())).await.unwrap();
    let rejected = expect_view(&mut rig.view, "rejection", |u| {
        matches!(u, ViewUpdate::PickRejected(_))
    })
    .await;
    assert_eq!(
        rejected,
        ViewUpdate::PickRejected(PickRejection::NotYourTurn {
            submitter: "ben".into(),
            holder: "ana".into(),
        })
    );

    rig.draft.send(Command::Pick("no-such-item".into())).await.unwrap();
    let rejected = expect_view(&mut rig.view, "rejection", |u| {
        matches!(u, ViewUpdate::PickRejected(_))
    })
    .await;
    assert_eq!(
        rejected,
        ViewUpdate::PickRejected(PickRejection::UnknownItem("no-such-item".into()))
    );
    assert_eq!(rig.api.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_pick_applies_the_returned_state() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    api.submit_results.lock().unwrap().push_back(Ok(snapshot(
        DraftStatus::Active,
        vec![pick(1, "ana", "bos-of")],
        Some(90),
    )));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "first turn", is_turn(1)).await;

    rig.draft.send(Command::Pick("bos-of".into())).await.unwrap();
    let made = expect_view(&mut rig.view, "pick", |u| matches!(u, ViewUpdate::PickMade(_))).await;
    assert!(matches!(made, ViewUpdate::PickMade(ref p) if p.item_id == "bos-of"));
    expect_view(&mut rig.view, "second turn", is_turn(2)).await;
    assert_eq!(
        rig.api.calls(),
        vec![format!("fetch {DRAFT}"), format!("pick {DRAFT} bos-of")]
    );
}

#[tokio::test(start_paused = true)]
async fn server_rejection_is_surfaced_and_resyncs() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    api.submit_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::Rejected {
            code: RejectionCode::AlreadyTaken,
            message: "gone".into(),
        }));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    rig.draft.send(Command::Pick("ari-sp".into())).await.unwrap();
    let rejected = expect_view(&mut rig.view, "rejection", |u| {
        matches!(u, ViewUpdate::PickRejected(_))
    })
    .await;
    assert_eq!(
        rejected,
        ViewUpdate::PickRejected(PickRejection::AlreadyTaken("ari-sp".into()))
    );
    assert_eq!(rig.probe.resyncs(), 1);
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn owner_start_runs_the_pre_draft_countdown() {
    let api = MockApi::serving(snapshot(DraftStatus::NotStarted, vec![], None));
    api.start_results
        .lock()
        .unwrap()
        .push_back(Ok(snapshot(DraftStatus::NotStarted, vec![], None)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    rig.draft.send(Command::Start).await.unwrap();
    expect_view(&mut rig.view, "countdown", |u| {
        *u == ViewUpdate::Countdown { seconds: 10 }
    })
    .await;
    let started_at = Instant::now();

    let turn = expect_view(&mut rig.view, "first turn", is_turn(1)).await;
    assert!(matches!(turn, ViewUpdate::TurnChanged { yours: true, .. }));
    assert_near(started_at.elapsed(), Duration::from_secs(10));
    expect_view(&mut rig.view, "timer", is_timer(90)).await;
}

#[tokio::test(start_paused = true)]
async fn reopened_connection_refreshes_the_snapshot() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    for status in [
        ConnectionStatus::Open,
        ConnectionStatus::Closed,
        ConnectionStatus::Connecting,
        ConnectionStatus::Open,
    ] {
        rig.feed.send(UpdateEvent::Connection(status)).unwrap();
    }
    expect_view(&mut rig.view, "refreshed snapshot", is_snapshot).await;
    assert_eq!(rig.api.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn background_and_stop_reach_the_update_source() {
    let api = MockApi::serving(snapshot(DraftStatus::Active, vec![], Some(60)));
    let mut rig = start("ana", api);
    expect_view(&mut rig.view, "snapshot", is_snapshot).await;

    rig.draft.send(Command::Background(true)).await.unwrap();
    rig.draft.send(Command::Background(false)).await.unwrap();
    rig.draft.send(Command::Reconnect).await.unwrap();
    let probe = rig.probe.clone();
    rig.draft.stop().await;

    assert_eq!(*probe.background.lock().unwrap(), vec![true, false]);
    assert_eq!(probe.reconnects.load(Ordering::SeqCst), 1);
    assert!(probe.stopped.load(Ordering::SeqCst));
}
