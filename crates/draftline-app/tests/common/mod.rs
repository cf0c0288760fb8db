// Shared test doubles: an in-memory connector, a scripted collaborator API
// and a scripted update source, plus draft fixtures.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use draftline_app::api::{ApiError, DraftApi};
use draftline_app::session::ViewUpdate;
use draftline_app::transport::{Connector, Transport, TransportError, TransportPeer};
use draftline_app::updates::{DraftUpdates, UpdateEvent, UpdateMode};
use draftline_core::draft::{CategoryPair, DraftSession, DraftStatus, Item, Pick};
use draftline_core::protocol::{self, DraftSnapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ===========================================================================
// Timing
// ===========================================================================

/// Paused-clock elapsed times land on the expected value plus scheduling slop.
pub fn assert_near(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(20),
        "elapsed {actual:?}, expected {expected:?}"
    );
}

// ===========================================================================
// Connector
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
    /// Accept after the given delay.
    Slow(Duration),
}

/// Hands out in-memory transports. Each accepted connection's far side is
/// delivered on the peer channel returned by `MockConnector::new`.
pub struct MockConnector {
    script: Mutex<VecDeque<Dial>>,
    attempts: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<TransportPeer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            peers: tx,
        });
        (connector, rx)
    }

    /// Queue outcomes for the next attempts. Unscripted attempts succeed.
    pub fn script(&self, dials: &[Dial]) {
        self.script.lock().unwrap().extend(dials.iter().copied());
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Transport, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let dial = self.script.lock().unwrap().pop_front().unwrap_or(Dial::Accept);
        if let Dial::Slow(delay) = dial {
            tokio::time::sleep(delay).await;
        }
        match dial {
            Dial::Accept | Dial::Slow(_) => {
                let (transport, peer) = Transport::pair();
                let _ = self.peers.send(peer);
                Ok(transport)
            }
            Dial::Refuse => Err(TransportError::Timeout),
        }
    }
}

// ===========================================================================
// Collaborator API
// ===========================================================================

#[derive(Default)]
pub struct MockApi {
    pub snapshot: Mutex<Option<DraftSnapshot>>,
    /// How long `fetch_snapshot` takes.
    pub fetch_delay: Mutex<Duration>,
    pub submit_results: Mutex<VecDeque<Result<DraftSnapshot, ApiError>>>,
    pub start_results: Mutex<VecDeque<Result<DraftSnapshot, ApiError>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn serving(snapshot: DraftSnapshot) -> Arc<Self> {
        let api = Self::default();
        *api.snapshot.lock().unwrap() = Some(snapshot);
        Arc::new(api)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            status: 503,
            message: "unavailable".into(),
        }
    }
}

#[async_trait]
impl DraftApi for MockApi {
    async fn fetch_snapshot(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError> {
        self.record(format!("fetch {draft_id}"));
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let snapshot = self.snapshot.lock().unwrap().clone();
        snapshot.ok_or_else(Self::unavailable)
    }

    async fn submit_pick(&self, draft_id: &str, item_id: &str) -> Result<DraftSnapshot, ApiError> {
        self.record(format!("pick {draft_id} {item_id}"));
        let next = self.submit_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(Self::unavailable()))
    }

    async fn start_draft(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError> {
        self.record(format!("start {draft_id}"));
        let next = self.start_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(Self::unavailable()))
    }
}

// ===========================================================================
// Update source
// ===========================================================================

/// What the session asked of its update source.
#[derive(Default)]
pub struct UpdatesProbe {
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub resyncs: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub background: Mutex<Vec<bool>>,
}

impl UpdatesProbe {
    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }
}

/// An update source fed directly by the test.
pub struct ScriptedUpdates {
    rx: mpsc::UnboundedReceiver<UpdateEvent>,
    probe: Arc<UpdatesProbe>,
}

pub fn scripted_updates() -> (
    Box<dyn DraftUpdates>,
    mpsc::UnboundedSender<UpdateEvent>,
    Arc<UpdatesProbe>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Arc::new(UpdatesProbe::default());
    let updates = ScriptedUpdates {
        rx,
        probe: probe.clone(),
    };
    (Box::new(updates), tx, probe)
}

#[async_trait]
impl DraftUpdates for ScriptedUpdates {
    fn mode(&self) -> UpdateMode {
        UpdateMode::Push
    }

    async fn start(&mut self) {
        self.probe.started.store(true, Ordering::SeqCst);
    }

    async fn next(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    async fn request_resync(&mut self) {
        self.probe.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_background(&mut self, background: bool) {
        self.probe.background.lock().unwrap().push(background);
    }

    async fn reconnect(&mut self) {
        self.probe.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&mut self) {
        self.probe.stopped.store(true, Ordering::SeqCst);
    }
}

/// Decode a wire frame into an update event.
pub fn frame(text: &str) -> UpdateEvent {
    UpdateEvent::Message(protocol::decode(text).expect("test frame decodes"))
}

/// Receive view updates until one matches.
pub async fn expect_view<F>(rx: &mut mpsc::Receiver<ViewUpdate>, what: &str, matches: F) -> ViewUpdate
where
    F: Fn(&ViewUpdate) -> bool,
{
    let wait = async {
        loop {
            let update = rx.recv().await.expect("view channel closed");
            if matches(&update) {
                return update;
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(600), wait).await {
        Ok(update) => update,
        Err(_) => panic!("no view update matching {what}"),
    }
}

// ===========================================================================
// Draft fixtures
// ===========================================================================

pub const DRAFT: &str = "league-7";

fn item(id: &str, primary: &str, secondary: &str) -> Item {
    Item {
        id: id.into(),
        name: id.into(),
        categories: CategoryPair::new(primary, secondary),
    }
}

pub fn catalog() -> Vec<Item> {
    vec![
        item("ari-sp", "ARI", "SP"),
        item("atl-c", "ATL", "C"),
        item("bal-ss", "BAL", "SS"),
        item("bos-of", "BOS", "OF"),
        item("chc-1b", "CHC", "1B"),
        item("cin-2b", "CIN", "2B"),
        item("cle-3b", "CLE", "3B"),
        item("col-rp", "COL", "RP"),
        item("det-sp", "DET", "SP"),
    ]
}

/// Order ana, ben, cy; three rounds; 90 seconds a turn.
pub fn session(status: DraftStatus, current_pick: u32) -> DraftSession {
    DraftSession {
        id: DRAFT.into(),
        status,
        current_round: (current_pick.max(1) - 1) / 3 + 1,
        current_pick,
        total_rounds: 3,
        pick_time_limit_seconds: 90,
        draft_order: vec!["ana".into(), "ben".into(), "cy".into()],
    }
}

pub fn pick(number: u32, user: &str, item: &str) -> Pick {
    Pick {
        id: format!("srv-{number}"),
        round: (number - 1) / 3 + 1,
        pick_number: number,
        user_id: user.into(),
        item_id: item.into(),
        is_auto_pick: false,
        timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, number).unwrap(),
    }
}

pub fn snapshot(
    status: DraftStatus,
    picks: Vec<Pick>,
    seconds_remaining: Option<u32>,
) -> DraftSnapshot {
    let current_pick = picks.len() as u32 + 1;
    DraftSnapshot {
        session: session(status, current_pick),
        picks,
        items: catalog(),
        seconds_remaining,
    }
}

pub fn pick_made_frame(epoch: &str, number: u32, user: &str, item: &str, seconds: u32) -> String {
    format!(
        r#"{{"type":"pick_made","draftId":"{DRAFT}","turnEpoch":"{epoch}","data":{{
            "pick":{{"id":"srv-{number}","round":{round},"pickNumber":{number},"userId":"{user}",
                     "itemId":"{item}","timestamp":"2026-01-01T00:00:05Z"}},
            "currentPick":{next},"secondsRemaining":{seconds}}},"timestamp":1767225605000}}"#,
        round = (number - 1) / 3 + 1,
        next = number + 1,
    )
}

pub fn timer_frame(epoch: &str, seq: u64, seconds: f64) -> String {
    format!(
        r#"{{"type":"timer_update","draftId":"{DRAFT}","turnEpoch":"{epoch}","seq":{seq},
            "data":{{"secondsRemaining":{seconds}}},"timestamp":1767225600000}}"#
    )
}
