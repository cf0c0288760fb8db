// The live draft session: owns the state machine, the sequencer and the
// timer engine, consumes authoritative updates, and publishes
// `ViewUpdate`s for whatever presentation is attached.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use draftline_core::draft::{
    Advance, DraftState, DraftStatus, ItemId, Pick, PickRejection, RemotePick, UserId,
};
use draftline_core::protocol::{DraftSnapshot, Inbound, PickNotice, ServerMessage};
use draftline_core::sync::{Sequencer, TimerEngine, TimerPhase, TimerReading, TurnEpoch, Verdict};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, DraftApi};
use crate::config::{Config, Identity, RulesConfig, TimerSettings};
use crate::connection::ConnectionStatus;
use crate::updates::{DraftUpdates, UpdateEvent};

/// Messages held while the first snapshot is outstanding.
const EARLY_CAPACITY: usize = 256;

const VIEW_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub draft_id: String,
    /// The participant this session acts as.
    pub user_id: UserId,
    pub timer: TimerSettings,
    pub rules: RulesConfig,
}

impl SessionConfig {
    pub fn new(config: &Config, identity: &Identity) -> Self {
        Self {
            draft_id: config.draft_id.clone(),
            user_id: identity.user_id.clone(),
            timer: config.timer,
            rules: config.rules,
        }
    }
}

/// Something the owner asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pick(ItemId),
    /// Owner only: start the draft.
    Start,
    Background(bool),
    Reconnect,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command: {0}")]
    Unknown(String),
}

impl Command {
    /// Parse a line of user input: `pick <item>`, `start`, `bg`, `fg`,
    /// `reconnect` or `quit`.
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let command = match verb.to_ascii_lowercase().as_str() {
            "pick" | "p" => {
                let item = words.next().ok_or(CommandError::Usage("pick <item-id>"))?;
                Command::Pick(item.to_string())
            }
            "start" => Command::Start,
            "bg" => Command::Background(true),
            "fg" => Command::Background(false),
            "reconnect" => Command::Reconnect,
            "quit" | "q" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        if words.next().is_some() {
            return Err(CommandError::Usage(match command {
                Command::Pick(_) => "pick <item-id>",
                _ => "commands other than pick take no arguments",
            }));
        }
        Ok(command)
    }
}

/// Summary of the draft for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftView {
    pub draft_id: String,
    pub status: DraftStatus,
    pub round: u32,
    pub total_rounds: u32,
    pub pick: u32,
    pub holder: Option<UserId>,
    pub picks_made: usize,
    pub available: usize,
}

impl DraftView {
    fn of(state: &DraftState) -> Self {
        let session = state.session();
        Self {
            draft_id: session.id.clone(),
            status: session.status,
            round: session.current_round,
            total_rounds: session.total_rounds,
            pick: session.current_pick,
            holder: state.current_holder().cloned(),
            picks_made: state.picks().len(),
            available: state.available_count(),
        }
    }
}

/// Everything a presentation layer needs to follow the draft.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Connection(ConnectionStatus),
    /// Full state was (re)loaded.
    Snapshot(DraftView),
    /// Pre-draft countdown.
    Countdown { seconds: u32 },
    Timer { seconds: u32, phase: TimerPhase },
    PickMade(Pick),
    TurnChanged {
        pick_number: u32,
        holder: UserId,
        just_picked: Option<UserId>,
        up_next: Option<UserId>,
        yours: bool,
    },
    PickRejected(PickRejection),
    RequestFailed(String),
    Completed,
}

impl fmt::Display for ViewUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewUpdate::Connection(status) => write!(f, "connection: {status:?}"),
            ViewUpdate::Snapshot(view) => {
                write!(
                    f,
                    "draft {}: {:?}, round {}/{}, pick {}, {} picked, {} available",
                    view.draft_id,
                    view.status,
                    view.round.min(view.total_rounds),
                    view.total_rounds,
                    view.pick,
                    view.picks_made,
                    view.available
                )?;
                if let Some(holder) = &view.holder {
                    write!(f, ", on the clock: {holder}")?;
                }
                Ok(())
            }
            ViewUpdate::Countdown { seconds } => write!(f, "draft starts in {seconds}s"),
            ViewUpdate::Timer { seconds, phase } => match phase {
                TimerPhase::Grace => write!(f, "timer: 0s (waiting for server)"),
                TimerPhase::Expired => write!(f, "timer: expired"),
                _ => write!(f, "timer: {seconds}s"),
            },
            ViewUpdate::PickMade(pick) => write!(
                f,
                "pick {} (round {}): {} took {}{}",
                pick.pick_number,
                pick.round,
                pick.user_id,
                pick.item_id,
                if pick.is_auto_pick { " [auto]" } else { "" }
            ),
            ViewUpdate::TurnChanged {
                pick_number,
                holder,
                just_picked,
                up_next,
                yours,
            } => {
                write!(f, "pick {pick_number}: {holder} is on the clock")?;
                if *yours {
                    write!(f, " (your turn)")?;
                }
                if let Some(user) = just_picked {
                    write!(f, ", just picked: {user}")?;
                }
                if let Some(user) = up_next {
                    write!(f, ", up next: {user}")?;
                }
                Ok(())
            }
            ViewUpdate::PickRejected(rejection) => write!(f, "pick rejected: {rejection}"),
            ViewUpdate::RequestFailed(message) => write!(f, "error: {message}"),
            ViewUpdate::Completed => write!(f, "draft completed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("live draft session has stopped")]
    Stopped,
}

/// Cloneable command sender for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }
}

/// An explicitly owned live draft session. It runs until `stop()` is called
/// (or every handle is dropped), independently of any view consumer.
pub struct LiveDraft {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl LiveDraft {
    pub fn start(
        config: SessionConfig,
        updates: Box<dyn DraftUpdates>,
        api: Arc<dyn DraftApi>,
    ) -> (LiveDraft, mpsc::Receiver<ViewUpdate>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (view_tx, view_rx) = mpsc::channel(VIEW_CAPACITY);
        let (api_tx, api_rx) = mpsc::channel(16);

        info!(
            "Starting live draft {} as {} ({:?} updates)",
            config.draft_id,
            config.user_id,
            updates.mode()
        );
        let session = Session::new(config, api, api_tx);
        let task = tokio::spawn(run(session, updates, command_rx, api_rx, view_tx));

        (
            LiveDraft {
                handle: SessionHandle {
                    commands: command_tx,
                },
                task,
            },
            view_rx,
        )
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.handle.send(command).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the session and wait for it to tear down its update source.
    pub async fn stop(self) {
        let _ = self.handle.send(Command::Quit).await;
        if let Err(e) = self.task.await {
            warn!("Live draft task ended abnormally: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run(
    mut session: Session,
    mut updates: Box<dyn DraftUpdates>,
    mut commands: mpsc::Receiver<Command>,
    mut api_rx: mpsc::Receiver<ApiOutcome>,
    view: mpsc::Sender<ViewUpdate>,
) {
    updates.start().await;
    session.fetch_snapshot();

    let mut ticker = tokio::time::interval(session.config.timer.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut updates_open = true;

    loop {
        let ticking = session.is_ticking();
        let countdown = session.countdown_until;

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Quit) | None => {
                    info!("Live draft {} stopping", session.config.draft_id);
                    break;
                }
                Some(Command::Background(background)) => {
                    updates.set_background(background).await;
                    session.on_background(background);
                }
                Some(Command::Reconnect) => updates.reconnect().await,
                Some(command) => session.on_command(command),
            },

            event = updates.next(), if updates_open => match event {
                Some(UpdateEvent::Connection(status)) => session.on_connection(status),
                Some(UpdateEvent::Message(inbound)) => session.on_inbound(inbound),
                None => {
                    info!("Update source closed");
                    updates_open = false;
                }
            },

            Some(outcome) = api_rx.recv() => session.on_api(outcome),

            _ = ticker.tick(), if ticking => session.on_tick(),

            _ = tokio::time::sleep_until(countdown.unwrap_or_else(Instant::now)), if countdown.is_some() => {
                session.on_countdown_elapsed();
            }
        }

        if std::mem::take(&mut session.resync) {
            session.resync_pending = true;
            updates.request_resync().await;
        }
        for update in session.outbox.drain(..) {
            match update {
                // Countdown values are superseded by the next one; never
                // stall the loop on them.
                ViewUpdate::Timer { .. } | ViewUpdate::Countdown { .. } => {
                    if view.try_send(update).is_err() {
                        debug!("View consumer lagging; dropped a countdown value");
                    }
                }
                other => {
                    let _ = view.send(other).await;
                }
            }
        }
    }

    updates.stop().await;
    session.timer.clear();
    info!("Live draft {} stopped", session.config.draft_id);
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

enum ApiOutcome {
    Snapshot(Result<DraftSnapshot, ApiError>),
    Submitted {
        item_id: ItemId,
        result: Result<DraftSnapshot, ApiError>,
    },
    Started(Result<DraftSnapshot, ApiError>),
}

struct Session {
    config: SessionConfig,
    api: Arc<dyn DraftApi>,
    api_tx: mpsc::Sender<ApiOutcome>,
    state: Option<DraftState>,
    sequencer: Sequencer,
    timer: TimerEngine,
    /// Updates received before the first snapshot.
    early: VecDeque<Inbound>,
    countdown_until: Option<Instant>,
    countdown_shown: Option<u32>,
    last_timer: Option<(u32, TimerPhase)>,
    announced_pick: Option<u32>,
    completed: bool,
    opened_once: bool,
    snapshot_in_flight: bool,
    pick_in_flight: Option<ItemId>,
    resync: bool,
    /// A resync was asked for and no snapshot has been applied since.
    resync_pending: bool,
    outbox: Vec<ViewUpdate>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl Session {
    fn new(config: SessionConfig, api: Arc<dyn DraftApi>, api_tx: mpsc::Sender<ApiOutcome>) -> Self {
        let timer = TimerEngine::new(config.timer.engine);
        Self {
            config,
            api,
            api_tx,
            state: None,
            sequencer: Sequencer::new(),
            timer,
            early: VecDeque::new(),
            countdown_until: None,
            countdown_shown: None,
            last_timer: None,
            announced_pick: None,
            completed: false,
            opened_once: false,
            snapshot_in_flight: false,
            pick_in_flight: None,
            resync: false,
            resync_pending: false,
            outbox: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.status() == DraftStatus::Active)
    }

    fn is_ticking(&self) -> bool {
        self.countdown_until.is_some() || (self.is_active() && self.timer.is_running())
    }

    // --- Collaborator calls ---

    fn fetch_snapshot(&mut self) {
        if self.snapshot_in_flight {
            return;
        }
        self.snapshot_in_flight = true;
        let api = self.api.clone();
        let tx = self.api_tx.clone();
        let draft_id = self.config.draft_id.clone();
        tokio::spawn(async move {
            let result = api.fetch_snapshot(&draft_id).await;
            let _ = tx.send(ApiOutcome::Snapshot(result)).await;
        });
    }

    fn on_api(&mut self, outcome: ApiOutcome) {
        match outcome {
            ApiOutcome::Snapshot(result) => {
                self.snapshot_in_flight = false;
                match result {
                    Ok(snapshot) => self.offer_snapshot(snapshot, None),
                    Err(e) => {
                        warn!("Snapshot fetch failed: {e}");
                        self.outbox
                            .push(ViewUpdate::RequestFailed(format!("could not load draft: {e}")));
                        if self.state.is_none() {
                            self.resync = true;
                        }
                    }
                }
            }
            ApiOutcome::Submitted { item_id, result } => {
                self.pick_in_flight = None;
                match result {
                    Ok(snapshot) => {
                        info!("Pick {item_id} accepted by server");
                        self.offer_snapshot(snapshot, None);
                    }
                    Err(e) => {
                        let rejection = self
                            .state
                            .as_ref()
                            .and_then(|state| e.as_rejection(state, &self.config.user_id, &item_id));
                        match rejection {
                            Some(rejection) => {
                                info!("Server rejected pick {item_id}: {rejection}");
                                self.outbox.push(ViewUpdate::PickRejected(rejection));
                                // Local state let the pick through, so it is behind.
                                self.resync = true;
                            }
                            None => {
                                warn!("Submitting pick {item_id} failed: {e}");
                                self.outbox.push(ViewUpdate::RequestFailed(format!(
                                    "pick {item_id} failed: {e}"
                                )));
                            }
                        }
                    }
                }
            }
            ApiOutcome::Started(result) => match result {
                Ok(snapshot) => {
                    self.offer_snapshot(snapshot, None);
                    let began = self
                        .state
                        .as_mut()
                        .is_some_and(|state| {
                            state.status() == DraftStatus::NotStarted && state.begin_countdown().is_ok()
                        });
                    if began {
                        self.start_countdown();
                    }
                }
                Err(e) => {
                    warn!("Starting the draft failed: {e}");
                    self.outbox
                        .push(ViewUpdate::RequestFailed(format!("could not start draft: {e}")));
                }
            },
        }
    }

    // --- Commands ---

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Pick(item_id) => self.submit_pick(item_id),
            Command::Start => self.start_draft(),
            // Handled by the loop.
            Command::Background(_) | Command::Reconnect | Command::Quit => {}
        }
    }

    fn submit_pick(&mut self, item_id: ItemId) {
        let Some(state) = &self.state else {
            self.outbox
                .push(ViewUpdate::PickRejected(PickRejection::SessionNotActive));
            return;
        };
        if let Err(rejection) = state.validate_pick(&self.config.user_id, &item_id) {
            info!("Pick {item_id} rejected locally: {rejection}");
            self.outbox.push(ViewUpdate::PickRejected(rejection));
            return;
        }
        if let Some(pending) = &self.pick_in_flight {
            self.outbox.push(ViewUpdate::RequestFailed(format!(
                "pick {pending} is still being submitted"
            )));
            return;
        }

        info!("Submitting pick {item_id}");
        self.pick_in_flight = Some(item_id.clone());
        let api = self.api.clone();
        let tx = self.api_tx.clone();
        let draft_id = self.config.draft_id.clone();
        tokio::spawn(async move {
            let result = api.submit_pick(&draft_id, &item_id).await;
            let _ = tx.send(ApiOutcome::Submitted { item_id, result }).await;
        });
    }

    fn start_draft(&mut self) {
        match self.state.as_ref().map(DraftState::status) {
            Some(DraftStatus::NotStarted) => {}
            Some(status) => {
                self.outbox
                    .push(ViewUpdate::RequestFailed(format!("draft is already {status:?}")));
                return;
            }
            None => {
                self.outbox
                    .push(ViewUpdate::RequestFailed("draft is not loaded yet".into()));
                return;
            }
        }

        info!("Asking the server to start draft {}", self.config.draft_id);
        let api = self.api.clone();
        let tx = self.api_tx.clone();
        let draft_id = self.config.draft_id.clone();
        tokio::spawn(async move {
            let result = api.start_draft(&draft_id).await;
            let _ = tx.send(ApiOutcome::Started(result)).await;
        });
    }

    fn on_background(&mut self, background: bool) {
        if !background {
            self.timer.reanchor(now());
        }
    }

    // --- Update source ---

    fn on_connection(&mut self, status: ConnectionStatus) {
        self.outbox.push(ViewUpdate::Connection(status));
        if status == ConnectionStatus::Open {
            if self.opened_once {
                info!("Connection reopened; refreshing draft state");
                self.fetch_snapshot();
            } else if self.state.is_none() || self.resync_pending {
                info!("Connection open with draft state outstanding; fetching it");
                self.fetch_snapshot();
            }
            self.opened_once = true;
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        if !inbound.draft_id.is_empty() && inbound.draft_id != self.config.draft_id {
            debug!("Ignoring message for draft {}", inbound.draft_id);
            return;
        }
        if self.state.is_none() {
            match inbound.message {
                ServerMessage::DraftState(_) => {}
                ServerMessage::Connected | ServerMessage::Ping | ServerMessage::Pong => return,
                _ => {
                    if self.early.len() >= EARLY_CAPACITY {
                        warn!("Too many updates before the first snapshot; dropping the oldest");
                        self.early.pop_front();
                    }
                    self.early.push_back(inbound);
                    return;
                }
            }
        }

        let Inbound {
            turn_epoch,
            seq,
            message,
            ..
        } = inbound;
        match message {
            ServerMessage::Connected => debug!("Server acknowledged the connection"),
            ServerMessage::Ping | ServerMessage::Pong => {}
            ServerMessage::TimerUpdate(payload) => {
                self.on_timer_update(turn_epoch, seq, payload.seconds_remaining)
            }
            ServerMessage::PickMade(notice) | ServerMessage::AutoPick(notice) => {
                self.on_pick_notice(notice, turn_epoch)
            }
            ServerMessage::DraftState(snapshot) => self.offer_snapshot(*snapshot, turn_epoch),
            ServerMessage::DraftCompleted => {
                info!("Server announced draft completion");
                self.finish();
            }
        }
    }

    fn on_timer_update(&mut self, epoch: Option<TurnEpoch>, seq: Option<u64>, seconds: f64) {
        match self.sequencer.admit_timer(epoch.as_ref(), seq) {
            Verdict::Accept { .. } => {
                if !self.is_active() {
                    debug!("Timer update while the draft is not active");
                    return;
                }
                let reading = self.timer.on_authoritative(epoch.as_ref(), seconds, now());
                self.publish_timer(reading);
                if reading.expired_now {
                    self.on_expired();
                }
            }
            Verdict::UnknownEpoch => {
                info!("Timer update for unknown epoch {epoch:?}; a turn advance was missed");
                self.resync = true;
            }
            verdict => debug!("Discarding {verdict:?} timer update (seq {seq:?})"),
        }
    }

    fn on_pick_notice(&mut self, notice: PickNotice, epoch: Option<TurnEpoch>) {
        let verdict = self.sequencer.admit_pick(&notice.pick, epoch.as_ref());
        if !verdict.is_accepted() {
            debug!(
                "Discarding {verdict:?} notice for pick {}",
                notice.pick.pick_number
            );
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };

        match state.apply_remote_pick(notice.pick, notice.seconds_remaining) {
            RemotePick::Applied { appended, advance } => {
                let picks = state.picks();
                let fresh = picks[picks.len().saturating_sub(appended)..].to_vec();
                self.outbox.extend(fresh.into_iter().map(ViewUpdate::PickMade));
                let server_epoch = if epoch.is_some() {
                    self.sequencer.epoch().cloned()
                } else {
                    None
                };
                self.on_advance(advance, server_epoch);
            }
            RemotePick::NeedsResync(reason) => {
                warn!("{reason}; requesting resync");
                self.resync = true;
            }
            other => debug!("Pick notice not applied: {other:?}"),
        }
    }

    fn offer_snapshot(&mut self, snapshot: DraftSnapshot, epoch: Option<TurnEpoch>) {
        if snapshot.session.id != self.config.draft_id {
            warn!("Ignoring snapshot for draft {}", snapshot.session.id);
            return;
        }
        let verdict = self
            .sequencer
            .admit_snapshot(epoch.as_ref(), snapshot.session.current_pick);
        if !verdict.is_accepted() {
            debug!(
                "Discarding {verdict:?} snapshot at pick {}",
                snapshot.session.current_pick
            );
            return;
        }

        self.resync_pending = false;
        let seconds = snapshot.seconds_remaining;
        let first = self.state.is_none();
        let before = match &mut self.state {
            Some(state) => {
                let before = state.picks().len();
                state.apply_snapshot(snapshot);
                Some(before)
            }
            None => {
                self.state = Some(DraftState::from_snapshot(snapshot, self.config.rules.pick));
                None
            }
        };
        let Some(state) = &self.state else {
            return;
        };
        if let Some(before) = before {
            let fresh = state.picks().iter().skip(before).cloned();
            self.outbox.extend(fresh.map(ViewUpdate::PickMade));
        }
        self.outbox.push(ViewUpdate::Snapshot(DraftView::of(state)));
        self.sync_turn(seconds);

        if first && !self.early.is_empty() {
            debug!("Replaying {} early updates", self.early.len());
            for inbound in std::mem::take(&mut self.early) {
                self.on_inbound(inbound);
            }
        }
    }

    /// Bring the countdowns in line with freshly loaded state.
    fn sync_turn(&mut self, seconds: Option<u32>) {
        let Some(state) = &self.state else {
            return;
        };
        match state.status() {
            DraftStatus::NotStarted => {
                self.countdown_until = None;
                self.timer.clear();
            }
            DraftStatus::Starting => {
                if self.countdown_until.is_none() {
                    self.start_countdown();
                }
            }
            DraftStatus::Active => {
                self.countdown_until = None;
                self.countdown_shown = None;
                let limit = state.session().pick_time_limit_seconds;
                let epoch = self.turn_epoch();
                let now = now();
                let reading = match seconds {
                    Some(seconds) => self.timer.on_authoritative(Some(&epoch), seconds as f64, now),
                    None => {
                        let same_turn =
                            self.timer.anchor().and_then(|a| a.epoch.as_ref()) == Some(&epoch);
                        if !same_turn {
                            self.timer.reset(Some(epoch), limit as f64, now);
                        }
                        self.timer.tick(now)
                    }
                };
                self.announce_turn();
                self.publish_timer(reading);
            }
            DraftStatus::Completed => self.finish(),
        }
    }

    /// The epoch of the current turn, minting a local one if none is held.
    fn turn_epoch(&mut self) -> TurnEpoch {
        if let Some(epoch) = self.sequencer.epoch() {
            return epoch.clone();
        }
        let Some(state) = &self.state else {
            return TurnEpoch::local(&self.config.draft_id, 0);
        };
        let local = state.local_epoch();
        self.sequencer
            .adopt(local.clone(), Some(state.session().current_pick));
        local
    }

    fn on_advance(&mut self, advance: Advance, server_epoch: Option<TurnEpoch>) {
        match advance {
            Advance::NextTurn {
                epoch,
                seconds_remaining,
                ..
            } => {
                let epoch = match server_epoch {
                    Some(epoch) => epoch,
                    None => {
                        let turn = self.state.as_ref().map(|s| s.session().current_pick);
                        self.sequencer.adopt(epoch.clone(), turn);
                        epoch
                    }
                };
                let now = now();
                self.timer.reset(Some(epoch), seconds_remaining as f64, now);
                let reading = self.timer.tick(now);
                self.announce_turn();
                self.publish_timer(reading);
            }
            Advance::Completed => self.finish(),
        }
    }

    fn announce_turn(&mut self) {
        let Some(state) = &self.state else {
            return;
        };
        let Some(holder) = state.current_holder() else {
            return;
        };
        let pick_number = state.session().current_pick;
        if self.announced_pick == Some(pick_number) {
            return;
        }
        self.announced_pick = Some(pick_number);
        let neighbors = state.neighbors();
        self.outbox.push(ViewUpdate::TurnChanged {
            pick_number,
            holder: holder.clone(),
            just_picked: neighbors.just_picked.cloned(),
            up_next: neighbors.up_next.cloned(),
            yours: *holder == self.config.user_id,
        });
    }

    fn publish_timer(&mut self, reading: TimerReading) {
        let shown = (reading.display, reading.phase);
        if self.last_timer == Some(shown) {
            return;
        }
        self.last_timer = Some(shown);
        self.outbox.push(ViewUpdate::Timer {
            seconds: reading.display,
            phase: reading.phase,
        });
    }

    // --- Clocks ---

    fn start_countdown(&mut self) {
        let duration = self.config.rules.pre_draft_countdown;
        info!("Pre-draft countdown: {duration:?}");
        self.countdown_until = Some(Instant::now() + duration);
        let seconds = duration.as_secs_f64().ceil() as u32;
        self.countdown_shown = Some(seconds);
        self.outbox.push(ViewUpdate::Countdown { seconds });
    }

    fn on_countdown_elapsed(&mut self) {
        self.countdown_until = None;
        let shown = self.countdown_shown.take();
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match state.countdown_elapsed() {
            Ok(advance) => {
                info!("Draft {} is live", self.config.draft_id);
                if shown != Some(0) {
                    self.outbox.push(ViewUpdate::Countdown { seconds: 0 });
                }
                self.on_advance(advance, None);
            }
            Err(e) => debug!("Countdown elapsed but {e}"),
        }
    }

    fn on_tick(&mut self) {
        if let Some(deadline) = self.countdown_until {
            let left = deadline.saturating_duration_since(Instant::now());
            let seconds = left.as_secs_f64().ceil() as u32;
            if self.countdown_shown != Some(seconds) {
                self.countdown_shown = Some(seconds);
                self.outbox.push(ViewUpdate::Countdown { seconds });
            }
        }
        if self.is_active() && self.timer.is_running() {
            let reading = self.timer.tick(now());
            self.publish_timer(reading);
            if reading.expired_now {
                self.on_expired();
            }
        }
    }

    /// The grace window ran out with no word from the server.
    fn on_expired(&mut self) {
        if !self.config.rules.local_auto_pick {
            info!("Turn expired; waiting for the server's automatic pick");
            self.resync = true;
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match state.auto_pick(Utc::now()) {
            Ok(Some(accepted)) => {
                self.outbox.push(ViewUpdate::PickMade(accepted.pick));
                self.on_advance(accepted.advance, None);
            }
            Ok(None) => self.finish(),
            Err(e) => warn!("Automatic pick failed: {e}"),
        }
    }

    fn finish(&mut self) {
        self.timer.clear();
        self.countdown_until = None;
        self.countdown_shown = None;
        if let Some(state) = self.state.as_mut() {
            state.complete();
        }
        if !self.completed {
            self.completed = true;
            self.outbox.push(ViewUpdate::Completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("pick ari-sp").unwrap(),
            Command::Pick("ari-sp".into())
        );
        assert_eq!(Command::parse("  P  x ").unwrap(), Command::Pick("x".into()));
        assert_eq!(Command::parse("start").unwrap(), Command::Start);
        assert_eq!(Command::parse("bg").unwrap(), Command::Background(true));
        assert_eq!(Command::parse("fg").unwrap(), Command::Background(false));
        assert_eq!(Command::parse("reconnect").unwrap(), Command::Reconnect);
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_bad_commands() {
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("pick"),
            Err(CommandError::Usage("pick <item-id>"))
        );
        assert!(matches!(Command::parse("pick a b"), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("start now"), Err(CommandError::Usage(_))));
        assert_eq!(
            Command::parse("trade x"),
            Err(CommandError::Unknown("trade".into()))
        );
    }

    #[test]
    fn view_updates_render_as_lines() {
        let turn = ViewUpdate::TurnChanged {
            pick_number: 4,
            holder: "cy".into(),
            just_picked: Some("ben".into()),
            up_next: Some("ben".into()),
            yours: true,
        };
        assert_eq!(
            turn.to_string(),
            "pick 4: cy is on the clock (your turn), just picked: ben, up next: ben"
        );
        assert_eq!(
            ViewUpdate::Timer {
                seconds: 12,
                phase: TimerPhase::Counting
            }
            .to_string(),
            "timer: 12s"
        );
        assert_eq!(ViewUpdate::Completed.to_string(), "draft completed");
    }
}
