// Draft session state machine: status transitions, the pick log, the
// available pool and turn advancement.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pick::{Item, Pick, UserId};
use super::snake;
use super::validator::{PickRejection, PickRules, PickValidator};
use crate::protocol::DraftSnapshot;
use crate::sync::TurnEpoch;

/// Lifecycle of a draft session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    NotStarted,
    Starting,
    Active,
    Completed,
}

/// The session record shared by every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSession {
    pub id: String,
    pub status: DraftStatus,
    /// Current round (1-indexed). Exceeds `total_rounds` once completed.
    pub current_round: u32,
    /// Overall number of the pick being made (1-indexed).
    pub current_pick: u32,
    pub total_rounds: u32,
    pub pick_time_limit_seconds: u32,
    /// Fixed participant order for round 1. Never changes after creation.
    pub draft_order: Vec<UserId>,
}

impl DraftSession {
    /// Total number of picks in the draft.
    pub fn total_picks(&self) -> u32 {
        self.total_rounds
            .saturating_mul(u32::try_from(self.draft_order.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot {action} while the draft is {from:?}")]
    InvalidTransition {
        from: DraftStatus,
        action: &'static str,
    },
}

/// What happens to the turn after a pick is recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A new turn began; the timer restarts from `seconds_remaining`.
    NextTurn {
        epoch: TurnEpoch,
        holder: UserId,
        seconds_remaining: u32,
    },
    /// The last pick was made.
    Completed,
}

/// A pick accepted by the local state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub pick: Pick,
    pub advance: Advance,
}

/// Result of applying an authoritative pick notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePick {
    /// The pick (and any buffered successors) were appended.
    Applied { appended: usize, advance: Advance },
    /// This pick number is already in the log.
    AlreadyApplied,
    /// The pick arrived ahead of a gap and is held until the gap fills.
    Buffered,
    /// The notification contradicts local state; a full resync is needed.
    NeedsResync(String),
    /// The draft is over; nothing changes.
    Ignored,
}

/// Canonical state of one draft session.
#[derive(Debug, Clone)]
pub struct DraftState {
    session: DraftSession,
    /// Full catalog in its canonical order.
    items: Vec<Item>,
    picks: Vec<Pick>,
    available: HashSet<String>,
    /// Remote picks received ahead of a gap, keyed by pick number.
    pending: BTreeMap<u32, Pick>,
    validator: PickValidator,
}

impl DraftState {
    /// Create a state for a session with an empty pick log.
    pub fn new(session: DraftSession, items: Vec<Item>, rules: PickRules) -> Self {
        let available = items.iter().map(|item| item.id.clone()).collect();
        DraftState {
            session,
            items,
            picks: Vec::new(),
            available,
            pending: BTreeMap::new(),
            validator: PickValidator::new(rules),
        }
    }

    /// Build a state from an authoritative snapshot.
    pub fn from_snapshot(snapshot: DraftSnapshot, rules: PickRules) -> Self {
        let mut state = DraftState::new(snapshot.session.clone(), Vec::new(), rules);
        state.apply_snapshot(snapshot);
        state
    }

    // --- Accessors ---

    pub fn session(&self) -> &DraftSession {
        &self.session
    }

    pub fn status(&self) -> DraftStatus {
        self.session.status
    }

    pub fn picks(&self) -> &[Pick] {
        &self.picks
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn rules(&self) -> PickRules {
        self.validator.rules()
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn is_available(&self, item_id: &str) -> bool {
        self.available.contains(item_id)
    }

    /// Items still in the pool, in catalog order.
    pub fn available_items(&self) -> impl Iterator<Item = &Item> {
        self.items
            .iter()
            .filter(|item| self.available.contains(&item.id))
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn picks_by<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a Pick> + 'a {
        self.picks.iter().filter(move |pick| pick.user_id == user_id)
    }

    /// The participant whose turn it is. `None` unless the draft is active.
    pub fn current_holder(&self) -> Option<&UserId> {
        if self.session.status != DraftStatus::Active {
            return None;
        }
        snake::holder_at(&self.session.draft_order, self.session.current_pick)
    }

    /// Participants adjacent to the current slot in snake order.
    pub fn neighbors(&self) -> snake::Neighbors<'_, UserId> {
        snake::neighbors(
            &self.session.draft_order,
            self.session.current_pick,
            Some(self.session.total_picks()),
        )
    }

    /// Epoch the local state machine assigns to the current turn.
    pub fn local_epoch(&self) -> TurnEpoch {
        TurnEpoch::local(&self.session.id, self.session.current_pick)
    }

    // --- Transitions ---

    /// NotStarted → Starting: the owner kicked off the pre-draft countdown.
    pub fn begin_countdown(&mut self) -> Result<(), StateError> {
        if self.session.status != DraftStatus::NotStarted {
            return Err(StateError::InvalidTransition {
                from: self.session.status,
                action: "begin countdown",
            });
        }
        info!("Draft {} starting", self.session.id);
        self.session.status = DraftStatus::Starting;
        Ok(())
    }

    /// Starting → Active: the pre-draft countdown finished.
    pub fn countdown_elapsed(&mut self) -> Result<Advance, StateError> {
        if self.session.status != DraftStatus::Starting {
            return Err(StateError::InvalidTransition {
                from: self.session.status,
                action: "activate",
            });
        }
        self.session.status = DraftStatus::Active;
        self.session.current_pick = 1;
        self.session.current_round = 1;
        info!("Draft {} active", self.session.id);
        Ok(self.next_turn_or_complete(self.session.pick_time_limit_seconds))
    }

    /// Validate a candidate pick without changing anything.
    pub fn validate_pick(&self, submitter: &str, item_id: &str) -> Result<&Item, PickRejection> {
        self.validator.validate(self, submitter, item_id)
    }

    /// Validate and apply a pick made in this session.
    pub fn accept_pick(
        &mut self,
        submitter: &str,
        item_id: &str,
        is_auto_pick: bool,
        at: DateTime<Utc>,
    ) -> Result<Accepted, PickRejection> {
        self.validate_pick(submitter, item_id)?;
        let pick = Pick {
            id: format!("{}-{}", self.session.id, self.session.current_pick),
            round: self.session.current_round,
            pick_number: self.session.current_pick,
            user_id: submitter.to_string(),
            item_id: item_id.to_string(),
            is_auto_pick,
            timestamp: at,
        };
        self.record(pick.clone());
        let advance = self.next_turn_or_complete(self.session.pick_time_limit_seconds);
        Ok(Accepted { pick, advance })
    }

    /// Synthesize the automatic pick for a turn whose timer ran out.
    ///
    /// Takes the first item in catalog order the holder may draft. If the
    /// category rule leaves nothing, the first available item is used. An
    /// empty pool ends the draft and returns `Ok(None)`.
    pub fn auto_pick(&mut self, at: DateTime<Utc>) -> Result<Option<Accepted>, PickRejection> {
        let holder = self
            .current_holder()
            .cloned()
            .ok_or(PickRejection::SessionNotActive)?;

        let choice = self
            .available_items()
            .find(|item| self.validator.is_eligible(self, &holder, item))
            .or_else(|| {
                let fallback = self.available_items().next();
                if fallback.is_some() {
                    warn!("No category-eligible item for {holder}; falling back to first available");
                }
                fallback
            })
            .map(|item| item.id.clone());

        let Some(item_id) = choice else {
            warn!("Pool exhausted before the last round; completing draft");
            self.complete();
            return Ok(None);
        };

        info!("Auto-picking {item_id} for {holder}");
        let pick = Pick {
            id: format!("{}-{}", self.session.id, self.session.current_pick),
            round: self.session.current_round,
            pick_number: self.session.current_pick,
            user_id: holder,
            item_id,
            is_auto_pick: true,
            timestamp: at,
        };
        self.record(pick.clone());
        let advance = self.next_turn_or_complete(self.session.pick_time_limit_seconds);
        Ok(Some(Accepted { pick, advance }))
    }

    /// Apply an authoritative pick notification.
    ///
    /// Picks are applied strictly in pick-number order. Notifications for
    /// numbers already in the log are ignored, later numbers are buffered
    /// until the gap fills, so any delivery order yields the same log.
    pub fn apply_remote_pick(&mut self, pick: Pick, seconds_remaining: Option<u32>) -> RemotePick {
        match self.session.status {
            DraftStatus::Completed => return RemotePick::Ignored,
            DraftStatus::Active => {}
            other => {
                return RemotePick::NeedsResync(format!(
                    "pick {} received while draft is {other:?}",
                    pick.pick_number
                ))
            }
        }

        let expected = self.session.current_pick;
        if pick.pick_number < expected {
            let consistent = self
                .picks
                .iter()
                .find(|p| p.pick_number == pick.pick_number)
                .is_some_and(|p| p.item_id == pick.item_id);
            if consistent {
                debug!("Pick {} already applied", pick.pick_number);
                return RemotePick::AlreadyApplied;
            }
            return RemotePick::NeedsResync(format!(
                "pick {} conflicts with the local log",
                pick.pick_number
            ));
        }

        if pick.pick_number > expected {
            debug!(
                "Buffering pick {} while waiting for pick {expected}",
                pick.pick_number
            );
            self.pending.insert(pick.pick_number, pick);
            return RemotePick::Buffered;
        }

        let mut next = Some(pick);
        let mut appended = 0;
        while let Some(pick) = next.take() {
            if !self.available.contains(&pick.item_id) {
                return RemotePick::NeedsResync(format!(
                    "item {} in pick {} is no longer available",
                    pick.item_id, pick.pick_number
                ));
            }
            if snake::holder_at(&self.session.draft_order, pick.pick_number)
                .is_some_and(|holder| *holder != pick.user_id)
            {
                warn!(
                    "Pick {} made by {} out of snake order",
                    pick.pick_number, pick.user_id
                );
            }
            self.record(pick);
            appended += 1;
            if self.session.current_pick > self.session.total_picks() {
                break;
            }
            next = self.pending.remove(&self.session.current_pick);
        }

        // Only the newest pick's notification says how long the next turn has.
        let seconds = if self.pending.is_empty() && appended == 1 {
            seconds_remaining.unwrap_or(self.session.pick_time_limit_seconds)
        } else {
            self.session.pick_time_limit_seconds
        };
        let advance = self.next_turn_or_complete(seconds);
        RemotePick::Applied { appended, advance }
    }

    /// Replace everything with an authoritative snapshot.
    pub fn apply_snapshot(&mut self, snapshot: DraftSnapshot) {
        let DraftSnapshot {
            session,
            mut picks,
            items,
            ..
        } = snapshot;
        picks.sort_by_key(|p| p.pick_number);

        let mut available: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
        for pick in &picks {
            if !available.remove(&pick.item_id) {
                warn!(
                    "Snapshot pick {} references unknown or repeated item {}",
                    pick.pick_number, pick.item_id
                );
            }
        }

        info!(
            "Applied snapshot for draft {}: {:?}, pick {}, {} picks, {} available",
            session.id,
            session.status,
            session.current_pick,
            picks.len(),
            available.len()
        );
        self.session = session;
        self.items = items;
        self.picks = picks;
        self.available = available;
        self.pending.clear();
    }

    /// Mark the draft finished. Terminal.
    pub fn complete(&mut self) {
        if self.session.status != DraftStatus::Completed {
            info!("Draft {} completed", self.session.id);
        }
        self.session.status = DraftStatus::Completed;
        self.pending.clear();
    }

    fn record(&mut self, pick: Pick) {
        self.available.remove(&pick.item_id);
        self.session.current_pick = pick.pick_number.saturating_add(1);
        self.session.current_round =
            snake::round_of(self.session.draft_order.len(), self.session.current_pick);
        self.picks.push(pick);
    }

    fn next_turn_or_complete(&mut self, seconds_remaining: u32) -> Advance {
        if self.session.current_pick > self.session.total_picks() {
            self.complete();
            return Advance::Completed;
        }
        match self.current_holder().cloned() {
            Some(holder) => Advance::NextTurn {
                epoch: self.local_epoch(),
                holder,
                seconds_remaining,
            },
            None => {
                self.complete();
                Advance::Completed
            }
        }
    }
}
