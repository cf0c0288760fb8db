// Staleness and duplicate filtering for turn-scoped messages.
//
// Reconnects, retries and push+poll dual delivery all redeliver messages
// at least once. The sequencer keeps just enough history to make applying
// them idempotent: the adopted epoch, the last accepted sequence number in
// it, a bounded list of retired epochs and the last accepted pick identity.

use std::collections::VecDeque;

use tracing::debug;

use super::TurnEpoch;
use crate::draft::{Pick, PickIdentity};

/// How many superseded epochs are remembered.
const RETIRED_CAPACITY: usize = 64;

/// Outcome of offering a message to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Apply the message. `new_epoch` is set when it moved the adopted epoch.
    Accept { new_epoch: bool },
    /// Already seen; drop silently.
    Duplicate,
    /// Belongs to a superseded epoch; drop silently.
    Stale,
    /// Refers to an epoch never adopted while another is current: a turn
    /// advance was missed and a resync is needed.
    UnknownEpoch,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

#[derive(Debug, Default)]
pub struct Sequencer {
    epoch: Option<TurnEpoch>,
    /// Pick number of the turn the adopted epoch belongs to, when known.
    epoch_turn: Option<u32>,
    last_seq: u64,
    retired: VecDeque<TurnEpoch>,
    last_pick: Option<PickIdentity>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> Option<&TurnEpoch> {
        self.epoch.as_ref()
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Adopt `epoch` as the current turn unless it is already current,
    /// retired, or belongs to an earlier turn than the adopted one.
    /// Adoption resets the sequence counter to 0.
    pub fn adopt(&mut self, epoch: TurnEpoch, turn: Option<u32>) -> bool {
        if self.epoch.as_ref() == Some(&epoch) {
            if turn.is_some() {
                self.epoch_turn = turn;
            }
            return false;
        }
        if self.is_retired(&epoch) {
            return false;
        }
        if let (Some(turn), Some(current)) = (turn, self.epoch_turn) {
            if turn < current {
                debug!("Ignoring epoch {epoch} for earlier turn {turn} (current turn {current})");
                self.retire(epoch);
                return false;
            }
        }

        debug!("Adopting epoch {epoch}");
        if let Some(previous) = self.epoch.take() {
            self.retire(previous);
        }
        self.epoch = Some(epoch);
        self.epoch_turn = turn;
        self.last_seq = 0;
        true
    }

    /// Filter a `timer_update`.
    pub fn admit_timer(&mut self, epoch: Option<&TurnEpoch>, seq: Option<u64>) -> Verdict {
        let mut new_epoch = false;
        if let Some(epoch) = epoch {
            if self.epoch.as_ref() != Some(epoch) {
                if self.is_retired(epoch) {
                    return Verdict::Stale;
                }
                let replaceable = self.epoch.as_ref().map_or(true, TurnEpoch::is_local);
                if !replaceable {
                    return Verdict::UnknownEpoch;
                }
                new_epoch = self.adopt(epoch.clone(), self.epoch_turn);
            }
        }

        if let Some(seq) = seq {
            if seq <= self.last_seq {
                return Verdict::Duplicate;
            }
            self.last_seq = seq;
        }
        Verdict::Accept { new_epoch }
    }

    /// Filter a `pick_made` / `auto_pick`. The notice's epoch is the epoch
    /// of the turn *after* the pick.
    pub fn admit_pick(&mut self, pick: &Pick, epoch: Option<&TurnEpoch>) -> Verdict {
        if epoch.is_some_and(|e| self.is_retired(e)) {
            return Verdict::Stale;
        }
        let identity = pick.identity();
        if self.last_pick.as_ref() == Some(&identity) {
            return Verdict::Duplicate;
        }
        self.last_pick = Some(identity);

        let new_epoch = match epoch {
            Some(epoch) => self.adopt(epoch.clone(), Some(pick.pick_number.saturating_add(1))),
            None => false,
        };
        Verdict::Accept { new_epoch }
    }

    /// Filter a full-state message whose session is at `current_pick`.
    pub fn admit_snapshot(&mut self, epoch: Option<&TurnEpoch>, current_pick: u32) -> Verdict {
        if let Some(turn) = self.epoch_turn {
            if current_pick < turn {
                return Verdict::Stale;
            }
        }
        match epoch {
            Some(epoch) => {
                if self.is_retired(epoch) {
                    return Verdict::Stale;
                }
                let new_epoch = self.adopt(epoch.clone(), Some(current_pick));
                Verdict::Accept { new_epoch }
            }
            None => {
                // Snapshots without an epoch (poll fallback) still move the
                // turn forward; the next epoch-bearing message is adopted.
                let advanced = self.epoch_turn.map_or(true, |turn| current_pick > turn);
                if advanced {
                    if let Some(previous) = self.epoch.take() {
                        self.retire(previous);
                    }
                    self.epoch_turn = Some(current_pick);
                    self.last_seq = 0;
                }
                Verdict::Accept { new_epoch: advanced }
            }
        }
    }

    /// Forget everything, e.g. when switching to another draft.
    pub fn reset(&mut self) {
        *self = Sequencer::default();
    }

    fn is_retired(&self, epoch: &TurnEpoch) -> bool {
        self.retired.contains(epoch)
    }

    fn retire(&mut self, epoch: TurnEpoch) {
        if self.is_retired(&epoch) {
            return;
        }
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(epoch);
    }
}
