// Inbound message ordering and countdown reconciliation.

pub mod sequencer;
pub mod timer;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use sequencer::{Sequencer, Verdict};
pub use timer::{TimerConfig, TimerEngine, TimerPhase, TimerReading, TimerSnapshot};

const LOCAL_PREFIX: &str = "local:";

/// Opaque identifier of one turn assignment. A new epoch invalidates every
/// turn-scoped message of the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnEpoch(String);

impl TurnEpoch {
    pub fn new(id: impl Into<String>) -> Self {
        TurnEpoch(id.into())
    }

    /// Epoch minted by this client when it advances a turn on its own
    /// (pre-draft countdown, timer expiry). The server's epoch for the same
    /// turn replaces it as soon as one arrives.
    pub fn local(draft_id: &str, pick_number: u32) -> Self {
        TurnEpoch(format!("{LOCAL_PREFIX}{draft_id}:{pick_number}"))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
