// Countdown prediction between authoritative timer ticks.
//
// The server broadcasts the remaining seconds every so often; in between,
// the display is predicted from the last authoritative value and the time
// elapsed since it was received. The displayed value never increases within
// an epoch, and a short grace window after reaching zero absorbs the latency
// before the server announces the next turn.

use std::time::{Duration, Instant};

use tracing::debug;

use super::TurnEpoch;

/// Tunables for countdown prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerConfig {
    /// How long a zero display waits for the server before freezing.
    pub grace: Duration,
    /// Added before flooring so values a hair under an integer don't flicker.
    pub epsilon: f64,
    /// Minimum jump (seconds) that marks an authoritative value as a new turn.
    pub fresh_turn_jump: f64,
    /// A display at or below this many seconds is "near zero".
    pub near_zero: f64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1500),
            epsilon: 0.05,
            fresh_turn_jump: 5.0,
            near_zero: 1.0,
        }
    }
}

/// The last authoritative countdown value. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSnapshot {
    pub epoch: Option<TurnEpoch>,
    pub seconds_remaining: f64,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// No countdown is running.
    Idle,
    Counting,
    /// Predicted zero reached; waiting for the server.
    Grace,
    /// Grace window elapsed without news; frozen at zero.
    Expired,
}

/// One evaluation of the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    pub display: u32,
    pub phase: TimerPhase,
    /// True only on the evaluation that moved the timer into `Expired`.
    pub expired_now: bool,
}

#[derive(Debug)]
pub struct TimerEngine {
    config: TimerConfig,
    anchor: Option<TimerSnapshot>,
    displayed: Option<u32>,
    zero_reached_at: Option<Instant>,
    frozen: bool,
}

impl TimerEngine {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            anchor: None,
            displayed: None,
            zero_reached_at: None,
            frozen: false,
        }
    }

    pub fn anchor(&self) -> Option<&TimerSnapshot> {
        self.anchor.as_ref()
    }

    /// Last value handed to the display (0 when idle).
    pub fn display(&self) -> u32 {
        self.displayed.unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some() && !self.frozen
    }

    /// Start a new turn's countdown unconditionally.
    pub fn reset(&mut self, epoch: Option<TurnEpoch>, seconds_remaining: f64, now: Instant) {
        debug!("Timer reset to {seconds_remaining:.1}s for epoch {epoch:?}");
        self.anchor = Some(TimerSnapshot {
            epoch,
            seconds_remaining: seconds_remaining.max(0.0),
            captured_at: now,
        });
        self.displayed = None;
        self.zero_reached_at = None;
        self.frozen = false;
    }

    /// Take in an authoritative value that already passed the sequencer.
    ///
    /// A different epoch, or a value that is materially larger than a
    /// near-zero display, starts a fresh countdown. Otherwise the anchor is
    /// replaced but the display stays clamped to its previous value.
    pub fn on_authoritative(
        &mut self,
        epoch: Option<&TurnEpoch>,
        seconds_remaining: f64,
        now: Instant,
    ) -> TimerReading {
        let fresh = match &self.anchor {
            None => true,
            Some(anchor) => {
                let epoch_changed = epoch.is_some() && epoch != anchor.epoch.as_ref();
                epoch_changed || self.looks_like_new_turn(seconds_remaining)
            }
        };

        if fresh {
            let epoch = epoch
                .cloned()
                .or_else(|| self.anchor.as_ref().and_then(|a| a.epoch.clone()));
            self.reset(epoch, seconds_remaining, now);
            return self.tick(now);
        }

        if self.frozen {
            return self.tick(now);
        }

        let epoch = self.anchor.as_ref().and_then(|a| a.epoch.clone());
        self.anchor = Some(TimerSnapshot {
            epoch,
            seconds_remaining: seconds_remaining.max(0.0),
            captured_at: now,
        });
        if seconds_remaining > 0.0 {
            self.zero_reached_at = None;
        }
        self.tick(now)
    }

    /// Evaluate the countdown at `now`.
    pub fn tick(&mut self, now: Instant) -> TimerReading {
        let Some(anchor) = &self.anchor else {
            return TimerReading {
                display: 0,
                phase: TimerPhase::Idle,
                expired_now: false,
            };
        };
        if self.frozen {
            return TimerReading {
                display: 0,
                phase: TimerPhase::Expired,
                expired_now: false,
            };
        }

        let elapsed = now.saturating_duration_since(anchor.captured_at).as_secs_f64();
        let predicted = (anchor.seconds_remaining - elapsed).max(0.0);
        let raw = (predicted + self.config.epsilon).floor() as u32;
        let display = self.displayed.map_or(raw, |prev| prev.min(raw));
        self.displayed = Some(display);

        if predicted > 0.0 {
            return TimerReading {
                display,
                phase: TimerPhase::Counting,
                expired_now: false,
            };
        }

        let zero_at = *self.zero_reached_at.get_or_insert(now);
        if now.saturating_duration_since(zero_at) >= self.config.grace {
            debug!("Grace window elapsed; freezing countdown at zero");
            self.frozen = true;
            self.displayed = Some(0);
            return TimerReading {
                display: 0,
                phase: TimerPhase::Expired,
                expired_now: true,
            };
        }
        TimerReading {
            display,
            phase: TimerPhase::Grace,
            expired_now: false,
        }
    }

    /// Re-anchor at `now` from the value currently shown, discarding drift
    /// accumulated while the process was in the background.
    pub fn reanchor(&mut self, now: Instant) {
        if self.frozen {
            return;
        }
        let Some(displayed) = self.displayed else {
            return;
        };
        if let Some(anchor) = &mut self.anchor {
            anchor.seconds_remaining = displayed as f64;
            anchor.captured_at = now;
            if displayed > 0 {
                self.zero_reached_at = None;
            }
        }
    }

    /// Stop counting (turn finished, disconnected, torn down).
    pub fn clear(&mut self) {
        self.anchor = None;
        self.displayed = None;
        self.zero_reached_at = None;
        self.frozen = false;
    }

    fn looks_like_new_turn(&self, seconds_remaining: f64) -> bool {
        match self.displayed {
            Some(shown) => {
                let shown = shown as f64;
                shown <= self.config.near_zero
                    && seconds_remaining >= shown + self.config.fresh_turn_jump
            }
            None => false,
        }
    }
}
