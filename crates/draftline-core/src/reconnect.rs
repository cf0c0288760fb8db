// Reconnection policy: when, and whether, to reopen a closed connection.

use std::time::Duration;

use tracing::debug;

/// Normal closure; the peer meant to hang up.
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer is going away (shutdown, navigation, redeploy).
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fixed delay for retries that bypass backoff.
    pub fast_retry_delay: Duration,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Close codes the server uses for policy/idle-timeout disconnects.
    pub fast_retry_codes: Vec<u16>,
    /// Treat every 1001 close as retryable, not only redeploy-flagged ones.
    pub retry_on_going_away: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(750),
            max_delay: Duration::from_millis(10_000),
            fast_retry_delay: Duration::from_millis(250),
            max_attempts: None,
            fast_retry_codes: vec![1008, 4000, 4008],
            retry_on_going_away: false,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The owner called `disconnect`.
    Intentional,
    /// The peer sent a close frame.
    Remote { code: u16, reason: String },
    /// The transport failed to open or broke without a close frame.
    Failed(String),
    /// No liveness acknowledgment within the heartbeat timeout.
    Unresponsive,
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, attempt: u32 },
    /// The close was intentional; stay closed.
    Stop,
    /// Attempts exhausted; the server is considered unreachable.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseClass {
    Intentional,
    FastRetry,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    background: bool,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            background: false,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// A connection opened successfully.
    pub fn on_open(&mut self) {
        self.attempt = 0;
    }

    /// Forget failures, e.g. before a manual retry after giving up.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Decide what follows a close.
    pub fn on_close(&mut self, cause: &CloseCause) -> RetryDecision {
        let class = self.classify(cause);
        if class == CloseClass::Intentional {
            return RetryDecision::Stop;
        }
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            debug!("Reconnect attempts exhausted after {}", self.attempt);
            return RetryDecision::GiveUp;
        }

        let delay = if self.background {
            self.config.max_delay
        } else if class == CloseClass::FastRetry {
            self.config.fast_retry_delay
        } else {
            self.delay(self.attempt)
        };
        self.attempt += 1;
        RetryDecision::Retry {
            delay,
            attempt: self.attempt,
        }
    }

    /// Track background/foreground. Coming back to the foreground while
    /// disconnected yields one fast retry that bypasses backoff; the attempt
    /// counter is left alone until a connection actually opens.
    pub fn set_background(&mut self, background: bool, disconnected: bool) -> Option<RetryDecision> {
        let was_background = self.background;
        self.background = background;
        if was_background && !background && disconnected {
            return Some(RetryDecision::Retry {
                delay: self.config.fast_retry_delay,
                attempt: self.attempt,
            });
        }
        None
    }

    fn classify(&self, cause: &CloseCause) -> CloseClass {
        match cause {
            CloseCause::Intentional => CloseClass::Intentional,
            CloseCause::Remote { code, .. } if *code == CLOSE_NORMAL => CloseClass::Intentional,
            CloseCause::Remote { code, reason } if *code == CLOSE_GOING_AWAY => {
                let redeploy = reason.to_ascii_lowercase().contains("redeploy");
                if redeploy || self.config.retry_on_going_away {
                    CloseClass::Backoff
                } else {
                    CloseClass::Intentional
                }
            }
            CloseCause::Remote { code, .. } if self.config.fast_retry_codes.contains(code) => {
                CloseClass::FastRetry
            }
            CloseCause::Remote { .. } | CloseCause::Failed(_) | CloseCause::Unresponsive => {
                CloseClass::Backoff
            }
        }
    }
}
