use std::time::Duration;

use crate::config::{PollSettings, ReconnectSettings};

// Upper bound for any delay, so schedules built on `Instant + delay` stay in range.
const LONGEST_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Capped doubling delay keyed on the number of consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(LONGEST_DELAY);
        Self {
            base,
            max: max.max(base).min(LONGEST_DELAY),
            attempt: 0,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^20 already exceeds any sensible ceiling; clamping the shift keeps
        // the multiplication in range.
        let factor = 1u32 << attempt.min(20);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for the current attempt, then counts the attempt as failed.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next attempt would get, without consuming it.
    pub fn current(&self) -> Duration {
        self.delay_for(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl From<PollSettings> for Backoff {
    fn from(settings: PollSettings) -> Self {
        Backoff::new(settings.base, settings.max)
    }
}

/// Reconnect schedule for a push stream.
///
/// A connection that stays open for at least `grace` counts as a success and
/// resets the schedule; shorter-lived connections keep climbing.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    backoff: Backoff,
    grace: Duration,
}

impl ReconnectPolicy {
    pub fn new(settings: ReconnectSettings) -> Self {
        Self {
            backoff: Backoff::new(settings.base, settings.max),
            grace: settings.grace,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Applies the grace rule to a connection that was open for `lived`.
    pub fn connection_closed(&mut self, lived: Duration) {
        if lived >= self.grace {
            self.backoff.reset();
        }
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectSettings::default())
    }
}
