use std::{fmt::Display, time::Duration};

use tracing::{debug, warn};

use crate::store::Store;

/// Bound and pacing of a retry loop around a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause after a transient failure.
    pub delay: Duration,
    /// Reset the connection after every `reset_every`-th failed attempt (0 = never).
    pub reset_every: u32,
}

impl RetryPolicy {
    /// Allocation transactions: lock waits are expected under contention.
    pub const fn allocator() -> Self {
        Self {
            max_attempts: 30,
            delay: Duration::from_secs(1),
            reset_every: 5,
        }
    }

    /// Delayed task insertion: failures are assumed to be short outages.
    pub const fn insert() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            reset_every: 1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether the connection should be reset after the failed `attempt` (1-based).
    pub fn should_reset(&self, attempt: u32) -> bool {
        self.reset_every > 0 && attempt % self.reset_every == 0
    }

    /// Blocks the current thread for [`RetryPolicy::delay`].
    pub fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

/// What a retry loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Try again right away (a competitor won a race; the next attempt sees its row).
    Immediately,
    /// Pause for [`RetryPolicy::delay`], resetting the connection when due.
    AfterPause,
    /// Not retryable.
    GiveUp,
}

/// Last error of a retry loop that did not succeed.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// `true` when the loop stopped because `max_attempts` was reached.
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Run `op` until it succeeds, `classify` says [`RetryAction::GiveUp`] or
    /// `max_attempts` attempts were made.
    pub fn run<T, E, F, C>(&self, store: &Store, mut op: F, classify: C) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        C: Fn(&E) -> RetryAction,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op() {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            let action = classify(&error);
            if action == RetryAction::GiveUp || attempt >= self.max_attempts {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: action != RetryAction::GiveUp,
                });
            }

            debug!(attempt, error = %error, ?action, "store operation failed; retrying");
            if action == RetryAction::AfterPause {
                if self.should_reset(attempt)
                    && let Err(e) = store.reset()
                {
                    warn!(error = %e, "failed to reset store connection");
                }
                self.pause();
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::allocator()
    }
}
