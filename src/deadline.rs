//! Absolute deadlines threaded through every provisioning step.
//!
//! A [`Deadline`] is computed once at the root of a workflow and passed down
//! by reference. Each step asks for the time remaining at entry and fails
//! fast when none is left. A deadline can also carry a cancellation token:
//! once the token fires, the remaining time reads as zero so in-flight
//! workflows fail through their ordinary deadline checks.

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::ProvisionError;

/// Horizon used when a requested duration does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Adds `duration` to `base`, saturating at a far-future instant instead of
/// overflowing.
#[must_use]
pub fn saturating_instant(base: Instant, duration: Duration) -> Instant {
    base.checked_add(duration)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Absolute point in time by which an operation must complete or fail.
#[derive(Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    /// Computes a deadline `duration` from now. Durations too large to
    /// represent saturate to a far-future instant.
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self::at(saturating_instant(Instant::now(), duration))
    }

    /// Wraps an absolute instant.
    #[must_use]
    pub fn at(at: Instant) -> Self {
        Self {
            at,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches a cancellation token. Cancelling the token collapses the time
    /// remaining to zero for this deadline and every clone of it.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the absolute instant.
    #[must_use]
    pub const fn instant(&self) -> Instant {
        self.at
    }

    /// Returns the token observed by this deadline.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once the deadline passed or the workflow was cancelled.
    #[must_use]
    pub fn has_elapsed(&self) -> bool {
        self.remaining().is_none()
    }

    /// Time left before the deadline, or `None` when nothing remains.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() { None } else { Some(left) }
    }

    /// Time left before the deadline, failing with
    /// [`ProvisionError::TimeoutExceeded`] naming `step` when none remains.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::TimeoutExceeded`] when the deadline passed.
    pub fn remaining_for(&self, step: &str) -> Result<Duration, ProvisionError> {
        self.remaining()
            .ok_or_else(|| ProvisionError::TimeoutExceeded {
                step: step.to_owned(),
            })
    }

    /// Caps `budget` by the time remaining; returns `None` once elapsed.
    #[must_use]
    pub fn cap(&self, budget: Duration) -> Option<Duration> {
        self.remaining().map(|left| left.min(budget))
    }

    /// Sleeps for `interval` or until the deadline (or cancellation),
    /// whichever comes first. Returns `false` when the deadline cut the
    /// sleep short.
    pub async fn sleep(&self, interval: Duration) -> bool {
        let wake = saturating_instant(Instant::now(), interval);
        if wake >= self.at {
            tokio::select! {
                () = sleep_until(self.at) => {}
                () = self.cancel.cancelled() => {}
            }
            return false;
        }
        tokio::select! {
            () = sleep_until(wake) => !self.cancel.is_cancelled(),
            () = self.cancel.cancelled() => false,
        }
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("remaining", &self.remaining())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
