//! Timer/timeout utilities implemented using `tokio::time::Sleep`.

use std::future;
use std::pin::Pin;

use crate::utils::PaxosLogError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports kicking off
/// again with a different duration and cancelling.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// True if currently armed; an unarmed timer never times out.
    armed: bool,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

impl Timer {
    /// Creates a new timer utility that is not armed.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Returns true if the timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Kicks off the timer with the given duration, overriding any previous
    /// deadline.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), PaxosLogError> {
        if dur.is_zero() {
            return Err(PaxosLogError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Cancels the timer if it is armed.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`. Pends forever if not armed.
    pub async fn timeout(&mut self) {
        if !self.armed {
            future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

/// Periodic retransmission timer remembering which attempt it was armed for.
/// On each firing the owner decides whether the attempt is still relevant,
/// then calls `reschedule_if()` to either keep it ticking or let it cancel
/// itself. There is no other cancellation path.
#[derive(Debug)]
pub struct RetryTimer<K> {
    /// Inner one-shot timer.
    timer: Timer,

    /// Retransmission period.
    period: Duration,

    /// Key of the attempt currently guarded.
    key: Option<K>,

    /// Fired and not yet rescheduled; holds further firings back.
    awaiting_reschedule: bool,
}

impl<K: Clone> RetryTimer<K> {
    /// Creates a new unarmed retry timer with given period.
    pub fn new(period: Duration) -> Result<Self, PaxosLogError> {
        if period.is_zero() {
            return Err(PaxosLogError::msg("invalid zero retry period"));
        }
        Ok(RetryTimer {
            timer: Timer::new(),
            period,
            key: None,
            awaiting_reschedule: false,
        })
    }

    /// Arms the timer for the attempt identified by `key`, replacing any
    /// previously guarded attempt.
    pub fn arm(&mut self, key: K) -> Result<(), PaxosLogError> {
        self.key = Some(key);
        self.awaiting_reschedule = false;
        self.timer.kickoff(self.period)
    }

    /// Disarms the timer.
    pub fn disarm(&mut self) {
        self.key = None;
        self.awaiting_reschedule = false;
        self.timer.cancel();
    }

    /// Gets the key of the attempt currently guarded, if any.
    pub fn armed_key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Waits until the next firing and yields the guarded key. Pends forever
    /// if not armed, or if the last firing has not been rescheduled yet.
    pub async fn fired(&mut self) -> K {
        loop {
            if self.awaiting_reschedule {
                future::pending::<()>().await;
            }
            match self.key {
                Some(ref key) if !self.timer.is_armed() => {
                    self.awaiting_reschedule = true;
                    return key.clone();
                }
                Some(_) => self.timer.timeout().await,
                None => future::pending::<()>().await,
            }
        }
    }

    /// Called after a firing with the evaluated relevance of the guarded
    /// attempt. Re-arms for another period if still relevant, otherwise
    /// cancels itself. Returns the given relevance flag.
    pub fn reschedule_if(
        &mut self,
        relevant: bool,
    ) -> Result<bool, PaxosLogError> {
        if relevant {
            self.awaiting_reschedule = false;
            self.timer.kickoff(self.period)?;
        } else {
            self.disarm();
        }
        Ok(relevant)
    }
}
