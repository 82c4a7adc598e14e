// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry-poll driver.
//!
//! The server under test is eventually consistent: a message sent by one user
//! shows up in another user's Inbox some time later, an OOF change propagates
//! some time later. Scenarios wait for such effects with [`poll_until()`].
//!
//! # Timing
//!
//! ```text
//! sleep(interval) → op() → pred(result)? ──yes──► Ok(Polled)
//!        ▲                     │
//!        └─────────no──────────┘   (at most max_attempts times)
//! ```
//!
//! The sleep comes before every attempt, the first included, so the server
//! always gets one interval to settle. A predicate that holds immediately
//! therefore costs exactly one sleep and one check; one that never holds
//! costs exactly `max_attempts` of each.
//!
//! Exhaustion is not a failed assertion: [`PollError::Exhausted`] carries the
//! last observed result so the caller can report what it saw.

use crate::error::HarnessError;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bounds of one retry-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Number of sleep+check cycles before giving up (at least 1).
    pub max_attempts: u32,
    /// Fixed sleep before each check.
    pub interval: Duration,
    /// Optional bound on total elapsed time.
    pub deadline: Option<Duration>,
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Worst-case wall time, ignoring operation latency.
    pub fn budget(&self) -> Duration {
        let full = self.interval.saturating_mul(self.max_attempts);
        match self.deadline {
            Some(deadline) => full.min(deadline),
            None => full,
        }
    }
}

/// A satisfied poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    pub value: T,
    /// Number of checks made, the satisfying one included.
    pub attempts: u32,
}

/// Why a poll ended without the predicate holding.
#[derive(Debug, Error)]
pub enum PollError<T, E> {
    #[error("predicate not satisfied after {attempts} attempts")]
    Exhausted { attempts: u32, last: T },

    #[error("deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded {
        attempts: u32,
        deadline: Duration,
        last: Option<T>,
    },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<T> },

    #[error("operation failed on attempt {attempt}: {error}")]
    Operation { attempt: u32, error: E },
}

impl<T, E> PollError<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
            Self::Operation { attempt, .. } => *attempt,
        }
    }

    /// The last result the operation produced, if any.
    pub fn last(&self) -> Option<&T> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::DeadlineExceeded { last, .. } | Self::Cancelled { last, .. } => last.as_ref(),
            Self::Operation { .. } => None,
        }
    }

    /// Translate into the harness taxonomy.
    ///
    /// `what` names what was awaited; `render` summarizes the last result.
    pub fn into_harness(self, what: impl Into<String>, render: impl FnOnce(&T) -> String) -> HarnessError
    where
        E: Into<HarnessError>,
    {
        let what = what.into();
        match self {
            Self::Exhausted { attempts, last } => HarnessError::PollExhausted {
                what,
                attempts,
                last_seen: render(&last),
            },
            Self::DeadlineExceeded {
                attempts,
                deadline,
                last,
            } => HarnessError::PollExhausted {
                what: format!("{} (deadline {:?})", what, deadline),
                attempts,
                last_seen: last.as_ref().map(render).unwrap_or_else(|| "nothing".to_string()),
            },
            Self::Cancelled { .. } => HarnessError::Cancelled,
            Self::Operation { error, .. } => error.into(),
        }
    }
}

/// Sleep for `interval`, returning `false` if cancelled first.
async fn sleep_unless_cancelled(interval: Duration, cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = cancel.as_mut() else {
        tokio::time::sleep(interval).await;
        return true;
    };

    if *rx.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = rx.changed() => {
                match changed {
                    Ok(()) if *rx.borrow() => return false,
                    Ok(()) => continue,
                    // Sender gone: nobody can cancel any more
                    Err(_) => {
                        (&mut sleep).await;
                        return true;
                    }
                }
            }
        }
    }
}

/// Poll `op` until `pred` holds for its result.
///
/// `cancel` aborts the poll when its value becomes `true`. An `Err` from `op`
/// aborts immediately with [`PollError::Operation`].
pub async fn poll_until<T, E, F, Fut, P>(
    config: PollConfig,
    mut cancel: Option<watch::Receiver<bool>>,
    mut op: F,
    mut pred: P,
) -> Result<Polled<T>, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
    E: Debug,
{
    let max_attempts = config.max_attempts.max(1);
    let started = Instant::now();
    let mut last: Option<T> = None;

    let mut attempt = 0;

    loop {
        attempt += 1;

        if let Some(deadline) = config.deadline {
            if started.elapsed() + config.interval > deadline {
                warn!(attempts = attempt - 1, ?deadline, "Poll deadline exceeded");
                crate::metrics::record_poll_outcome("deadline", attempt - 1);
                return Err(PollError::DeadlineExceeded {
                    attempts: attempt - 1,
                    deadline,
                    last,
                });
            }
        }

        if !sleep_unless_cancelled(config.interval, &mut cancel).await {
            debug!(attempts = attempt - 1, "Poll cancelled");
            crate::metrics::record_poll_outcome("cancelled", attempt - 1);
            return Err(PollError::Cancelled {
                attempts: attempt - 1,
                last,
            });
        }

        crate::metrics::record_poll_attempt();
        let value = match op().await {
            Ok(value) => value,
            Err(error) => {
                warn!(attempt, error = ?error, "Poll operation failed");
                crate::metrics::record_poll_outcome("error", attempt);
                return Err(PollError::Operation { attempt, error });
            }
        };

        if pred(&value) {
            debug!(attempt, elapsed = ?started.elapsed(), "Poll satisfied");
            crate::metrics::record_poll_outcome("satisfied", attempt);
            return Ok(Polled {
                value,
                attempts: attempt,
            });
        }

        if attempt >= max_attempts {
            warn!(attempts = attempt, elapsed = ?started.elapsed(), "Poll exhausted");
            crate::metrics::record_poll_outcome("exhausted", attempt);
            return Err(PollError::Exhausted {
                attempts: attempt,
                last: value,
            });
        }

        debug!(attempt, max_attempts, "Poll predicate not yet satisfied");
        last = Some(value);
    }
}
