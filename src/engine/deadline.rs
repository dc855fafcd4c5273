//! Per-call deadline and cooperative cancellation.
//!
//! The executor checks the deadline between rule evaluations, never inside
//! one. When it trips, the current call unwinds with a partial result
//! flagged as timed out or cancelled; the rule set and temporal store stay
//! valid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a `reason` call stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The per-call deadline elapsed.
    TimedOut,
    /// The caller cancelled through a [`CancelHandle`].
    Cancelled,
}

/// Deadline controller for one `reason` call.
///
/// Cheap to clone; the cancellation flag is shared. Impure host functions
/// receive the [`CancelHandle`] through their call context so long-running
/// ones can stop early.
#[derive(Debug, Clone)]
pub struct ReasonDeadline {
    cancelled: Arc<AtomicBool>,
    started: Instant,
    budget: Option<Duration>,
}

impl ReasonDeadline {
    pub fn new(budget: Option<Duration>) -> Self {
        ReasonDeadline {
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            budget,
        }
    }

    /// No deadline; only explicit cancellation can interrupt.
    pub fn unbounded() -> Self {
        ReasonDeadline::new(None)
    }

    /// Check between rule evaluations. `Err` means stop now and return the
    /// partial result.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Interrupt::Cancelled);
        }
        if let Some(budget) = self.budget {
            if self.started.elapsed() > budget {
                return Err(Interrupt::TimedOut);
            }
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Handle for cancelling this call from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

/// Cross-thread cancellation handle for an in-flight `reason` call.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Build a deadline controller wired to this handle.
    pub(crate) fn deadline(&self, budget: Option<Duration>) -> ReasonDeadline {
        ReasonDeadline {
            cancelled: Arc::clone(&self.cancelled),
            started: Instant::now(),
            budget,
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}
