//! Dedicated-Call Latch
//!
//! After a state-transfer fault the client stops trusting its routing
//! information and sends every request on a dedicated connection for a
//! fixed window.
//!
//! ```text
//!            state transfer seen
//!   Normal ─────────────────────────▶ Dedicated { until: now + window }
//!     ▲                                      │
//!     └──────── now > until (on next call) ──┘
//! ```
//!
//! The retry reaction to a single fault is the pure function [`decide`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::ports::Clock;
use crate::error::FaultKind;

/// Latch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    Normal,
    Dedicated { until: Instant },
}

/// Connection class chosen for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRoute {
    Pooled,
    Dedicated,
}

/// Timed sticky fallback to dedicated routing.
#[derive(Debug)]
pub struct DedicatedCallLatch {
    state: Mutex<LatchState>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl DedicatedCallLatch {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            state: Mutex::new(LatchState::Normal),
            clock,
            window,
        }
    }

    /// Route for the next call, resetting an expired latch.
    pub fn route(&self) -> CallRoute {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match *state {
            LatchState::Normal => CallRoute::Pooled,
            LatchState::Dedicated { until } if now > until => {
                tracing::info!("Dedicated-call window elapsed, resuming pooled routing");
                *state = LatchState::Normal;
                CallRoute::Pooled
            }
            LatchState::Dedicated { .. } => CallRoute::Dedicated,
        }
    }

    /// Enter (or extend) dedicated mode.
    pub fn engage(&self) {
        let until = self.clock.now() + self.window;
        *self.state.lock() = LatchState::Dedicated { until };
        tracing::warn!(
            window_secs = self.window.as_secs(),
            "State transfer in progress, routing calls on dedicated connections"
        );
    }

    pub fn state(&self) -> LatchState {
        *self.state.lock()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Reaction to the outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the outcome to the caller
    Propagate,
    /// Re-issue the same command once on a dedicated connection
    RetryDedicated,
    /// Engage the latch, then re-issue dedicated
    LatchAndRetryDedicated,
    /// Engage the latch and give up; the dedicated attempt already failed
    LatchAndPropagate,
}

/// Retry policy as a function of the attempt number (0 = first) and the
/// fault the attempt produced.
pub fn decide(attempt: u8, fault: Option<FaultKind>) -> RetryDecision {
    match (attempt, fault) {
        (0, Some(FaultKind::ActivityBlocked)) => RetryDecision::RetryDedicated,
        (0, Some(FaultKind::StateTransferInProgress)) => RetryDecision::LatchAndRetryDedicated,
        (_, Some(FaultKind::StateTransferInProgress)) => RetryDecision::LatchAndPropagate,
        _ => RetryDecision::Propagate,
    }
}
