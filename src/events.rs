//! Sequencing progress events and cooperative cancellation.
//!
//! Ramps take tens of seconds; instead of a blocking sleep-and-print loop,
//! the controller emits [`SequenceEvent`]s on a broadcast stream that any
//! observer (log, UI, test harness) can subscribe to, and every settling
//! wait checks a [`CancelToken`] once per one-second tick so an emergency
//! stop or an explicit cancel interrupts it within a tick.

use crate::registry::{DetectorId, Tap};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One step of a multi-phase ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStep {
    /// All three taps rising to the MCP2 target.
    Baseline,
    /// MCP1 and PC rising together to the MCP1 target.
    McpPair,
    /// PC alone rising to its configured target.
    Photocathode,
    /// Photocathode setpoint dropped below MCP1.
    DisablePc,
    /// MCP1 and PC falling together to the measured MCP2 level.
    Lower,
    /// Simultaneous output disable of all three channels.
    FinalDisable,
}

impl fmt::Display for RampStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RampStep::Baseline => write!(f, "baseline"),
            RampStep::McpPair => write!(f, "mcp-pair"),
            RampStep::Photocathode => write!(f, "photocathode"),
            RampStep::DisablePc => write!(f, "disable-pc"),
            RampStep::Lower => write!(f, "lower"),
            RampStep::FinalDisable => write!(f, "final-disable"),
        }
    }
}

/// A progress event emitted by the sequencing controller.
#[derive(Debug, Clone)]
pub struct SequenceEvent {
    /// Detector the event belongs to.
    pub detector: DetectorId,
    /// What happened.
    pub kind: SequenceEventKind,
    /// Emission time.
    pub at: DateTime<Utc>,
}

/// Payload of a [`SequenceEvent`].
#[derive(Debug, Clone)]
pub enum SequenceEventKind {
    /// A settling wait started for one ramp step.
    RampStarted {
        /// Ramp step being waited on.
        step: RampStep,
        /// Voltage target of the step.
        target_v: f64,
        /// Computed wait duration.
        wait: Duration,
    },
    /// Periodic progress during a settling wait, once per even second.
    RampProgress {
        /// Ramp step being waited on.
        step: RampStep,
        /// Seconds elapsed in this wait.
        elapsed_s: u64,
        /// Total seconds this wait will take.
        total_s: u64,
    },
    /// A ramp step converged within tolerance.
    PhaseSettled {
        /// Ramp step that settled.
        step: RampStep,
    },
    /// A channel missed the tolerance window after its settling wait.
    ConvergenceFailed {
        /// Offending tap.
        tap: Tap,
        /// Step target.
        target_v: f64,
        /// Measured terminal voltage.
        terminal_v: f64,
        /// Operator remediation hint.
        hint: &'static str,
    },
    /// The whole sequence finished successfully.
    SequenceComplete,
    /// The sequence stopped before completion.
    SequenceAborted {
        /// Why the sequence stopped.
        reason: String,
    },
}

impl SequenceEvent {
    pub(crate) fn new(detector: DetectorId, kind: SequenceEventKind) -> Self {
        Self {
            detector,
            kind,
            at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation flag shared between a sequencing operation and
/// whoever may need to stop it (explicit cancel or emergency off).
///
/// Wait loops poll [`Self::is_cancelled`] every tick and additionally select
/// on [`Self::cancelled`], so cancellation interrupts a wait without
/// finishing the tick.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn token_starts_clear_and_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Awaiting an already-cancelled token resolves immediately.
        timeout(Duration::from_millis(10), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_wakes_a_parked_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        sleep(Duration::from_millis(5)).await;
        token.cancel();
        timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
