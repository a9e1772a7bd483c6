//! Convergence waiter that never sleeps.

use async_trait::async_trait;
use shift_verifier::convergence::ConvergenceWaiter;
use shift_verifier::errors::{CancelPhase, ShiftError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Records every convergence wait and returns at once.
///
/// `cancel_on_call(n)` makes the n-th wait (1-based) fire the cancellation
/// token itself, simulating an operator interrupt mid-wait.
#[derive(Debug, Default)]
pub struct ImmediateWaiter {
    calls: AtomicUsize,
    cancel_at: Option<usize>,
    changes: Mutex<Vec<String>>,
}

impl ImmediateWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cancel_on_call(mut self, call: usize) -> Self {
        self.cancel_at = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Names of the changes waited on, in order.
    pub fn changes(&self) -> Vec<String> {
        self.changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConvergenceWaiter for ImmediateWaiter {
    async fn await_convergence(
        &self,
        change: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ShiftError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes.lock().unwrap().push(change.to_string());

        if self.cancel_at == Some(call) {
            cancel.cancel();
        }
        if cancel.is_cancelled() {
            return Err(ShiftError::Cancelled {
                phase: CancelPhase::Convergence,
            });
        }
        Ok(())
    }
}
