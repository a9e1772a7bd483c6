//! Convergence waiter.
//!
//! The control plane exposes no "routing has propagated" signal at this
//! layer, so the default waiter simply blocks for a fixed settle time after
//! each configuration change. It sits behind [`ConvergenceWaiter`] so a
//! readiness-polling implementation can replace it without touching the
//! orchestrator.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{CancelPhase, ShiftError};

/// Default settle time after a routing change (matches mesh propagation).
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(10);

/// Blocks until the mesh is assumed to reflect `change`.
#[async_trait]
pub trait ConvergenceWaiter: Send + Sync {
    /// Returns `ShiftError::Cancelled` if `cancel` fires first.
    async fn await_convergence(
        &self,
        change: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ShiftError>;
}

/// Fixed-duration wait.
#[derive(Debug, Clone, Copy)]
pub struct FixedSettle {
    settle: Duration,
}

impl FixedSettle {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }
}

impl Default for FixedSettle {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE)
    }
}

#[async_trait]
impl ConvergenceWaiter for FixedSettle {
    async fn await_convergence(
        &self,
        change: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ShiftError> {
        info!(
            target: "shift.convergence",
            change = %change,
            settle_secs = self.settle.as_secs_f64(),
            "Waiting for routing change to propagate"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(target: "shift.convergence", change = %change, "Convergence wait cancelled");
                Err(ShiftError::Cancelled { phase: CancelPhase::Convergence })
            }
            () = tokio::time::sleep(self.settle) => Ok(()),
        }
    }
}
