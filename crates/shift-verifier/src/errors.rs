//! Error types for the traffic-shift verifier.
//!
//! Tolerance violations are not errors. They surface as a failing
//! [`Verdict`](crate::evaluator::Verdict). Everything here aborts a scenario
//! (or the whole suite) before a verdict could be computed.

use thiserror::Error;

/// Failures reported by the external collaborators (manifest applier,
/// ingress resolver, readiness check).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Unexpected output from `{command}`: {message}")]
    InvalidOutput { command: String, message: String },

    #[error("Ingress not resolvable: {0}")]
    IngressUnavailable(String),
}

/// Phase in which a cancellation was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPhase {
    Setup,
    Convergence,
    Sampling,
    Readiness,
}

impl std::fmt::Display for CancelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CancelPhase::Setup => "setup",
            CancelPhase::Convergence => "convergence wait",
            CancelPhase::Sampling => "sampling",
            CancelPhase::Readiness => "readiness wait",
        };
        f.write_str(name)
    }
}

/// Scenario or suite abort.
///
/// Callers use [`ShiftError::is_cancellation`] to tell "test infra aborted"
/// apart from configuration problems.
#[derive(Debug, Error)]
pub enum ShiftError {
    /// Applying a routing manifest failed. Fatal for the scenario.
    #[error("Configuration error applying {manifest}: {source}")]
    Configuration {
        manifest: String,
        #[source]
        source: ClusterError,
    },

    /// The ingress address could not be located.
    #[error("Ingress resolution failed: {0}")]
    Resolver(#[source] ClusterError),

    /// Backends never became ready after the base deployment.
    #[error("Backends not ready: {0}")]
    Readiness(String),

    /// An external cancellation signal aborted the run.
    #[error("Cancelled during {phase}")]
    Cancelled { phase: CancelPhase },

    /// Scenario definition is unusable.
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    /// Unexpected fault while running a scenario body.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShiftError {
    /// Returns true when the error came from an external cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ShiftError::Cancelled { .. })
    }
}
