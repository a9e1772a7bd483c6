//! Traffic-Shift Verifier
//!
//! End-to-end verification of service-mesh traffic splitting. For each shift
//! scenario the verifier applies a routing manifest, waits for the control
//! plane to converge, spends a fixed probe budget against the ingress and
//! checks the observed split against the expected one within a tolerance.
//!
//! # Components
//!
//! - [`probe`]: one TCP probe, classified by backend marker
//! - [`convergence`]: settle time after each routing change
//! - [`sampler`]: fixed-budget sampling into a [`sampler::Tally`]
//! - [`evaluator`]: tolerance check producing a [`evaluator::Verdict`]
//! - [`orchestrator`]: per-scenario state machine and suite runner
//! - [`cluster`]: `kubectl`-backed collaborators (apply/delete, ingress, readiness)
//!
//! # Usage
//!
//! ```bash
//! # Built-in TCP traffic-shifting scenarios, smoke group only
//! SHIFT_TEST_GROUP=smoke SHIFT_MANIFEST_DIR=crates/shift-verifier/manifests \
//!     cargo run -p shift-verifier
//!
//! # Against a known ingress address
//! SHIFT_INGRESS_HOST=172.18.255.200 SHIFT_INGRESS_PORT=31400 cargo run -p shift-verifier
//! ```

#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::cast_precision_loss
)]

pub mod cluster;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod evaluator;
pub mod eventual;
pub mod orchestrator;
pub mod probe;
pub mod sampler;
pub mod scenario;
pub mod types;

pub use errors::{ClusterError, ShiftError};
pub use evaluator::{evaluate, Verdict};
pub use orchestrator::{ShiftOrchestrator, SuiteReport};
pub use sampler::{DistributionSampler, Tally};
