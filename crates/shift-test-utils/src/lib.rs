//! # Shift Test Utilities
//!
//! Mock collaborators and fixtures for exercising the traffic-shift verifier
//! without a cluster.
//!
//! ## Modules
//!
//! - `fake_mesh` - in-memory mesh implementing routing config, readiness and probes
//! - `waiter` - convergence waiter that returns immediately
//! - `echo` - local TCP echo backends for probe tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shift_test_utils::*;
//!
//! let mesh = FakeMesh::new()
//!     .with_route("tcp-echo-all-v1", &[("one", 100)])
//!     .with_route("tcp-echo-20-v2", &[("one", 80), ("two", 20)]);
//!
//! let orchestrator = mesh.orchestrator(ImmediateWaiter::new());
//! ```

pub mod echo;
pub mod fake_mesh;
pub mod waiter;

pub use echo::*;
pub use fake_mesh::*;
pub use waiter::*;
