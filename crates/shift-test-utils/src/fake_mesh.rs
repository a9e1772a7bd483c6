//! In-memory mesh for orchestrator tests.
//!
//! Routes are registered per manifest name as weighted reply payloads.
//! Applying a manifest makes its route active; probes then draw replies in a
//! fixed weighted cycle, so 100 probes against an 80/20 route yield exactly
//! 80 and 20. The cycle restarts on every apply, so re-applying the same
//! manifest reproduces the same distribution.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use shift_verifier::cluster::{
    BackendReadiness, RoutingConfig, RoutingManifest, StaticIngress,
};
use shift_verifier::convergence::ConvergenceWaiter;
use shift_verifier::errors::ClusterError;
use shift_verifier::orchestrator::ShiftOrchestrator;
use shift_verifier::probe::{Classifier, Probe, ProbeFactory, ProbeFailure, ProbeResult};
use shift_verifier::types::Endpoint;

/// Endpoint the fake mesh pretends to expose.
pub fn fake_ingress() -> Endpoint {
    Endpoint::new("fake-ingress", 31400)
}

#[derive(Debug, Default)]
struct MeshState {
    routes: HashMap<String, Vec<(String, u32)>>,
    active: Option<String>,
    cursor: u64,
    applies: HashMap<String, usize>,
    deletes: HashMap<String, usize>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    ready_after: u32,
    ready_checks: u32,
    probes: u64,
}

/// Fake service mesh implementing routing config, readiness and probes.
#[derive(Debug, Clone, Default)]
pub struct FakeMesh {
    state: Arc<Mutex<MeshState>>,
}

impl FakeMesh {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the replies served while `manifest` is active.
    #[must_use]
    pub fn with_route(self, manifest: &str, replies: &[(&str, u32)]) -> Self {
        self.state.lock().unwrap().routes.insert(
            manifest.to_string(),
            replies
                .iter()
                .map(|(payload, weight)| ((*payload).to_string(), *weight))
                .collect(),
        );
        self
    }

    /// Make applying `manifest` fail.
    #[must_use]
    pub fn failing_apply(self, manifest: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .fail_apply
            .insert(manifest.to_string());
        self
    }

    /// Make deleting `manifest` fail.
    #[must_use]
    pub fn failing_delete(self, manifest: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .fail_delete
            .insert(manifest.to_string());
        self
    }

    /// Report backends ready only from the n-th readiness check on.
    /// `u32::MAX` means never.
    #[must_use]
    pub fn ready_after(self, checks: u32) -> Self {
        self.state.lock().unwrap().ready_after = checks;
        self
    }

    pub fn apply_count(&self, manifest: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .applies
            .get(manifest)
            .copied()
            .unwrap_or(0)
    }

    pub fn delete_count(&self, manifest: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .deletes
            .get(manifest)
            .copied()
            .unwrap_or(0)
    }

    pub fn active_route(&self) -> Option<String> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn probe_count(&self) -> u64 {
        self.state.lock().unwrap().probes
    }

    pub fn ready_checks(&self) -> u32 {
        self.state.lock().unwrap().ready_checks
    }

    /// Orchestrator wired to this mesh with a static ingress.
    pub fn orchestrator<W>(&self, waiter: Arc<W>) -> ShiftOrchestrator
    where
        W: ConvergenceWaiter + 'static,
    {
        ShiftOrchestrator::new(
            Arc::new(self.clone()),
            Arc::new(StaticIngress(fake_ingress())),
            Arc::new(self.clone()),
            waiter,
            Arc::new(self.clone()),
        )
    }

    fn next_reply(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;

        let active = state.active.clone()?;
        let replies = state.routes.get(&active)?.clone();
        let total: u64 = replies.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return None;
        }

        let mut slot = state.cursor % total;
        state.cursor += 1;
        for (payload, weight) in replies {
            let weight = u64::from(weight);
            if slot < weight {
                return Some(payload);
            }
            slot -= weight;
        }
        None
    }
}

#[async_trait]
impl RoutingConfig for FakeMesh {
    async fn apply_routing_config(&self, manifest: &RoutingManifest) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        *state.applies.entry(manifest.name.clone()).or_insert(0) += 1;

        if state.fail_apply.contains(&manifest.name) {
            return Err(ClusterError::CommandFailed {
                command: format!("kubectl apply -f {}", manifest.path.display()),
                status: 1,
                stderr: "admission webhook denied the request".to_string(),
            });
        }

        if state.routes.contains_key(&manifest.name) {
            state.active = Some(manifest.name.clone());
            state.cursor = 0;
        }
        Ok(())
    }

    async fn delete_routing_config(
        &self,
        manifest: &RoutingManifest,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        *state.deletes.entry(manifest.name.clone()).or_insert(0) += 1;

        if state.fail_delete.contains(&manifest.name) {
            return Err(ClusterError::CommandFailed {
                command: format!("kubectl delete -f {}", manifest.path.display()),
                status: 1,
                stderr: "connection refused".to_string(),
            });
        }

        if state.active.as_deref() == Some(manifest.name.as_str()) {
            state.active = None;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendReadiness for FakeMesh {
    async fn backends_ready(&self, _selector: &str) -> Result<bool, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.ready_checks += 1;
        Ok(state.ready_checks >= state.ready_after)
    }
}

impl ProbeFactory for FakeMesh {
    fn probe_for(&self, classifier: Classifier) -> Arc<dyn Probe> {
        Arc::new(FakeMeshProbe {
            mesh: self.clone(),
            classifier,
        })
    }
}

/// Probe answered by the fake mesh's active route.
#[derive(Debug)]
pub struct FakeMeshProbe {
    mesh: FakeMesh,
    classifier: Classifier,
}

#[async_trait]
impl Probe for FakeMeshProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> ProbeResult {
        match self.mesh.next_reply() {
            Some(payload) => self.classifier.result_for(&payload),
            None => ProbeResult::Failed(ProbeFailure::Connect(
                "no route to backend".to_string(),
            )),
        }
    }
}
