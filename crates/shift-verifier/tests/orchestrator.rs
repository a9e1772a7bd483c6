//! Orchestrator behaviour against an in-memory mesh.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use shift_test_utils::{fake_ingress, FakeMesh, ImmediateWaiter};
use shift_verifier::cluster::{IngressResolver, StaticIngress};
use shift_verifier::errors::{CancelPhase, ClusterError, ShiftError};
use shift_verifier::evaluator::ViolationKind;
use shift_verifier::eventual::Backoff;
use shift_verifier::orchestrator::{ScenarioPhase, ShiftOrchestrator};
use shift_verifier::probe::{Classifier, Probe, ProbeFactory, ProbeResult};
use shift_verifier::scenario::{ScenarioCatalog, ShiftScenario, TestGroup};
use shift_verifier::types::Endpoint;

const BASE: &str = "tcp-echo-services";
const ALL_V1: &str = "tcp-echo-all-v1";
const SPLIT: &str = "tcp-echo-20-v2";

fn catalog() -> ScenarioCatalog {
    ScenarioCatalog::tcp_traffic_shifting(Path::new("manifests")).unwrap()
}

fn scenario(name: &str) -> ShiftScenario {
    catalog()
        .scenarios
        .into_iter()
        .find(|s| s.name == name)
        .unwrap()
}

fn healthy_mesh() -> FakeMesh {
    FakeMesh::new()
        .with_route(ALL_V1, &[("one", 100)])
        .with_route(SPLIT, &[("one", 80), ("two", 20)])
}

#[tokio::test]
async fn test_full_suite_passes_on_healthy_mesh() {
    let mesh = healthy_mesh();
    let waiter = Arc::new(ImmediateWaiter::new());
    let orchestrator = mesh.orchestrator(waiter.clone());

    let report = orchestrator
        .run_suite(&catalog(), TestGroup::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed(), "{report}");
    assert_eq!(report.scenarios.len(), 2);
    assert_eq!(report.endpoint, Some(fake_ingress()));
    for scenario in &report.scenarios {
        assert_eq!(
            scenario.phases,
            vec![
                ScenarioPhase::Idle,
                ScenarioPhase::ConfigApplied,
                ScenarioPhase::Converged,
                ScenarioPhase::Sampled,
                ScenarioPhase::Evaluated { passed: true },
            ]
        );
    }

    assert_eq!(mesh.apply_count(BASE), 1);
    assert_eq!(mesh.delete_count(BASE), 1);
    assert_eq!(mesh.apply_count(ALL_V1), 1);
    assert_eq!(mesh.delete_count(ALL_V1), 1);
    assert_eq!(mesh.apply_count(SPLIT), 1);
    assert_eq!(mesh.delete_count(SPLIT), 1);
    assert_eq!(mesh.probe_count(), 200);
    // fixture setup, two scenarios, fixture teardown
    assert_eq!(
        waiter.changes(),
        vec![BASE, ALL_V1, SPLIT, BASE]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_smoke_group_runs_full_cutover_only() {
    let mesh = healthy_mesh();
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_suite(&catalog(), TestGroup::Smoke, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed());
    assert_eq!(report.scenarios.len(), 1);
    assert_eq!(report.scenarios[0].name, "100%_v1_shift");
    assert_eq!(mesh.apply_count(SPLIT), 0);
}

#[tokio::test]
async fn test_tolerance_violation_fails_and_cleans_up_once() {
    let mesh = FakeMesh::new().with_route(SPLIT, &[("one", 65), ("two", 35)]);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("20%_v2_shift"), &CancellationToken::new())
        .await;

    let verdict = report.outcome.as_ref().expect("verdict, not an abort");
    assert!(!verdict.passed);
    assert!(verdict.violated_labels().contains(&"v2"));
    let v2 = verdict.check("v2").unwrap();
    assert!((v2.delta - 0.15).abs() < 1e-9);
    assert_eq!(report.final_phase(), ScenarioPhase::Evaluated { passed: false });
    assert_eq!(mesh.delete_count(SPLIT), 1);
}

#[tokio::test]
async fn test_config_apply_failure_aborts_and_cleans_up_once() {
    let mesh = healthy_mesh().failing_apply(ALL_V1);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("100%_v1_shift"), &CancellationToken::new())
        .await;

    assert!(matches!(
        report.outcome,
        Err(ShiftError::Configuration { ref manifest, .. }) if manifest == ALL_V1
    ));
    assert_eq!(report.phases, vec![ScenarioPhase::Idle]);
    assert_eq!(mesh.delete_count(ALL_V1), 1);
    assert_eq!(mesh.probe_count(), 0, "no sampling after a config error");
}

#[tokio::test]
async fn test_suite_continues_after_config_error() {
    let mesh = healthy_mesh().failing_apply(ALL_V1);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_suite(&catalog(), TestGroup::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.passed());
    assert!(report.scenarios[0].outcome.is_err());
    assert!(report.scenarios[1].passed());
    assert_eq!(report.failed().count(), 1);
}

#[tokio::test]
async fn test_cleanup_failure_does_not_fail_scenario() {
    let mesh = healthy_mesh().failing_delete(ALL_V1);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("100%_v1_shift"), &CancellationToken::new())
        .await;

    assert!(report.passed());
    assert!(report
        .cleanup_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(mesh.delete_count(ALL_V1), 1);
}

#[tokio::test]
async fn test_single_stray_probe_fails_full_cutover() {
    let mesh = FakeMesh::new().with_route(ALL_V1, &[("one", 99), ("two", 1)]);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("100%_v1_shift"), &CancellationToken::new())
        .await;

    let verdict = report.outcome.unwrap();
    assert!(!verdict.passed);
    assert_eq!(verdict.tally.count("v2"), 1);
}

#[tokio::test]
async fn test_reapplying_same_config_is_idempotent() {
    let mesh = healthy_mesh();
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));
    let split = scenario("20%_v2_shift");
    let cancel = CancellationToken::new();

    let first = orchestrator.run_scenario(&fake_ingress(), &split, &cancel).await;
    let second = orchestrator.run_scenario(&fake_ingress(), &split, &cancel).await;

    let first = first.outcome.unwrap();
    let second = second.outcome.unwrap();
    assert_eq!(first.tally, second.tally);
    assert_eq!(first.tally.count("v1"), 80);
    assert_eq!(first.tally.count("v2"), 20);
    assert_eq!(mesh.apply_count(SPLIT), 2);
}

#[tokio::test]
async fn test_all_probes_failing_violates_every_label() {
    let mesh = FakeMesh::new().with_route(SPLIT, &[("error: bad gateway", 1)]);
    let orchestrator = mesh.orchestrator(Arc::new(ImmediateWaiter::new()));

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("20%_v2_shift"), &CancellationToken::new())
        .await;

    let verdict = report.outcome.unwrap();
    assert!(!verdict.passed);
    assert_eq!(verdict.tally.failures(), 100);
    assert_eq!(verdict.tally.classified(), 0);
    assert_eq!(verdict.violated_labels(), vec!["v1", "v2"]);
    assert!(verdict
        .violations()
        .all(|c| c.violation == Some(ViolationKind::NoClassifiedProbes)));
}

#[tokio::test]
async fn test_concurrent_probes_spend_full_budget() {
    let mesh = healthy_mesh();
    let orchestrator = mesh
        .orchestrator(Arc::new(ImmediateWaiter::new()))
        .with_concurrency(8);

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("20%_v2_shift"), &CancellationToken::new())
        .await;

    let verdict = report.outcome.unwrap();
    assert_eq!(verdict.tally.total_probes(), 100);
    assert_eq!(mesh.probe_count(), 100);
    assert!(verdict.passed);
}

#[tokio::test]
async fn test_cancellation_during_wait_stops_suite() {
    let mesh = healthy_mesh();
    // call 1 is the fixture settle, call 2 the first scenario
    let waiter = Arc::new(ImmediateWaiter::new().cancel_on_call(2));
    let orchestrator = mesh.orchestrator(waiter.clone());

    let report = orchestrator
        .run_suite(&catalog(), TestGroup::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(!report.passed());
    assert_eq!(report.scenarios.len(), 1);
    let first = &report.scenarios[0];
    assert!(first.was_cancelled());
    assert!(matches!(
        first.outcome,
        Err(ShiftError::Cancelled {
            phase: CancelPhase::Convergence
        })
    ));
    assert_eq!(mesh.delete_count(ALL_V1), 1);
    assert_eq!(mesh.apply_count(SPLIT), 0);
    assert_eq!(mesh.delete_count(BASE), 1);
    assert_eq!(mesh.probe_count(), 0);
}

struct FailingResolver;

#[async_trait]
impl IngressResolver for FailingResolver {
    async fn resolve_ingress(&self) -> Result<Endpoint, ClusterError> {
        Err(ClusterError::IngressUnavailable(
            "load balancer pending".to_string(),
        ))
    }
}

#[tokio::test]
async fn test_resolver_error_aborts_suite_before_any_config() {
    let mesh = healthy_mesh();
    let orchestrator = ShiftOrchestrator::new(
        Arc::new(mesh.clone()),
        Arc::new(FailingResolver),
        Arc::new(mesh.clone()),
        Arc::new(ImmediateWaiter::new()),
        Arc::new(mesh.clone()),
    );

    let err = orchestrator
        .run_suite(&catalog(), TestGroup::Full, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ShiftError::Resolver(_)));
    assert_eq!(mesh.apply_count(BASE), 0);
    assert_eq!(mesh.apply_count(ALL_V1), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backends_never_ready_aborts_suite() {
    let mesh = healthy_mesh().ready_after(u32::MAX);
    let orchestrator = mesh
        .orchestrator(Arc::new(ImmediateWaiter::new()))
        .with_ready_backoff(Backoff::with_timeout(Duration::from_secs(5)));

    let err = orchestrator
        .run_suite(&catalog(), TestGroup::Full, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ShiftError::Readiness(_)));
    assert!(mesh.ready_checks() > 1);
    assert_eq!(mesh.delete_count(BASE), 1);
    assert_eq!(mesh.apply_count(ALL_V1), 0);
}

#[tokio::test]
async fn test_backends_ready_after_retries() {
    let mesh = healthy_mesh().ready_after(2);
    let orchestrator = mesh
        .orchestrator(Arc::new(ImmediateWaiter::new()))
        .with_ready_backoff(Backoff {
            timeout: Duration::from_secs(5),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });

    let report = orchestrator
        .run_suite(&catalog(), TestGroup::Smoke, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed());
    assert_eq!(mesh.ready_checks(), 2);
}

struct PanickingProbe;

#[async_trait]
impl Probe for PanickingProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> ProbeResult {
        panic!("probe exploded");
    }
}

struct PanickingFactory;

impl ProbeFactory for PanickingFactory {
    fn probe_for(&self, _classifier: Classifier) -> Arc<dyn Probe> {
        Arc::new(PanickingProbe)
    }
}

#[tokio::test]
async fn test_unexpected_fault_still_runs_cleanup() {
    let mesh = healthy_mesh();
    let orchestrator = ShiftOrchestrator::new(
        Arc::new(mesh.clone()),
        Arc::new(StaticIngress(fake_ingress())),
        Arc::new(mesh.clone()),
        Arc::new(ImmediateWaiter::new()),
        Arc::new(PanickingFactory),
    );

    let report = orchestrator
        .run_scenario(&fake_ingress(), &scenario("100%_v1_shift"), &CancellationToken::new())
        .await;

    assert!(matches!(
        report.outcome,
        Err(ShiftError::Internal(ref msg)) if msg.contains("probe exploded")
    ));
    assert_eq!(report.final_phase(), ScenarioPhase::Converged);
    assert_eq!(mesh.delete_count(ALL_V1), 1);
}
