//! Shift orchestrator.
//!
//! Drives each scenario through
//! `Idle -> ConfigApplied -> Converged -> Sampled -> Evaluated`, one scenario
//! at a time, because every scenario rewrites the mesh routing the next one
//! starts from.
//!
//! # Cleanup
//!
//! The scenario body runs inside a scope that always deletes the scenario's
//! routing manifest afterwards: on a verdict (pass or fail), on an aborting
//! error, and on an unexpected panic in the body. Cleanup failures are logged
//! and recorded, never turned into a scenario failure.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{BackendReadiness, IngressResolver, RoutingConfig, RoutingManifest};
use crate::convergence::ConvergenceWaiter;
use crate::errors::{CancelPhase, ShiftError};
use crate::evaluator::{evaluate, Verdict};
use crate::eventual::{wait_until, Backoff, WaitError};
use crate::probe::{Classifier, ProbeFactory};
use crate::sampler::DistributionSampler;
use crate::scenario::{ScenarioCatalog, ShiftScenario, SuiteFixture, TestGroup};
use crate::types::Endpoint;

/// Default deadline for backend pods to become Ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle of one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    Idle,
    ConfigApplied,
    Converged,
    Sampled,
    Evaluated { passed: bool },
}

/// Everything known about one scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    /// Phases reached, in order. Always starts with `Idle`.
    pub phases: Vec<ScenarioPhase>,
    pub outcome: Result<Verdict, ShiftError>,
    /// Set when the best-effort manifest deletion failed.
    pub cleanup_error: Option<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(&self.outcome, Ok(verdict) if verdict.passed)
    }

    pub fn final_phase(&self) -> ScenarioPhase {
        self.phases.last().copied().unwrap_or(ScenarioPhase::Idle)
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(&self.outcome, Err(e) if e.is_cancellation())
    }
}

/// Result of one suite run.
#[derive(Debug)]
pub struct SuiteReport {
    pub group: TestGroup,
    pub endpoint: Option<Endpoint>,
    pub scenarios: Vec<ScenarioReport>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SuiteReport {
    fn start(group: TestGroup) -> Self {
        let now = Utc::now();
        Self {
            group,
            endpoint: None,
            scenarios: Vec::new(),
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// True when nothing was cancelled and every scenario produced a passing
    /// verdict.
    pub fn passed(&self) -> bool {
        !self.cancelled && self.scenarios.iter().all(ScenarioReport::passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|s| !s.passed())
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Traffic shift suite '{}' {} ({} scenarios, {:.1}s)",
            self.group,
            if self.passed() { "PASSED" } else { "FAILED" },
            self.scenarios.len(),
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
        )?;
        for report in &self.scenarios {
            match &report.outcome {
                Ok(verdict) => write!(f, "- {}\n{verdict}", report.name)?,
                Err(e) => writeln!(f, "- {}: ABORTED: {e}", report.name)?,
            }
            if let Some(cleanup) = &report.cleanup_error {
                writeln!(f, "  cleanup failed: {cleanup}")?;
            }
        }
        if self.cancelled {
            writeln!(f, "Suite cancelled before all scenarios ran")?;
        }
        Ok(())
    }
}

/// Sequences configuration, convergence, sampling and evaluation.
#[derive(Clone)]
pub struct ShiftOrchestrator {
    routing: Arc<dyn RoutingConfig>,
    ingress: Arc<dyn IngressResolver>,
    readiness: Arc<dyn BackendReadiness>,
    waiter: Arc<dyn ConvergenceWaiter>,
    probes: Arc<dyn ProbeFactory>,
    concurrency: usize,
    ready_backoff: Backoff,
}

impl ShiftOrchestrator {
    pub fn new(
        routing: Arc<dyn RoutingConfig>,
        ingress: Arc<dyn IngressResolver>,
        readiness: Arc<dyn BackendReadiness>,
        waiter: Arc<dyn ConvergenceWaiter>,
        probes: Arc<dyn ProbeFactory>,
    ) -> Self {
        Self {
            routing,
            ingress,
            readiness,
            waiter,
            probes,
            concurrency: 1,
            ready_backoff: Backoff::with_timeout(DEFAULT_READY_TIMEOUT),
        }
    }

    /// Bound on concurrent probes within one scenario.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_ready_backoff(mut self, backoff: Backoff) -> Self {
        self.ready_backoff = backoff;
        self
    }

    /// Run every scenario of `group` from `catalog`, in order.
    ///
    /// Resolver and fixture failures abort the suite and are returned as
    /// errors. Per-scenario aborts are recorded in the report and the suite
    /// moves on, except for cancellation, which stops it.
    #[instrument(skip_all, name = "shift.suite", fields(group = %group))]
    pub async fn run_suite(
        &self,
        catalog: &ScenarioCatalog,
        group: TestGroup,
        cancel: &CancellationToken,
    ) -> Result<SuiteReport, ShiftError> {
        let mut report = SuiteReport::start(group);
        let scenarios = catalog.select(group);

        if scenarios.is_empty() {
            warn!(target: "shift.orchestrator", group = %group, "No scenarios in test group");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let endpoint = self
            .ingress
            .resolve_ingress()
            .await
            .map_err(ShiftError::Resolver)?;
        info!(
            target: "shift.orchestrator",
            endpoint = %endpoint,
            scenarios = scenarios.len(),
            "Resolved ingress"
        );
        report.endpoint = Some(endpoint.clone());

        if let Some(fixture) = &catalog.fixture {
            if let Err(e) = self.set_up_fixture(fixture, cancel).await {
                error!(target: "shift.orchestrator", error = %e, "Suite setup failed");
                self.tear_down_fixture(fixture, cancel).await;
                return Err(e);
            }
        }

        for scenario in scenarios {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let scenario_report = self.run_scenario(&endpoint, scenario, cancel).await;
            let cancelled = scenario_report.was_cancelled();
            report.scenarios.push(scenario_report);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        if let Some(fixture) = &catalog.fixture {
            self.tear_down_fixture(fixture, cancel).await;
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Run one scenario against `endpoint` and always clean up afterwards.
    #[instrument(skip_all, name = "shift.scenario", fields(scenario = %scenario.name))]
    pub async fn run_scenario(
        &self,
        endpoint: &Endpoint,
        scenario: &ShiftScenario,
        cancel: &CancellationToken,
    ) -> ScenarioReport {
        let mut phases = vec![ScenarioPhase::Idle];

        let body = AssertUnwindSafe(self.scenario_body(endpoint, scenario, cancel, &mut phases))
            .catch_unwind()
            .await;

        let outcome = match body {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "scenario body panicked".to_string());
                error!(
                    target: "shift.orchestrator",
                    scenario = %scenario.name,
                    error = %message,
                    "Scenario aborted by unexpected fault"
                );
                Err(ShiftError::Internal(message))
            }
        };

        if let Err(e) = &outcome {
            error!(
                target: "shift.orchestrator",
                scenario = %scenario.name,
                error = %e,
                cancelled = e.is_cancellation(),
                "Scenario aborted"
            );
        }

        let cleanup_error = self.clean_up(&scenario.manifest).await;

        ScenarioReport {
            name: scenario.name.clone(),
            phases,
            outcome,
            cleanup_error,
        }
    }

    async fn scenario_body(
        &self,
        endpoint: &Endpoint,
        scenario: &ShiftScenario,
        cancel: &CancellationToken,
        phases: &mut Vec<ScenarioPhase>,
    ) -> Result<Verdict, ShiftError> {
        scenario.validate()?;
        if cancel.is_cancelled() {
            return Err(ShiftError::Cancelled {
                phase: CancelPhase::Setup,
            });
        }

        info!(
            target: "shift.orchestrator",
            scenario = %scenario.name,
            manifest = %scenario.manifest,
            "Applying routing configuration"
        );
        self.routing
            .apply_routing_config(&scenario.manifest)
            .await
            .map_err(|source| ShiftError::Configuration {
                manifest: scenario.manifest.name.clone(),
                source,
            })?;
        phases.push(ScenarioPhase::ConfigApplied);

        self.waiter
            .await_convergence(&scenario.manifest.name, cancel)
            .await?;
        phases.push(ScenarioPhase::Converged);

        let probe = self.probes.probe_for(Classifier::new(&scenario.markers));
        let sampler = DistributionSampler::new(probe).with_concurrency(self.concurrency);
        info!(
            target: "shift.orchestrator",
            scenario = %scenario.name,
            endpoint = %endpoint,
            probes = scenario.probes,
            concurrency = sampler.concurrency(),
            "Sampling traffic distribution"
        );
        let tally = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ShiftError::Cancelled { phase: CancelPhase::Sampling });
            }
            tally = sampler.sample(endpoint, scenario.probes) => tally,
        };
        phases.push(ScenarioPhase::Sampled);

        let verdict = evaluate(&tally, &scenario.expected, scenario.tolerance);
        phases.push(ScenarioPhase::Evaluated {
            passed: verdict.passed,
        });
        log_verdict(&scenario.name, &verdict);

        Ok(verdict)
    }

    /// Best-effort removal of a scenario's routing manifest.
    async fn clean_up(&self, manifest: &RoutingManifest) -> Option<String> {
        match self.routing.delete_routing_config(manifest).await {
            Ok(()) => {
                debug!(target: "shift.orchestrator", manifest = %manifest.name, "Cleanup complete");
                None
            }
            Err(e) => {
                warn!(
                    target: "shift.orchestrator",
                    manifest = %manifest.name,
                    error = %e,
                    "Cleanup failed, continuing"
                );
                Some(e.to_string())
            }
        }
    }

    async fn set_up_fixture(
        &self,
        fixture: &SuiteFixture,
        cancel: &CancellationToken,
    ) -> Result<(), ShiftError> {
        info!(
            target: "shift.orchestrator",
            manifest = %fixture.manifest,
            "Deploying backends"
        );
        self.routing
            .apply_routing_config(&fixture.manifest)
            .await
            .map_err(|source| ShiftError::Configuration {
                manifest: fixture.manifest.name.clone(),
                source,
            })?;

        self.waiter
            .await_convergence(&fixture.manifest.name, cancel)
            .await?;

        let readiness = &self.readiness;
        let selector = fixture.backend_selector.as_str();
        let attempts = wait_until(self.ready_backoff, cancel, || async move {
            match readiness.backends_ready(selector).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(
                        target: "shift.orchestrator",
                        selector = %selector,
                        error = %e,
                        "Readiness check failed, retrying"
                    );
                    false
                }
            }
        })
        .await
        .map_err(|e| match e {
            WaitError::Cancelled => ShiftError::Cancelled {
                phase: CancelPhase::Readiness,
            },
            WaitError::TimedOut { .. } => {
                ShiftError::Readiness(format!("{selector}: {e}"))
            }
        })?;

        info!(
            target: "shift.orchestrator",
            selector = %selector,
            attempts,
            "Backends ready"
        );
        Ok(())
    }

    async fn tear_down_fixture(&self, fixture: &SuiteFixture, cancel: &CancellationToken) {
        info!(target: "shift.orchestrator", manifest = %fixture.manifest, "Removing backends");
        if self.clean_up(&fixture.manifest).await.is_some() {
            return;
        }
        if let Err(e) = self
            .waiter
            .await_convergence(&fixture.manifest.name, cancel)
            .await
        {
            debug!(target: "shift.orchestrator", error = %e, "Teardown settle skipped");
        }
    }
}

/// Emit the human-readable verdict report.
fn log_verdict(scenario: &str, verdict: &Verdict) {
    let verdict_json = serde_json::to_string(verdict).unwrap_or_default();
    if verdict.passed {
        info!(
            target: "shift.report",
            scenario = %scenario,
            verdict = %verdict_json,
            "Traffic shift verified\n{verdict}"
        );
    } else {
        error!(
            target: "shift.report",
            scenario = %scenario,
            violated = ?verdict.violated_labels(),
            verdict = %verdict_json,
            "Traffic shift out of tolerance\n{verdict}"
        );
    }
}

/// Emit the suite summary through the report target, at a level matching the
/// outcome.
pub fn log_suite_report(report: &SuiteReport) {
    let failed = report.failed().count();
    if report.cancelled {
        warn!(
            target: "shift.report",
            group = %report.group,
            scenarios = report.scenarios.len(),
            failed,
            "Traffic shift suite cancelled\n{report}"
        );
    } else if report.passed() {
        info!(
            target: "shift.report",
            group = %report.group,
            scenarios = report.scenarios.len(),
            "All traffic shift scenarios passed\n{report}"
        );
    } else {
        error!(
            target: "shift.report",
            group = %report.group,
            scenarios = report.scenarios.len(),
            failed,
            "Traffic shift scenarios failed\n{report}"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::evaluator::evaluate;
    use crate::sampler::Tally;
    use crate::types::Distribution;

    fn report(name: &str, outcome: Result<Verdict, ShiftError>) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            phases: vec![ScenarioPhase::Idle],
            outcome,
            cleanup_error: None,
        }
    }

    fn verdict(counts: &[(&str, u64)]) -> Verdict {
        evaluate(
            &Tally::from_counts(counts.iter().map(|(l, c)| (*l, *c))),
            &Distribution::all_to("v1"),
            crate::types::TolerancePolicy::Exact,
        )
    }

    #[test]
    fn test_suite_passes_only_when_every_scenario_passes() {
        let mut suite = SuiteReport::start(TestGroup::Full);
        suite.scenarios.push(report("a", Ok(verdict(&[("v1", 10)]))));
        assert!(suite.passed());

        suite
            .scenarios
            .push(report("b", Ok(verdict(&[("v1", 9), ("v2", 1)]))));
        assert!(!suite.passed());
        assert_eq!(suite.failed().count(), 1);
    }

    #[test]
    fn test_cancelled_suite_does_not_pass() {
        let mut suite = SuiteReport::start(TestGroup::Smoke);
        suite.cancelled = true;
        assert!(!suite.passed());
    }

    #[test]
    fn test_report_display_lists_aborts() {
        let mut suite = SuiteReport::start(TestGroup::Full);
        suite.scenarios.push(report(
            "20%_v2_shift",
            Err(ShiftError::Cancelled {
                phase: CancelPhase::Sampling,
            }),
        ));
        let text = suite.to_string();
        assert!(text.contains("FAILED"));
        assert!(text.contains("20%_v2_shift: ABORTED: Cancelled during sampling"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_json_logs(f: impl FnOnce()) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = logs.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_suite_report_goes_through_json_log() {
        let mut suite = SuiteReport::start(TestGroup::Full);
        suite
            .scenarios
            .push(report("100%_v1_shift", Ok(verdict(&[("v1", 9), ("v2", 1)]))));

        let logs = capture_json_logs(|| log_suite_report(&suite));

        let line: serde_json::Value = serde_json::from_str(logs.trim()).unwrap();
        assert_eq!(line["level"], "ERROR");
        assert_eq!(line["target"], "shift.report");
        assert_eq!(line["fields"]["failed"], 1);
        let message = line["fields"]["message"].as_str().unwrap();
        assert!(message.contains("Traffic shift suite 'full' FAILED"));
        assert!(message.contains("100%_v1_shift"));
    }

    #[test]
    fn test_passing_suite_report_logs_at_info() {
        let mut suite = SuiteReport::start(TestGroup::Smoke);
        suite
            .scenarios
            .push(report("100%_v1_shift", Ok(verdict(&[("v1", 10)]))));

        let logs = capture_json_logs(|| log_suite_report(&suite));

        let line: serde_json::Value = serde_json::from_str(logs.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert!(line["fields"]["message"]
            .as_str()
            .unwrap()
            .contains("PASSED"));
    }

    #[test]
    fn test_final_phase() {
        let mut r = report("a", Ok(verdict(&[("v1", 1)])));
        r.phases.push(ScenarioPhase::ConfigApplied);
        assert_eq!(r.final_phase(), ScenarioPhase::ConfigApplied);
    }
}
