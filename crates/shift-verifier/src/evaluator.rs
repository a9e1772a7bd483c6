//! Acceptance evaluator.
//!
//! Compares a tally against the expected distribution. A scenario passes iff
//! every label's observed fraction (over all probes issued, failures
//! included) lies within the scenario's tolerance of its expected fraction.
//! A sample with no classified probes at all never passes.

use serde::Serialize;
use std::fmt;

use crate::sampler::Tally;
use crate::types::{Distribution, TolerancePolicy};

/// Why a label failed its check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Observed fraction outside the tolerance window.
    OutOfTolerance,
    /// Traffic reached a backend the distribution does not mention.
    Unexpected,
    /// Nothing was classified, so no fraction can be trusted.
    NoClassifiedProbes,
}

/// Result of checking one label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCheck {
    pub label: String,
    pub expected: f64,
    pub observed: f64,
    /// `observed - expected`.
    pub delta: f64,
    pub count: u64,
    pub violation: Option<ViolationKind>,
}

impl LabelCheck {
    pub fn is_violation(&self) -> bool {
        self.violation.is_some()
    }
}

/// Terminal outcome of one scenario's evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub tolerance: f64,
    pub tally: Tally,
    pub checks: Vec<LabelCheck>,
}

impl Verdict {
    /// Labels that broke the tolerance, with their deltas.
    pub fn violations(&self) -> impl Iterator<Item = &LabelCheck> {
        self.checks.iter().filter(|c| c.is_violation())
    }

    pub fn violated_labels(&self) -> Vec<&str> {
        self.violations().map(|c| c.label.as_str()).collect()
    }

    pub fn check(&self, label: &str) -> Option<&LabelCheck> {
        self.checks.iter().find(|c| c.label == label)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} probes ({} classified, {} failed), tolerance ±{:.2}",
            if self.passed { "PASS" } else { "FAIL" },
            self.tally.total_probes(),
            self.tally.classified(),
            self.tally.failures(),
            self.tolerance,
        )?;
        for check in &self.checks {
            let status = match check.violation {
                None => "ok",
                Some(ViolationKind::OutOfTolerance) => "OUT OF TOLERANCE",
                Some(ViolationKind::Unexpected) => "UNEXPECTED BACKEND",
                Some(ViolationKind::NoClassifiedProbes) => "NO CLASSIFIED PROBES",
            };
            writeln!(
                f,
                "  {:<8} expected {:.3} observed {:.3} ({} hits) delta {:+.3}  {}",
                check.label, check.expected, check.observed, check.count, check.delta, status
            )?;
        }
        if !self.tally.failure_kinds().is_empty() {
            let kinds: Vec<String> = self
                .tally
                .failure_kinds()
                .iter()
                .map(|(kind, n)| format!("{kind}={n}"))
                .collect();
            writeln!(f, "  failed probes: {}", kinds.join(", "))?;
        }
        Ok(())
    }
}

/// Evaluate a tally against the expected distribution.
pub fn evaluate(tally: &Tally, distribution: &Distribution, policy: TolerancePolicy) -> Verdict {
    let no_signal = tally.classified() == 0;
    let mut checks = Vec::new();

    for (label, expected) in distribution.iter() {
        let observed = tally.fraction(label);
        let delta = observed - expected;
        let violation = if no_signal {
            Some(ViolationKind::NoClassifiedProbes)
        } else if policy.accepts(delta.abs()) {
            None
        } else {
            Some(ViolationKind::OutOfTolerance)
        };

        checks.push(LabelCheck {
            label: label.to_string(),
            expected,
            observed,
            delta,
            count: tally.count(label),
            violation,
        });
    }

    // Backends outside the distribution are held to an expected share of 0.
    for (label, count) in tally.counts() {
        if distribution.expected(label).is_some() {
            continue;
        }
        let observed = tally.fraction(label);
        checks.push(LabelCheck {
            label: label.clone(),
            expected: 0.0,
            observed,
            delta: observed,
            count: *count,
            violation: (!policy.accepts(observed)).then_some(ViolationKind::Unexpected),
        });
    }

    let passed = !checks.iter().any(LabelCheck::is_violation);

    Verdict {
        passed,
        tolerance: policy.allowance(),
        tally: tally.clone(),
        checks,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn split_80_20() -> Distribution {
        Distribution::new([("v1", 0.8), ("v2", 0.2)]).unwrap()
    }

    fn window(width: f64) -> TolerancePolicy {
        TolerancePolicy::windowed(width).unwrap()
    }

    #[test]
    fn test_full_cutover_passes_on_exact_match() {
        let tally = Tally::from_counts([("v1", 100)]);
        let verdict = evaluate(&tally, &Distribution::all_to("v1"), TolerancePolicy::Exact);

        assert!(verdict.passed);
        assert_eq!(verdict.violations().count(), 0);
    }

    #[test]
    fn test_full_cutover_fails_on_single_stray_probe() {
        let tally = Tally::from_counts([("v1", 99), ("v2", 1)]);
        let verdict = evaluate(&tally, &Distribution::all_to("v1"), TolerancePolicy::Exact);

        assert!(!verdict.passed);
        assert_eq!(verdict.violated_labels(), vec!["v1", "v2"]);
        assert_eq!(
            verdict.check("v2").unwrap().violation,
            Some(ViolationKind::Unexpected)
        );
    }

    #[test]
    fn test_full_cutover_fails_on_stray_probe_in_huge_budget() {
        // v2 observes 5e-10, below the float slack used for windowed checks
        let tally = Tally::from_counts([("v1", 1_999_999_999), ("v2", 1)]);
        let verdict = evaluate(&tally, &Distribution::all_to("v1"), TolerancePolicy::Exact);

        assert!(!verdict.passed);
        assert_eq!(verdict.violated_labels(), vec!["v1", "v2"]);
    }

    #[test]
    fn test_full_cutover_fails_on_single_failed_probe() {
        let tally = Tally::from_counts([("v1", 99)]).with_failures("timeout", 1);
        let verdict = evaluate(&tally, &Distribution::all_to("v1"), TolerancePolicy::Exact);

        assert!(!verdict.passed);
        assert_eq!(verdict.violated_labels(), vec!["v1"]);
    }

    #[test]
    fn test_split_within_window_passes() {
        let tally = Tally::from_counts([("v1", 82), ("v2", 18)]);
        let verdict = evaluate(&tally, &split_80_20(), window(0.10));

        assert!(verdict.passed, "{verdict}");
    }

    #[test]
    fn test_split_outside_window_cites_v2() {
        let tally = Tally::from_counts([("v1", 65), ("v2", 35)]);
        let verdict = evaluate(&tally, &split_80_20(), window(0.10));

        assert!(!verdict.passed);
        let v2 = verdict.check("v2").unwrap();
        assert_eq!(v2.violation, Some(ViolationKind::OutOfTolerance));
        assert!((v2.expected - 0.2).abs() < 1e-12);
        assert!((v2.observed - 0.35).abs() < 1e-12);
        assert!((v2.delta - 0.15).abs() < 1e-9);
        assert!(verdict.violated_labels().contains(&"v2"));
    }

    #[test]
    fn test_window_edge_is_inclusive() {
        let tally = Tally::from_counts([("v1", 70), ("v2", 30)]);
        let verdict = evaluate(&tally, &split_80_20(), window(0.10));
        assert!(verdict.passed, "{verdict}");
    }

    #[test]
    fn test_all_failures_violate_every_label() {
        let tally = Tally::new().with_failures("connect", 100);
        // Even a window wide enough to cover 0.2 must not pass an empty sample
        let verdict = evaluate(&tally, &split_80_20(), window(0.25));

        assert!(!verdict.passed);
        assert_eq!(verdict.violated_labels(), vec!["v1", "v2"]);
        assert!(verdict
            .violations()
            .all(|c| c.violation == Some(ViolationKind::NoClassifiedProbes)));
    }

    #[test]
    fn test_empty_tally_fails_without_dividing_by_zero() {
        let verdict = evaluate(&Tally::new(), &Distribution::all_to("v1"), window(1.0));

        assert!(!verdict.passed);
        let v1 = verdict.check("v1").unwrap();
        assert_eq!(v1.observed, 0.0);
        assert!(v1.observed.is_finite());
    }

    #[test]
    fn test_report_lists_deltas() {
        let tally = Tally::from_counts([("v1", 65), ("v2", 35)]);
        let report = evaluate(&tally, &split_80_20(), window(0.10)).to_string();

        assert!(report.starts_with("FAIL"));
        assert!(report.contains("v2"));
        assert!(report.contains("+0.150"));
        assert!(report.contains("OUT OF TOLERANCE"));
    }
}
