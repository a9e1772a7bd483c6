//! Core data types shared by the probe, sampler and evaluator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::ShiftError;

/// Slack applied to fraction comparisons so decimal splits such as 0.7 vs 0.8
/// at a 0.10 window are not rejected by binary rounding.
pub const FRACTION_EPSILON: f64 = 1e-9;

/// Address + port that probes are sent to. Fixed for a whole scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps a backend version label to the marker its replies contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMarker {
    /// Classification label, e.g. `v1`.
    pub label: String,
    /// Substring identifying the backend in a reply, e.g. `one`.
    pub marker: String,
}

impl BackendMarker {
    pub fn new(label: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            marker: marker.into(),
        }
    }
}

/// Expected fraction of traffic per label.
///
/// Fractions are each in `[0, 1]` and sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct Distribution {
    fractions: BTreeMap<String, f64>,
}

impl Distribution {
    /// Build a distribution, rejecting empty sets, out-of-range fractions and
    /// fractions that do not sum to 1.0.
    pub fn new<I, S>(fractions: I) -> Result<Self, ShiftError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let fractions: BTreeMap<String, f64> = fractions
            .into_iter()
            .map(|(label, fraction)| (label.into(), fraction))
            .collect();

        if fractions.is_empty() {
            return Err(ShiftError::InvalidScenario(
                "distribution has no labels".to_string(),
            ));
        }

        for (label, fraction) in &fractions {
            if !fraction.is_finite() || !(0.0..=1.0).contains(fraction) {
                return Err(ShiftError::InvalidScenario(format!(
                    "fraction for {label} must be within [0, 1], got {fraction}"
                )));
            }
        }

        let sum: f64 = fractions.values().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ShiftError::InvalidScenario(format!(
                "distribution fractions must sum to 1.0, got {sum}"
            )));
        }

        Ok(Self { fractions })
    }

    /// Single backend receiving all traffic.
    pub fn all_to(label: impl Into<String>) -> Self {
        Self {
            fractions: BTreeMap::from([(label.into(), 1.0)]),
        }
    }

    pub fn expected(&self, label: &str) -> Option<f64> {
        self.fractions.get(label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fractions.iter().map(|(label, f)| (label.as_str(), *f))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fractions.keys().map(String::as_str)
    }
}

impl TryFrom<BTreeMap<String, f64>> for Distribution {
    type Error = ShiftError;

    fn try_from(value: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Distribution> for BTreeMap<String, f64> {
    fn from(value: Distribution) -> Self {
        value.fractions
    }
}

/// Allowed absolute deviation around an expected fraction (0.10 = ±10 points).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ToleranceWindow(f64);

impl ToleranceWindow {
    pub fn new(width: f64) -> Result<Self, ShiftError> {
        if !width.is_finite() || !(0.0..=1.0).contains(&width) {
            return Err(ShiftError::InvalidScenario(format!(
                "tolerance must be within [0, 1], got {width}"
            )));
        }
        Ok(Self(width))
    }

    pub fn width(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for ToleranceWindow {
    type Error = ShiftError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToleranceWindow> for f64 {
    fn from(value: ToleranceWindow) -> Self {
        value.0
    }
}

/// How strictly a scenario compares observed against expected fractions.
///
/// Chosen per scenario. Full cutovers use `Exact` because they must be
/// deterministic; partial splits need a window to absorb sampling variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "window", rename_all = "snake_case")]
pub enum TolerancePolicy {
    Exact,
    Windowed(ToleranceWindow),
}

impl TolerancePolicy {
    pub fn windowed(width: f64) -> Result<Self, ShiftError> {
        Ok(TolerancePolicy::Windowed(ToleranceWindow::new(width)?))
    }

    /// Allowed deviation for each label.
    pub fn allowance(&self) -> f64 {
        match self {
            TolerancePolicy::Exact => 0.0,
            TolerancePolicy::Windowed(window) => window.width(),
        }
    }

    /// Whether `delta` (absolute) is acceptable under this policy.
    ///
    /// `Exact` allows no slack at all: a full cutover observes `n / n`, which
    /// is exactly `1.0`, so any misrouted probe leaves a non-zero delta.
    pub fn accepts(&self, delta: f64) -> bool {
        match self {
            TolerancePolicy::Exact => delta <= 0.0,
            TolerancePolicy::Windowed(window) => delta <= window.width() + FRACTION_EPSILON,
        }
    }
}
