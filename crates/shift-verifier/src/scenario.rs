//! Shift scenarios and test-group selection.
//!
//! A scenario names one routing manifest, the backends it expects to see and
//! how traffic should split between them. The built-in catalog covers TCP
//! traffic shifting between the `v1`/`v2` tcp-echo backends; a JSON file can
//! replace it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::cluster::RoutingManifest;
use crate::errors::ShiftError;
use crate::types::{BackendMarker, Distribution, TolerancePolicy};

/// Default probe budget per scenario.
pub const DEFAULT_PROBES: u32 = 100;

/// Label selector of the tcp-echo backend pods.
pub const TCP_ECHO_SELECTOR: &str = "app=tcp-echo";

/// Named set of scenarios to run, chosen once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestGroup {
    Full,
    Smoke,
    Arm,
    Interop,
}

impl TestGroup {
    pub const ALL: [TestGroup; 4] = [
        TestGroup::Full,
        TestGroup::Smoke,
        TestGroup::Arm,
        TestGroup::Interop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestGroup::Full => "full",
            TestGroup::Smoke => "smoke",
            TestGroup::Arm => "arm",
            TestGroup::Interop => "interop",
        }
    }
}

impl fmt::Display for TestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(TestGroup::Full),
            "smoke" => Ok(TestGroup::Smoke),
            "arm" => Ok(TestGroup::Arm),
            "interop" => Ok(TestGroup::Interop),
            other => Err(format!(
                "unknown test group '{other}' (expected full, smoke, arm or interop)"
            )),
        }
    }
}

fn default_probes() -> u32 {
    DEFAULT_PROBES
}

fn default_groups() -> Vec<TestGroup> {
    TestGroup::ALL.to_vec()
}

/// One traffic-shift check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftScenario {
    pub name: String,
    pub manifest: RoutingManifest,
    #[serde(default = "default_probes")]
    pub probes: u32,
    pub markers: Vec<BackendMarker>,
    pub expected: Distribution,
    pub tolerance: TolerancePolicy,
    #[serde(default = "default_groups")]
    pub groups: Vec<TestGroup>,
}

impl ShiftScenario {
    /// Reject scenarios that could never produce a meaningful verdict.
    pub fn validate(&self) -> Result<(), ShiftError> {
        if self.probes == 0 {
            return Err(ShiftError::InvalidScenario(format!(
                "{}: probe budget must be at least 1",
                self.name
            )));
        }
        if self.markers.is_empty() {
            return Err(ShiftError::InvalidScenario(format!(
                "{}: no backend markers configured",
                self.name
            )));
        }
        for label in self.expected.labels() {
            if !self.markers.iter().any(|m| m.label == label) {
                return Err(ShiftError::InvalidScenario(format!(
                    "{}: no marker configured for expected backend {label}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn in_group(&self, group: TestGroup) -> bool {
        self.groups.contains(&group)
    }
}

/// Backend deployment the scenarios route between, set up once per suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteFixture {
    pub manifest: RoutingManifest,
    pub backend_selector: String,
}

/// Ordered scenario list plus the optional fixture they share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCatalog {
    #[serde(default)]
    pub fixture: Option<SuiteFixture>,
    pub scenarios: Vec<ShiftScenario>,
}

impl ScenarioCatalog {
    /// TCP traffic shifting between tcp-echo `v1` ("one") and `v2` ("two").
    ///
    /// Full cutover to v1 must be exact; the 80/20 split allows ±10 points.
    pub fn tcp_traffic_shifting(manifest_dir: &Path) -> Result<Self, ShiftError> {
        let markers = vec![
            BackendMarker::new("v1", "one"),
            BackendMarker::new("v2", "two"),
        ];

        let all_v1 = ShiftScenario {
            name: "100%_v1_shift".to_string(),
            manifest: RoutingManifest::new(
                "tcp-echo-all-v1",
                manifest_dir.join("tcp-echo-all-v1.yaml"),
            ),
            probes: DEFAULT_PROBES,
            markers: markers.clone(),
            expected: Distribution::all_to("v1"),
            tolerance: TolerancePolicy::Exact,
            groups: default_groups(),
        };

        let split = ShiftScenario {
            name: "20%_v2_shift".to_string(),
            manifest: RoutingManifest::new(
                "tcp-echo-20-v2",
                manifest_dir.join("tcp-echo-20-v2.yaml"),
            ),
            probes: DEFAULT_PROBES,
            markers,
            expected: Distribution::new([("v1", 0.8), ("v2", 0.2)])?,
            tolerance: TolerancePolicy::windowed(0.10)?,
            groups: vec![TestGroup::Full, TestGroup::Arm, TestGroup::Interop],
        };

        Ok(Self {
            fixture: Some(SuiteFixture {
                manifest: RoutingManifest::new(
                    "tcp-echo-services",
                    manifest_dir.join("tcp-echo-services.yaml"),
                ),
                backend_selector: TCP_ECHO_SELECTOR.to_string(),
            }),
            scenarios: vec![all_v1, split],
        })
    }

    /// Parse and validate a JSON catalog.
    pub fn from_json(json: &str) -> Result<Self, ShiftError> {
        let catalog: Self = serde_json::from_str(json)
            .map_err(|e| ShiftError::InvalidScenario(format!("scenario file: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_file(path: &Path) -> Result<Self, ShiftError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ShiftError::InvalidScenario(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ShiftError> {
        let mut seen = std::collections::HashSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(ShiftError::InvalidScenario(format!(
                    "duplicate scenario name {}",
                    scenario.name
                )));
            }
        }
        Ok(())
    }

    /// Scenarios in `group`, in declaration order.
    pub fn select(&self, group: TestGroup) -> Vec<&ShiftScenario> {
        self.scenarios
            .iter()
            .filter(|s| s.in_group(group))
            .collect()
    }
}
