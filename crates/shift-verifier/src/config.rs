//! Verifier configuration.
//!
//! Loaded from environment variables once, in `main`. Everything downstream
//! receives explicit values, including the selected [`TestGroup`].

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::IngressService;
use crate::errors::ShiftError;
use crate::scenario::{ScenarioCatalog, TestGroup};
use crate::types::Endpoint;

/// Default namespace the tcp-echo backends and routes live in.
pub const DEFAULT_NAMESPACE: &str = "tcp-shift";

/// Default directory holding the built-in manifests.
pub const DEFAULT_MANIFEST_DIR: &str = "manifests";

/// Default settle time after a routing change, in seconds.
pub const DEFAULT_SETTLE_SECONDS: u64 = 10;

/// Default per-probe deadline, in milliseconds.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;

/// Default number of probes in flight.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 1;

/// Default backend readiness deadline, in seconds.
pub const DEFAULT_READY_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Traffic-shift verifier configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which scenario set to run (`SHIFT_TEST_GROUP`, default "full").
    pub test_group: TestGroup,

    /// Namespace manifests are applied into.
    pub namespace: String,

    /// Optional kubeconfig passed to kubectl.
    pub kubeconfig: Option<PathBuf>,

    /// Directory holding the built-in manifests.
    pub manifest_dir: PathBuf,

    /// JSON catalog replacing the built-in scenarios.
    pub scenario_file: Option<PathBuf>,

    /// Fixed ingress address; skips kubectl resolution when set.
    pub ingress_override: Option<Endpoint>,

    /// Gateway service to resolve when no override is given.
    pub ingress: IngressService,

    pub settle: Duration,
    pub probe_timeout: Duration,
    pub probe_concurrency: usize,
    pub ready_timeout: Duration,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let test_group = match vars.get("SHIFT_TEST_GROUP") {
            Some(raw) => raw
                .parse::<TestGroup>()
                .map_err(|e| ConfigError::InvalidValue(format!("SHIFT_TEST_GROUP: {e}")))?,
            None => TestGroup::Full,
        };
        // `full` always wins; otherwise an arm build host forces the arm group
        let test_group = match vars.get("SAMPLEARCH").map(|s| s.trim()) {
            Some(arch) if test_group != TestGroup::Full && arch.eq_ignore_ascii_case("arm") => {
                TestGroup::Arm
            }
            _ => test_group,
        };

        let namespace = vars
            .get("SHIFT_NAMESPACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let kubeconfig = vars
            .get("KUBECONFIG")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let manifest_dir = vars
            .get("SHIFT_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_DIR));

        let scenario_file = vars
            .get("SHIFT_SCENARIO_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let ingress_override = match (vars.get("SHIFT_INGRESS_HOST"), vars.get("SHIFT_INGRESS_PORT")) {
            (Some(host), Some(port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ConfigError::InvalidValue(format!("SHIFT_INGRESS_PORT={port}: {e}"))
                })?;
                Some(Endpoint::new(host.clone(), port))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::MissingEnvVar("SHIFT_INGRESS_PORT".to_string()))
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar("SHIFT_INGRESS_HOST".to_string()))
            }
        };

        let defaults = IngressService::default();
        let ingress = IngressService {
            namespace: vars
                .get("SHIFT_INGRESS_NAMESPACE")
                .cloned()
                .unwrap_or(defaults.namespace),
            service: vars
                .get("SHIFT_INGRESS_SERVICE")
                .cloned()
                .unwrap_or(defaults.service),
            port_name: vars
                .get("SHIFT_INGRESS_PORT_NAME")
                .cloned()
                .unwrap_or(defaults.port_name),
        };

        let settle = Duration::from_secs(parse_var(
            vars,
            "SHIFT_SETTLE_SECONDS",
            DEFAULT_SETTLE_SECONDS,
        )?);
        let probe_timeout = Duration::from_millis(parse_var(
            vars,
            "SHIFT_PROBE_TIMEOUT_MS",
            DEFAULT_PROBE_TIMEOUT_MS,
        )?);
        let ready_timeout = Duration::from_secs(parse_var(
            vars,
            "SHIFT_READY_TIMEOUT_SECONDS",
            DEFAULT_READY_TIMEOUT_SECONDS,
        )?);

        let probe_concurrency: usize =
            parse_var(vars, "SHIFT_PROBE_CONCURRENCY", DEFAULT_PROBE_CONCURRENCY)?;
        if probe_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "SHIFT_PROBE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if probe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SHIFT_PROBE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        let json_logs = parse_var(vars, "SHIFT_LOG_JSON", false)?;

        Ok(Config {
            test_group,
            namespace,
            kubeconfig,
            manifest_dir,
            scenario_file,
            ingress_override,
            ingress,
            settle,
            probe_timeout,
            probe_concurrency,
            ready_timeout,
            json_logs,
        })
    }

    /// Scenario catalog selected by this configuration.
    pub fn catalog(&self) -> Result<ScenarioCatalog, ShiftError> {
        match &self.scenario_file {
            Some(path) => ScenarioCatalog::from_file(path),
            None => ScenarioCatalog::tcp_traffic_shifting(&self.manifest_dir),
        }
    }
}

/// Parse `key` if present, otherwise return `default`. Present but
/// unparseable values are errors.
fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}
