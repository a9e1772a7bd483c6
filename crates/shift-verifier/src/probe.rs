//! Probe client.
//!
//! One probe = one fresh TCP connection to the ingress, one timestamped line
//! written, one reply read back. The reply is classified by which backend
//! marker it contains. A probe never panics or drops silently: anything that
//! is not a recognised reply comes back as [`ProbeResult::Failed`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::types::{BackendMarker, Endpoint};

/// Upper bound on how much of a reply is read.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Default per-probe deadline covering connect, write and read.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Why a single probe did not produce a classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("empty reply")]
    Empty,

    #[error("unrecognized reply: {payload}")]
    Unrecognized { payload: String },
}

impl ProbeFailure {
    /// Short name used for the failure breakdown in a tally.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeFailure::Connect(_) => "connect",
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::Io(_) => "io",
            ProbeFailure::Empty => "empty",
            ProbeFailure::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Label of the backend version that answered.
    Classified(String),
    Failed(ProbeFailure),
}

/// Sends one probe to an endpoint. Implementations hold no state shared
/// between probes.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult;
}

/// Case-insensitive substring matcher over a closed set of backend markers.
///
/// Markers are tried in declaration order; the first match wins.
#[derive(Debug, Clone)]
pub struct Classifier {
    markers: Vec<(String, String)>,
}

impl Classifier {
    pub fn new(markers: &[BackendMarker]) -> Self {
        Self {
            markers: markers
                .iter()
                .map(|m| (m.label.clone(), m.marker.to_lowercase()))
                .collect(),
        }
    }

    /// Label whose marker appears in `payload`, if any.
    pub fn classify(&self, payload: &str) -> Option<&str> {
        let payload = payload.to_lowercase();
        self.markers
            .iter()
            .find(|(_, marker)| !marker.is_empty() && payload.contains(marker.as_str()))
            .map(|(label, _)| label.as_str())
    }

    /// Turn a raw reply into a probe result.
    pub fn result_for(&self, payload: &str) -> ProbeResult {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return ProbeResult::Failed(ProbeFailure::Empty);
        }
        match self.classify(trimmed) {
            Some(label) => ProbeResult::Classified(label.to_string()),
            None => ProbeResult::Failed(ProbeFailure::Unrecognized {
                payload: trimmed.to_string(),
            }),
        }
    }
}

/// TCP probe against an echo backend behind the mesh ingress.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    classifier: Classifier,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(classifier: Classifier, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    async fn exchange(&self, endpoint: &Endpoint) -> Result<String, ProbeFailure> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ProbeFailure::Connect(e.to_string()))?;

        let line = format!("{}\n", chrono::Utc::now().to_rfc2822());
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProbeFailure::Io(e.to_string()))?;

        let mut payload = Vec::with_capacity(256);
        let mut chunk = [0u8; 512];
        loop {
            let read = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ProbeFailure::Io(e.to_string()))?;
            if read == 0 {
                break;
            }
            payload.extend(chunk.iter().take(read));
            if payload.contains(&b'\n') || payload.len() >= MAX_PAYLOAD_BYTES {
                break;
            }
        }
        payload.truncate(MAX_PAYLOAD_BYTES);

        Ok(String::from_utf8_lossy(&payload).into_owned())
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.exchange(endpoint)).await {
            Ok(Ok(payload)) => self.classifier.result_for(&payload),
            Ok(Err(failure)) => ProbeResult::Failed(failure),
            Err(_) => ProbeResult::Failed(ProbeFailure::Timeout),
        }
    }
}

/// Builds the probe for a scenario from that scenario's markers.
pub trait ProbeFactory: Send + Sync {
    fn probe_for(&self, classifier: Classifier) -> Arc<dyn Probe>;
}

/// Produces [`TcpProbe`]s sharing one timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbeFactory {
    timeout: Duration,
}

impl TcpProbeFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbeFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl ProbeFactory for TcpProbeFactory {
    fn probe_for(&self, classifier: Classifier) -> Arc<dyn Probe> {
        Arc::new(TcpProbe::new(classifier, self.timeout))
    }
}
