//! Distribution sampler.
//!
//! Spends a fixed probe budget against one endpoint and tallies which backend
//! answered each probe. Failed probes are counted and logged, never retried:
//! the budget is not topped up, so a flaky endpoint drags the classified
//! fractions down and shows up in the verdict.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::probe::{Probe, ProbeResult};
use crate::types::Endpoint;

/// Per-label counts for one sampling run.
///
/// `classified() + failures == total_probes` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    counts: BTreeMap<String, u64>,
    failures: u64,
    failure_kinds: BTreeMap<String, u64>,
    total_probes: u64,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tally from known counts (no failures).
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut tally = Self::new();
        for (label, count) in counts {
            let label = label.into();
            tally.total_probes += count;
            *tally.counts.entry(label).or_insert(0) += count;
        }
        tally
    }

    /// Add `count` failed probes of the given kind.
    #[must_use]
    pub fn with_failures(mut self, kind: &str, count: u64) -> Self {
        self.failures += count;
        self.total_probes += count;
        *self.failure_kinds.entry(kind.to_string()).or_insert(0) += count;
        self
    }

    pub fn record(&mut self, result: &ProbeResult) {
        self.total_probes += 1;
        match result {
            ProbeResult::Classified(label) => {
                *self.counts.entry(label.clone()).or_insert(0) += 1;
            }
            ProbeResult::Failed(failure) => {
                self.failures += 1;
                *self
                    .failure_kinds
                    .entry(failure.kind().to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn count(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn failure_kinds(&self) -> &BTreeMap<String, u64> {
        &self.failure_kinds
    }

    pub fn classified(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn total_probes(&self) -> u64 {
        self.total_probes
    }

    /// Fraction of all issued probes that landed on `label`.
    /// Zero for an empty tally.
    pub fn fraction(&self, label: &str) -> f64 {
        if self.total_probes == 0 {
            return 0.0;
        }
        self.count(label) as f64 / self.total_probes as f64
    }
}

/// Issues a fixed number of probes and tallies the results.
///
/// `concurrency` bounds how many probes are in flight. The default of 1 keeps
/// probes sequential so the sampler does not skew the split under test with
/// its own load. Each probe opens its own connection either way.
#[derive(Clone)]
pub struct DistributionSampler {
    probe: Arc<dyn Probe>,
    concurrency: usize,
}

impl DistributionSampler {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            concurrency: 1,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spend `total_probes` probes against `endpoint`.
    pub async fn sample(&self, endpoint: &Endpoint, total_probes: u32) -> Tally {
        let probe = &self.probe;
        let mut results = stream::iter(0..total_probes)
            .map(|index| async move { (index, probe.probe(endpoint).await) })
            .buffer_unordered(self.concurrency);

        let mut tally = Tally::new();
        while let Some((index, result)) = results.next().await {
            if let ProbeResult::Failed(failure) = &result {
                warn!(
                    target: "shift.sampler",
                    endpoint = %endpoint,
                    probe = index,
                    kind = failure.kind(),
                    error = %failure,
                    "Probe failed"
                );
            }
            tally.record(&result);
        }

        debug!(
            target: "shift.sampler",
            endpoint = %endpoint,
            total = tally.total_probes(),
            classified = tally.classified(),
            failures = tally.failures(),
            "Sampling complete"
        );

        tally
    }
}
