//! Lightweight telemetry facade for the duet query engine. Counters and
//! latency histograms stay in process so tests can assert how admission,
//! rejection and abort paths were instrumented.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::SystemTime};
use thiserror::Error;

const DEFAULT_FLUSH_MS: u64 = 5_000;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

fn default_component() -> String {
    "duet".to_owned()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Value of the `component` label attached to every snapshot.
    #[serde(default = "default_component")]
    pub component: String,
    /// Flush cadence in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Extra labels appended to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::sample("duet")
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("histogram for metric {metric} rejected a sample: {details}")]
    Histogram { metric: String, details: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        Self {
            count: histogram.len(),
            p50: histogram.value_at_quantile(0.50),
            p95: histogram.value_at_quantile(0.95),
            p99: histogram.value_at_quantile(0.99),
            max: histogram.max(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, LatencySummary>,
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Histogram<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    /// Current value of a counter since the last flush.
    pub fn counter(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock();
        if !guard.latencies_ms.contains_key(name) {
            let histogram = Histogram::new(3).map_err(|err| TelemetryError::Histogram {
                metric: name.to_owned(),
                details: err.to_string(),
            })?;
            guard.latencies_ms.insert(name.to_owned(), histogram);
        }
        if let Some(histogram) = guard.latencies_ms.get_mut(name) {
            // hdrhistogram cannot hold zero with a lowest discernible value of 1.
            histogram
                .record(value.max(1))
                .map_err(|err| TelemetryError::Histogram {
                    metric: name.to_owned(),
                    details: err.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock();
        let mut labels = self.config.labels.clone();
        labels.insert("component".into(), self.config.component.clone());
        let snapshot = TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels,
            counters: guard.counters.clone(),
            latencies_ms: guard
                .latencies_ms
                .iter()
                .map(|(name, histogram)| (name.clone(), LatencySummary::from_histogram(histogram)))
                .collect(),
        };
        guard.counters.clear();
        guard.latencies_ms.clear();
        snapshot
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("ledger-tests"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter("queries.admitted", 1).unwrap();
        handle.record_counter("queries.admitted", 2).unwrap();
        handle.record_latency_ms("query.total", 42).unwrap();
        handle.record_latency_ms("query.total", 0).unwrap();
        let snapshot = handle.flush();
        assert_eq!(snapshot.counters["queries.admitted"], 3);
        let latency = snapshot.latencies_ms["query.total"];
        assert_eq!(latency.count, 2);
        assert!(latency.max >= 42);
        assert_eq!(snapshot.labels["component"], "ledger-tests");
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("queries.rejected", u64::MAX).unwrap();
        let err = handle.record_counter("queries.rejected", 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn flush_clears_state() {
        let handle = handle();
        handle.record_counter("reservations.aborted", 1).unwrap();
        assert_eq!(handle.counter("reservations.aborted"), 1);
        handle.flush();
        let second = handle.flush();
        assert!(second.counters.is_empty());
        assert_eq!(handle.counter("reservations.aborted"), 0);
    }
}
