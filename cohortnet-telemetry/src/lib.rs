//! Lightweight telemetry facade for the cohortnet engine and node. Counters,
//! gauges and latencies stay in process so tests can assert instrumentation
//! without an exporter.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for cohortnet-telemetry."
);

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 1_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(feature = "prod")]
const DEFAULT_FLUSH_MS: u64 = 5_000;
#[cfg(not(any(feature = "dev", feature = "test", feature = "prod")))]
const DEFAULT_FLUSH_MS: u64 = 5_000;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Component name attached to every snapshot as the `component` label.
    pub component: String,
    /// Flush cadence in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Global labels appended to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
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

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::sample("cohortnet")
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("failed to encode telemetry snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp_ms: u64,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub latencies_us: BTreeMap<String, Vec<u64>>,
}

impl TelemetrySnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
    latencies_us: BTreeMap<String, Vec<u64>>,
}

/// Cheap to clone; every clone feeds the same state.
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

    /// Gauges keep the last written value and survive `flush`.
    pub fn record_gauge(&self, name: &str, value: i64) {
        self.state.lock().gauges.insert(name.to_owned(), value);
    }

    pub fn record_latency_us(&self, name: &str, value: u64) {
        self.state
            .lock()
            .latencies_us
            .entry(name.to_owned())
            .or_default()
            .push(value);
    }

    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock();
        let mut labels = self.config.labels.clone();
        labels.insert("component".into(), self.config.component.clone());
        TelemetrySnapshot {
            timestamp_ms: now_ms(),
            labels,
            counters: std::mem::take(&mut guard.counters),
            gauges: guard.gauges.clone(),
            latencies_us: std::mem::take(&mut guard.latencies_us),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("cohort-engine"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter("cohort.admitted", 1).unwrap();
        handle.record_counter("cohort.admitted", 2).unwrap();
        handle.record_latency_us("cohort.seal_us", 42);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counter("cohort.admitted"), 3);
        assert_eq!(snapshot.latencies_us["cohort.seal_us"], vec![42]);
        assert_eq!(snapshot.labels["component"], "cohort-engine");
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("cohort.admitted", u64::MAX).unwrap();
        let err = handle.record_counter("cohort.admitted", 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn flush_clears_counters_but_keeps_gauges() {
        let handle = handle();
        handle.record_counter("cohort.sealed", 1).unwrap();
        handle.record_gauge("cohort.pending", 3);
        handle.flush();
        let second = handle.flush();
        assert!(second.counters.is_empty());
        assert_eq!(second.gauges["cohort.pending"], 3);
    }

    #[test]
    fn snapshot_encodes_as_json() {
        let handle = handle();
        handle.record_gauge("cohort.pending", 2);
        let json = handle.flush().to_json().unwrap();
        assert!(json.contains("\"cohort.pending\":2"));
    }
}
