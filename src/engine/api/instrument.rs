// Cziczere Sync Engine: Call Instrumentation
//
// Explicit middleware wrapped around every one-shot call site: measures the
// call, records success or failure, and keeps a ring of recent response
// times for averages and the slowest-call report.

use super::breaker::CircuitState;
use crate::atoms::constants::CALL_METRICS_CAPACITY;
use crate::atoms::error::SyncResult;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowestCall {
    pub endpoint: String,
    pub duration_ms: u64,
    /// Epoch milliseconds.
    pub at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub average_response_ms: f64,
    pub slowest_call: Option<SlowestCall>,
    /// Filled in by the owning client; `CallMetrics` alone reports `Closed`.
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct Samples {
    durations: VecDeque<u64>,
    total: u64,
    failed: u64,
    slowest: Option<SlowestCall>,
}

#[derive(Default)]
pub struct CallMetrics {
    samples: Mutex<Samples>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, endpoint: &str, duration: Duration, ok: bool) {
        let ms = duration.as_millis() as u64;
        let mut s = self.samples.lock();
        s.total += 1;
        if !ok {
            s.failed += 1;
        }
        s.durations.push_back(ms);
        if s.durations.len() > CALL_METRICS_CAPACITY {
            s.durations.pop_front();
        }
        let slower = s.slowest.as_ref().map(|c| ms > c.duration_ms).unwrap_or(true);
        if slower {
            s.slowest = Some(SlowestCall {
                endpoint: endpoint.to_string(),
                duration_ms: ms,
                at: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    pub fn report(&self) -> MetricsReport {
        let s = self.samples.lock();
        let average_response_ms = if s.durations.is_empty() {
            0.0
        } else {
            s.durations.iter().sum::<u64>() as f64 / s.durations.len() as f64
        };
        MetricsReport {
            total_calls: s.total,
            failed_calls: s.failed,
            average_response_ms,
            slowest_call: s.slowest.clone(),
            ..MetricsReport::default()
        }
    }

    /// Run `call`, timing it and recording the outcome under `endpoint`.
    pub async fn instrument<T, F>(&self, endpoint: &str, call: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();
        self.record(endpoint, elapsed, result.is_ok());
        match &result {
            Ok(_) => debug!("[api] {} ok in {}ms", endpoint, elapsed.as_millis()),
            Err(e) => warn!("[api] {} failed after {}ms: {}", endpoint, elapsed.as_millis(), e),
        }
        result
    }
}
