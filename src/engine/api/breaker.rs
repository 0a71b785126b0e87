// Cziczere Sync Engine: Backend Circuit Breaker
//
// One breaker guards every one-shot endpoint of a client. A run of failed
// calls opens the circuit and calls fail fast with `BackendUnavailable`.
// Once the cooldown has passed a single trial call goes through; its outcome
// closes the circuit or opens it for another cooldown. Client errors (4xx
// other than 429) are the caller's fault and never count.

use crate::atoms::error::{SyncError, SyncResult};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Reported through `MetricsReport::circuit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum CircuitState {
    #[default]
    Closed,
    #[serde(rename_all = "camelCase")]
    Open { retry_in_secs: u64 },
    HalfOpen,
}

#[derive(Default)]
struct Circuit {
    failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker { threshold: threshold.max(1), cooldown, circuit: Mutex::new(Circuit::default()) }
    }

    pub fn state(&self) -> CircuitState {
        self.state_of(&self.circuit.lock(), Instant::now())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.circuit.lock().failures
    }

    fn state_of(&self, circuit: &Circuit, now: Instant) -> CircuitState {
        match circuit.opened_at {
            None => CircuitState::Closed,
            Some(opened) => {
                let open_for = now.saturating_duration_since(opened);
                if open_for < self.cooldown {
                    let remaining = self.cooldown - open_for;
                    CircuitState::Open { retry_in_secs: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0) }
                } else {
                    CircuitState::HalfOpen
                }
            }
        }
    }

    /// Let a call to `endpoint` through, or refuse it while the circuit is
    /// open. In the half-open state only one trial is admitted per cooldown.
    pub fn admit(&self, endpoint: &str) -> SyncResult<()> {
        let now = Instant::now();
        let mut circuit = self.circuit.lock();
        match self.state_of(&circuit, now) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { retry_in_secs } => {
                Err(SyncError::BackendUnavailable { failures: circuit.failures, retry_in_secs })
            }
            CircuitState::HalfOpen => {
                let trial_running = circuit
                    .trial_started
                    .map(|started| now.saturating_duration_since(started) < self.cooldown)
                    .unwrap_or(false);
                if trial_running {
                    return Err(SyncError::BackendUnavailable { failures: circuit.failures, retry_in_secs: 0 });
                }
                circuit.trial_started = Some(now);
                info!("[api] circuit half-open, trial call to {}", endpoint);
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut circuit = self.circuit.lock();
        if circuit.opened_at.is_some() {
            info!("[api] circuit closed after {} failure(s)", circuit.failures);
        }
        *circuit = Circuit::default();
    }

    pub fn record_failure(&self, endpoint: &str) {
        let now = Instant::now();
        let mut circuit = self.circuit.lock();
        circuit.failures = circuit.failures.saturating_add(1);
        circuit.trial_started = None;
        let reopen = circuit.opened_at.is_some();
        if reopen || circuit.failures >= self.threshold {
            circuit.opened_at = Some(now);
            warn!(
                "[api] circuit open after {} consecutive failure(s), last {}; cooling down {}s",
                circuit.failures,
                endpoint,
                self.cooldown.as_secs()
            );
        }
    }
}
