// Cziczere Sync Engine: Retry Policy for One-Shot Calls
//
// Classifies backend responses and spaces out retries: exponential backoff
// from `base`, capped at `cap`, with ±25% jitter and a server `Retry-After`
// (integer seconds) as the floor.

use std::time::Duration;

/// Default retry count per call, on top of the first attempt.
pub const MAX_RETRIES: u32 = 3;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_RETRY_AFTER_SECS: u64 = 60;
const MIN_DELAY_MS: u64 = 100;

/// What to do with a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Transient on the backend side; retry and count against the circuit.
    Retry,
    /// The credential was refused; surface as an auth error.
    Unauthorized,
    /// The request itself is wrong; fail without touching the circuit.
    Reject,
}

pub fn classify(status: u16) -> Verdict {
    match status {
        401 | 403 => Verdict::Unauthorized,
        408 | 429 | 500 | 502 | 503 | 504 => Verdict::Retry,
        _ => Verdict::Reject,
    }
}

pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_retries: MAX_RETRIES, base: BASE_DELAY, cap: MAX_DELAY }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        RetryPolicy { max_retries, ..Self::default() }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    fn nominal(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(attempt.min(10))).min(self.cap);
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)).max(backoff),
            None => backoff,
        }
    }

    pub fn delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        jitter(self.nominal(attempt, retry_after_secs))
    }

    /// Sleep out the delay for `attempt` and return it for logging.
    pub async fn wait(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = self.delay(attempt, retry_after_secs);
        tokio::time::sleep(delay).await;
        delay
    }
}

fn jitter(nominal: Duration) -> Duration {
    let ms = nominal.as_millis() as u64;
    let spread = ms / 4;
    if spread == 0 {
        return Duration::from_millis(ms.max(MIN_DELAY_MS));
    }
    let roll = (uuid::Uuid::new_v4().as_u128() % u128::from(2 * spread + 1)) as u64;
    Duration::from_millis((ms - spread + roll).max(MIN_DELAY_MS))
}
