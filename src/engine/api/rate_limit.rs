// Cziczere Sync Engine: Owned Rate Limiter
//
// Fixed per-minute and per-hour windows per endpoint. The window map lives
// inside the limiter instance; each `HttpApi` owns one.

use crate::atoms::constants::{MAX_REQUESTS_PER_HOUR, MAX_REQUESTS_PER_MINUTE};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn fresh(now: Instant, span: Duration) -> Self {
        Window { count: 0, reset_at: now + span }
    }

    fn roll(&mut self, now: Instant, span: Duration) {
        if now >= self.reset_at {
            *self = Window::fresh(now, span);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EndpointWindows {
    minute: Window,
    hour: Window,
}

pub struct RateLimiter {
    per_minute: u32,
    per_hour: u32,
    windows: Mutex<HashMap<String, EndpointWindows>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MAX_REQUESTS_PER_MINUTE, MAX_REQUESTS_PER_HOUR)
    }
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        RateLimiter { per_minute, per_hour, windows: Mutex::new(HashMap::new()) }
    }

    /// Count one call against `endpoint`. Returns false, without counting,
    /// when either window is full.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        // Endpoints idle for a full hour start over.
        windows.retain(|_, w| now < w.hour.reset_at);
        let entry = windows.entry(endpoint.to_string()).or_insert_with(|| EndpointWindows {
            minute: Window::fresh(now, MINUTE),
            hour: Window::fresh(now, HOUR),
        });
        entry.minute.roll(now, MINUTE);
        entry.hour.roll(now, HOUR);

        if entry.minute.count >= self.per_minute || entry.hour.count >= self.per_hour {
            warn!(
                "[api] rate limit hit for {} ({}/min, {}/h)",
                endpoint, entry.minute.count, entry.hour.count
            );
            return false;
        }
        entry.minute.count += 1;
        entry.hour.count += 1;
        true
    }
}
