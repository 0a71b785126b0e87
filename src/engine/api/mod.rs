// Cziczere Sync Engine: Backend API Client
//
// reqwest client for the one-shot HTTP calls. Every call goes through the
// same pipeline:
//   rate limiter → circuit breaker → instrumentation → bounded retry
// Retries cover transport errors, 408, 429 and 5xx (honoring `Retry-After`).
// 401/403 and other client errors are never retried.

pub mod breaker;
pub mod instrument;
pub mod rate_limit;
pub mod retry;

use crate::atoms::constants::DEFAULT_API_BASE;
use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::traits::GardenApi;
use crate::atoms::types::{AtmosphereData, InsightRecord, MemoryRecord, Token};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub use breaker::{CircuitBreaker, CircuitState};
pub use instrument::{CallMetrics, MetricsReport};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
use retry::Verdict;

// ── Endpoints ──────────────────────────────────────────────────────────────

pub const GENERATE_MEMORY_PLANT: &str = "generateMemoryPlant";
pub const ANALYZE_MEMORIES: &str = "analyzeMemories";
pub const GET_ATMOSPHERE: &str = "getAtmosphere";
pub const EXPORT_GARDEN: &str = "exportGarden";
pub const GET_INSIGHT_AUDIO: &str = "getInsightAudio";
pub const POETIC_REPHRASING: &str = "poeticRephrasing";

/// Failures before the breaker opens, and how long it stays open.
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

// ── Response shapes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GardenExport {
    pub base64_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightAudio {
    pub audio_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoeticRephrasing {
    pub poetic_version: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    metrics: CallMetrics,
}

impl Default for HttpApi {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE, RateLimiter::default())
    }
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, limiter: RateLimiter) -> Self {
        HttpApi {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            limiter,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            metrics: CallMetrics::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryPolicy::with_max_retries(max_retries);
        self
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// Call metrics plus the current state of the backend circuit.
    pub fn metrics(&self) -> MetricsReport {
        let mut report = self.metrics.report();
        report.circuit = self.breaker.state();
        report.consecutive_failures = self.breaker.consecutive_failures();
        report
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Ask the backend for a new insight over the user's recent memories.
    pub async fn analyze_memories(&self, token: &Token, analysis_type: &str) -> SyncResult<InsightRecord> {
        self.call(ANALYZE_MEMORIES, Method::POST, token, Some(json!({ "analysisType": analysis_type })), &[])
            .await
    }

    pub async fn export_garden(&self, token: &Token) -> SyncResult<GardenExport> {
        self.call(EXPORT_GARDEN, Method::POST, token, Some(json!({})), &[]).await
    }

    pub async fn get_insight_audio(&self, token: &Token, insight_id: &str) -> SyncResult<InsightAudio> {
        self.call(GET_INSIGHT_AUDIO, Method::GET, token, None, &[("insightId", insight_id)]).await
    }

    pub async fn poetic_rephrasing(&self, token: &Token, text: &str) -> SyncResult<PoeticRephrasing> {
        self.call(POETIC_REPHRASING, Method::POST, token, Some(json!({ "originalText": text })), &[])
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: Method,
        token: &Token,
        body: Option<Value>,
        query: &[(&str, &str)],
    ) -> SyncResult<T> {
        if !self.limiter.try_acquire(endpoint) {
            return Err(SyncError::RateLimited { endpoint: endpoint.to_string() });
        }
        self.breaker.admit(endpoint)?;
        self.metrics
            .instrument(endpoint, self.send_with_retry(endpoint, method, token, body.as_ref(), query))
            .await
    }

    async fn send_with_retry<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: Method,
        token: &Token,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> SyncResult<T> {
        let url = self.endpoint_url(endpoint);
        let mut attempt: u32 = 0;

        loop {
            let mut req = self.client.request(method.clone(), &url).bearer_auth(token.expose());
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    self.breaker.record_failure(endpoint);
                    if self.retry.allows(attempt) {
                        let delay = self.retry.wait(attempt, None).await;
                        warn!("[api] {} transport error, retry {}/{} after {}ms: {}",
                            endpoint, attempt + 1, self.retry.max_retries, delay.as_millis(), e);
                        attempt += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                self.breaker.record_success();
                debug!("[api] {} → {}", endpoint, status);
                return Ok(response.json::<T>().await?);
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(retry::parse_retry_after);
            let text = response.text().await.unwrap_or_default();

            match retry::classify(status) {
                Verdict::Unauthorized => {
                    // The backend answered; the credential is the problem.
                    self.breaker.record_success();
                    return Err(SyncError::Auth(format!("{} rejected credential ({})", endpoint, status)));
                }
                Verdict::Reject => {
                    self.breaker.record_success();
                    return Err(SyncError::api(endpoint, status, truncate(&text, 200)));
                }
                Verdict::Retry => {
                    self.breaker.record_failure(endpoint);
                    if !self.retry.allows(attempt) {
                        return Err(SyncError::api(endpoint, status, truncate(&text, 200)));
                    }
                    let delay = self.retry.wait(attempt, retry_after).await;
                    warn!("[api] {} returned {}, retry {}/{} after {}ms",
                        endpoint, status, attempt + 1, self.retry.max_retries, delay.as_millis());
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl GardenApi for HttpApi {
    async fn create_memory(&self, token: &Token, text: &str, client_ref: &str) -> SyncResult<MemoryRecord> {
        self.call(
            GENERATE_MEMORY_PLANT,
            Method::POST,
            token,
            Some(json!({ "text": text, "clientRef": client_ref })),
            &[],
        )
        .await
    }

    async fn get_atmosphere(&self, token: &Token) -> SyncResult<AtmosphereData> {
        self.call(GET_ATMOSPHERE, Method::POST, token, Some(json!({})), &[]).await
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let api = HttpApi::new("https://fn.example/region/", RateLimiter::default());
        assert_eq!(api.endpoint_url(GET_ATMOSPHERE), "https://fn.example/region/getAtmosphere");
    }

    #[tokio::test]
    async fn rate_limited_calls_never_leave_the_process() {
        let api = HttpApi::new("http://127.0.0.1:9", RateLimiter::new(0, 0));
        let err = api.get_atmosphere(&Token::new("t")).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { ref endpoint } if endpoint == GET_ATMOSPHERE));
        assert_eq!(api.metrics().total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_and_shows_in_metrics() {
        let api = HttpApi::new("http://127.0.0.1:9", RateLimiter::default());
        assert_eq!(api.metrics().circuit, CircuitState::Closed);
        for _ in 0..BREAKER_THRESHOLD {
            api.breaker.record_failure(GET_ATMOSPHERE);
        }

        let err = api.export_garden(&Token::new("t")).await.unwrap_err();
        assert!(matches!(err, SyncError::BackendUnavailable { failures: 5, retry_in_secs: 60 }));
        let report = api.metrics();
        assert_eq!(report.circuit, CircuitState::Open { retry_in_secs: 60 });
        assert_eq!(report.consecutive_failures, BREAKER_THRESHOLD);
        assert_eq!(report.total_calls, 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é…");
    }

    #[test]
    fn response_shapes() {
        let p: PoeticRephrasing =
            serde_json::from_value(json!({"poeticVersion": "soft rain", "suggestion": "add a color"})).unwrap();
        assert_eq!(p.poetic_version, "soft rain");
        let a: InsightAudio = serde_json::from_value(json!({"audioUrl": "https://a/1.mp3"})).unwrap();
        assert_eq!(a.audio_url, "https://a/1.mp3");
        let atmo: AtmosphereData =
            serde_json::from_value(json!({"weather": "rainy", "backgroundColor": "#223344", "musicUrl": "m"})).unwrap();
        assert_eq!(atmo.background_color.as_deref(), Some("#223344"));
    }
}
