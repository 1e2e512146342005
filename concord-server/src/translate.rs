//! Translation API client behind a circuit breaker.
//!
//! The breaker has two states. It opens after N consecutive failures or N
//! consecutive latency-SLO violations, and only a manual `reset` closes it
//! again. While open, calls fail fast with `unavailable` — callers that
//! cannot wait (the voice path) fall back to the untranslated input.
//! Successful translations land in the shared LRU under `translate:` keys.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::cache::SharedCache;
use crate::config::TranslationConfig;
use crate::error::{Error, Result};

const FAILURE_THRESHOLD: u32 = 5;
const LATENCY_SLO: Duration = Duration::from_secs(2);
const RESULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    consecutive_slow: u32,
    open: bool,
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    latency_slo: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, latency_slo: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            failure_threshold,
            latency_slo,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if latency > self.latency_slo {
            state.consecutive_slow += 1;
            if state.consecutive_slow >= self.failure_threshold {
                state.open = true;
                tracing::warn!("translation breaker opened: latency SLO violations");
            }
        } else {
            state.consecutive_slow = 0;
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_slow = 0;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.open = true;
            tracing::warn!("translation breaker opened: consecutive failures");
        }
    }

    /// Manual close; counters start over.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
    }
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translated_text: String,
}

pub struct TranslationClient {
    http: reqwest::Client,
    config: TranslationConfig,
    breaker: CircuitBreaker,
    cache: Arc<SharedCache>,
}

impl TranslationClient {
    pub fn new(config: TranslationConfig, cache: Arc<SharedCache>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            breaker: CircuitBreaker::new(FAILURE_THRESHOLD, LATENCY_SLO),
            cache,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn translate(&self, text: &str, target_lang: &str) -> Result<String> {
        if self.config.api_url.is_empty() {
            return Err(Error::Unavailable("translation is not configured".into()));
        }
        let key = cache_key(text, target_lang);
        if let Some(hit) = self.cache.get_as::<String>(&key) {
            return Ok(hit);
        }
        if self.breaker.is_open() {
            return Err(Error::Unavailable("translation circuit is open".into()));
        }

        let started = Instant::now();
        let response = self
            .http
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&serde_json::json!({ "q": text, "target": target_lang }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        let body = match response {
            Ok(resp) => resp.json::<TranslateResponse>().await,
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!("translation request failed: {e}");
                return Err(Error::Unavailable("translation backend failed".into()));
            }
        };
        match body {
            Ok(out) => {
                self.breaker.record_success(started.elapsed());
                self.cache.set_as(key, &out.translated_text, RESULT_TTL);
                Ok(out.translated_text)
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!("translation decode failed: {e}");
                Err(Error::Unavailable("translation backend failed".into()))
            }
        }
    }
}

fn cache_key(text: &str, target_lang: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("translate:{target_lang}:{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let b = CircuitBreaker::new(3, Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        assert!(!b.is_open());
        b.record_failure();
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new(3, Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        b.record_success(Duration::from_millis(10));
        b.record_failure();
        b.record_failure();
        assert!(!b.is_open(), "streak must restart after a success");
    }

    #[test]
    fn opens_after_consecutive_slo_violations() {
        let b = CircuitBreaker::new(3, Duration::from_millis(100));
        for _ in 0..3 {
            b.record_success(Duration::from_millis(500));
        }
        assert!(b.is_open());
    }

    #[test]
    fn fast_success_resets_slow_streak() {
        let b = CircuitBreaker::new(3, Duration::from_millis(100));
        b.record_success(Duration::from_millis(500));
        b.record_success(Duration::from_millis(500));
        b.record_success(Duration::from_millis(10));
        b.record_success(Duration::from_millis(500));
        assert!(!b.is_open());
    }

    #[test]
    fn reset_is_manual() {
        let b = CircuitBreaker::new(1, Duration::from_secs(1));
        b.record_failure();
        assert!(b.is_open());
        // Successes do not close an open breaker.
        b.record_success(Duration::from_millis(1));
        assert!(b.is_open());
        b.reset();
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn unconfigured_client_fails_fast() {
        let client = TranslationClient::new(
            TranslationConfig::default(),
            Arc::new(SharedCache::new(16)),
        );
        assert!(matches!(
            client.translate("hola", "en").await,
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_before_network() {
        let client = TranslationClient::new(
            TranslationConfig {
                api_url: "http://127.0.0.1:1/translate".into(),
                api_key: String::new(),
            },
            Arc::new(SharedCache::new(16)),
        );
        for _ in 0..FAILURE_THRESHOLD {
            client.breaker().record_failure();
        }
        assert!(matches!(
            client.translate("hola", "en").await,
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn cache_keys_separate_languages() {
        assert_ne!(cache_key("hi", "fr"), cache_key("hi", "de"));
        assert_eq!(cache_key("hi", "fr"), cache_key("hi", "fr"));
    }
}
