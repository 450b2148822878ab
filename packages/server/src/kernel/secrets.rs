//! Remote secrets with a three-state circuit breaker and an on-disk
//! fallback cache.
//!
//! The live source sits behind [`SecretsFetcher`]; the production
//! implementation talks to Doppler over HTTPS. While the circuit is open no
//! live fetches happen at all — callers read the cache, which is a JSON
//! object written atomically (temp file + rename).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use super::config::DopplerSettings;
use super::failure::JobFailure;

const CACHE_TTL_MINUTES: i64 = 5;
const FETCH_TIMEOUT_SECS: u64 = 10;
const NO_FALLBACK_CACHE: &str = "no-fallback-cache";

pub type SecretMap = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct BreakerConfig {
    #[builder(default = 3)]
    pub failure_threshold: u32,
    #[builder(default = 2)]
    pub success_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    #[builder(default = 5_000)]
    pub timeout_ms: u64,
    #[builder(default = 1_000)]
    pub base_delay_ms: u64,
    #[builder(default = 2.0)]
    pub backoff_multiplier: f64,
    #[builder(default = 10_000)]
    pub max_backoff_ms: u64,
    #[builder(setter(into))]
    pub cache_file: PathBuf,
}

impl BreakerConfig {
    pub fn from_settings(settings: &DopplerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout_ms: settings.timeout_ms,
            base_delay_ms: settings.base_delay_ms,
            backoff_multiplier: settings.backoff_multiplier,
            max_backoff_ms: settings.max_backoff_ms,
            cache_file: settings.cache_dir.join("secrets.json"),
        }
    }
}

#[async_trait::async_trait]
pub trait SecretsFetcher: Send + Sync {
    async fn fetch(&self) -> Result<SecretMap, JobFailure>;
}

/// Live fetcher against the Doppler secrets download endpoint.
pub struct DopplerFetcher {
    client: reqwest::Client,
    token: String,
}

impl DopplerFetcher {
    pub fn new(token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretsFetcher for DopplerFetcher {
    async fn fetch(&self) -> Result<SecretMap, JobFailure> {
        let response = self
            .client
            .get("https://api.doppler.com/v3/configs/config/secrets/download")
            .query(&[("format", "json")])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| JobFailure::new(format!("doppler request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(
                JobFailure::new(format!("doppler returned {status}")).with_http_status(status.as_u16())
            );
        }
        response
            .json::<SecretMap>()
            .await
            .map_err(|e| JobFailure::new(format!("doppler payload was malformed: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BreakerMetrics {
    pub total_requests: u64,
    pub live_successes: u64,
    pub live_failures: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub circuit_state: CircuitState,
    pub healthy: bool,
    pub using_fallback: bool,
    pub failure_count: u32,
    pub current_backoff_ms: u64,
    pub cache_loaded_at: Option<DateTime<Utc>>,
    pub metrics: BreakerMetrics,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<DateTime<Utc>>,
    current_backoff_ms: u64,
    cache: Option<SecretMap>,
    cache_loaded_at: Option<DateTime<Utc>>,
    metrics: BreakerMetrics,
}

pub struct SecretsBreaker {
    config: BreakerConfig,
    fetcher: Arc<dyn SecretsFetcher>,
    inner: Mutex<BreakerInner>,
}

impl SecretsBreaker {
    pub fn new(config: BreakerConfig, fetcher: Arc<dyn SecretsFetcher>) -> Self {
        let current_backoff_ms = config.base_delay_ms;
        Self {
            config,
            fetcher,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                current_backoff_ms,
                cache: None,
                cache_loaded_at: None,
                metrics: BreakerMetrics::default(),
            }),
        }
    }

    /// Fetch secrets through the breaker. Always yields a value or fails
    /// with `no-fallback-cache` when the live source and the cache are both
    /// unavailable.
    pub async fn get_secrets(&self) -> Result<SecretMap, JobFailure> {
        let mut inner = self.inner.lock().await;
        inner.metrics.total_requests += 1;

        match inner.state {
            CircuitState::Closed => self.attempt_live(&mut inner).await,
            CircuitState::Open => {
                let elapsed_ms = inner
                    .opened_at
                    .map(|t| (Utc::now() - t).num_milliseconds())
                    .unwrap_or(i64::MAX);
                if elapsed_ms >= self.config.timeout_ms as i64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!("secrets circuit half-open; probing live source");
                    self.attempt_live(&mut inner).await
                } else {
                    self.serve_cache(&mut inner).await
                }
            }
            CircuitState::HalfOpen => self.attempt_live(&mut inner).await,
        }
    }

    async fn attempt_live(&self, inner: &mut BreakerInner) -> Result<SecretMap, JobFailure> {
        match self.fetcher.fetch().await {
            Ok(secrets) => {
                inner.metrics.live_successes += 1;
                match inner.state {
                    CircuitState::HalfOpen => {
                        inner.success_count += 1;
                        if inner.success_count >= self.config.success_threshold {
                            inner.state = CircuitState::Closed;
                            inner.failure_count = 0;
                            inner.success_count = 0;
                            inner.opened_at = None;
                            inner.current_backoff_ms = self.config.base_delay_ms;
                            info!("secrets circuit closed after successful probes");
                        }
                    }
                    _ => {
                        inner.failure_count = 0;
                        inner.current_backoff_ms = self.config.base_delay_ms;
                    }
                }
                inner.cache = Some(secrets.clone());
                inner.cache_loaded_at = Some(Utc::now());
                self.write_cache(&secrets).await;
                Ok(secrets)
            }
            Err(e) => {
                inner.metrics.live_failures += 1;
                match inner.state {
                    CircuitState::HalfOpen => {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Utc::now());
                        inner.success_count = 0;
                        warn!(error = %e, "secrets probe failed; circuit re-opened");
                    }
                    _ => {
                        inner.failure_count += 1;
                        inner.current_backoff_ms = next_backoff(
                            self.config.base_delay_ms,
                            self.config.backoff_multiplier,
                            inner.failure_count,
                            self.config.max_backoff_ms,
                        );
                        if inner.failure_count >= self.config.failure_threshold {
                            inner.state = CircuitState::Open;
                            inner.opened_at = Some(Utc::now());
                            warn!(
                                failures = inner.failure_count,
                                "secrets circuit opened; serving from cache"
                            );
                        }
                    }
                }
                self.serve_cache(inner).await
            }
        }
    }

    async fn serve_cache(&self, inner: &mut BreakerInner) -> Result<SecretMap, JobFailure> {
        let stale = match inner.cache_loaded_at {
            Some(loaded) => Utc::now() - loaded > Duration::minutes(CACHE_TTL_MINUTES),
            None => true,
        };
        if inner.cache.is_none() || stale {
            match tokio::fs::read_to_string(&self.config.cache_file).await {
                Ok(raw) => match serde_json::from_str::<SecretMap>(&raw) {
                    Ok(map) => {
                        inner.cache = Some(map);
                        inner.cache_loaded_at = Some(Utc::now());
                    }
                    Err(e) => warn!(error = %e, "secrets cache file was malformed"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "reading secrets cache failed"),
            }
        }

        match &inner.cache {
            Some(map) => {
                inner.metrics.cache_hits += 1;
                Ok(map.clone())
            }
            None => Err(JobFailure::new(
                "no secrets available: live fetch failed and no fallback cache exists",
            )
            .with_code(NO_FALLBACK_CACHE)),
        }
    }

    /// Atomic cache replace: write a temp file, then rename over the target.
    async fn write_cache(&self, secrets: &SecretMap) {
        let path = &self.config.cache_file;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    warn!(error = %e, "creating secrets cache directory failed");
                    return;
                }
            }
        }
        let body = match serde_json::to_vec_pretty(secrets) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "serialising secrets cache failed");
                return;
            }
        };
        let temp = path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&temp, body).await {
            warn!(error = %e, "writing secrets cache failed");
            return;
        }
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            warn!(error = %e, "replacing secrets cache failed");
        }
    }

    pub async fn health(&self) -> BreakerHealth {
        let inner = self.inner.lock().await;
        BreakerHealth {
            circuit_state: inner.state,
            healthy: inner.state == CircuitState::Closed,
            using_fallback: inner.state != CircuitState::Closed,
            failure_count: inner.failure_count,
            current_backoff_ms: inner.current_backoff_ms,
            cache_loaded_at: inner.cache_loaded_at,
            metrics: inner.metrics,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

fn next_backoff(base_ms: u64, multiplier: f64, failures: u32, max_ms: u64) -> u64 {
    let factor = multiplier.powi(failures.min(32) as i32);
    ((base_ms as f64) * factor).min(max_ms as f64) as u64
}
