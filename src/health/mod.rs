//! Liveness probing for deployed services
//!
//! The deployed application is opaque; all the pipeline relies on is that it
//! answers `GET <path>` with a success status once it is up. Probing follows
//! container health-check semantics: wait out the start period, then make up
//! to `retries` attempts spaced by `interval`, each bounded by `timeout`.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Default liveness path
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Errors from a health probe
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("invalid health check URL '{0}'")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("service reported itself unhealthy: {0}")]
    Unhealthy(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("still unhealthy after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Probe schedule and target path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_HEALTH_PATH.to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            start_period: Duration::from_secs(5),
            retries: 3,
        }
    }
}

impl ProbeSettings {
    /// Defaults a container runtime applies to a bare `HEALTHCHECK CMD ...`
    pub fn container_defaults() -> Self {
        Self {
            start_period: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Join a base service URL with the probe path
    pub fn target_url(&self, base_url: &str) -> Result<String, HealthError> {
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(HealthError::InvalidUrl(base_url.to_string()));
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        Ok(format!("{}{}", base, path))
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub url: String,
    pub status_code: u16,
    pub attempts: u32,
    pub body: Option<serde_json::Value>,
    pub elapsed_ms: u64,
}

/// HTTP liveness probe
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    settings: ProbeSettings,
}

impl HealthProbe {
    pub fn new(settings: ProbeSettings) -> Result<Self, HealthError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| HealthError::Request(e.to_string()))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Issue a single probe request
    pub async fn check_once(&self, base_url: &str) -> Result<HealthReport, HealthError> {
        let url = self.settings.target_url(base_url)?;
        let started = Instant::now();

        let request = self.client.get(&url).send();
        let response = match timeout(self.settings.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(HealthError::Timeout(self.settings.timeout)),
            Ok(Err(e)) => return Err(HealthError::Request(e.to_string())),
            Err(_) => return Err(HealthError::Timeout(self.settings.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::Status(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| HealthError::Request(e.to_string()))?;
        let body = serde_json::from_str::<serde_json::Value>(&text).ok();

        if let Some(reported) = body
            .as_ref()
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
        {
            if reported.eq_ignore_ascii_case("unhealthy") {
                return Err(HealthError::Unhealthy(text));
            }
        }

        Ok(HealthReport {
            url,
            status_code: status.as_u16(),
            attempts: 1,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Wait for the service to become healthy following the probe schedule
    pub async fn wait_healthy(&self, base_url: &str) -> Result<HealthReport, HealthError> {
        // Reject malformed URLs before sitting through the start period
        self.settings.target_url(base_url)?;

        let started = Instant::now();
        if !self.settings.start_period.is_zero() {
            debug!("Waiting {:?} before first health probe", self.settings.start_period);
            sleep(self.settings.start_period).await;
        }

        let attempts = self.settings.retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.check_once(base_url).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    report.elapsed_ms = started.elapsed().as_millis() as u64;
                    info!("Health probe {} succeeded on attempt {}", report.url, attempt);
                    return Ok(report);
                }
                Err(e @ HealthError::InvalidUrl(_)) => return Err(e),
                Err(e) => {
                    warn!("Health probe attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                sleep(self.settings.interval).await;
            }
        }

        Err(HealthError::Exhausted {
            attempts,
            last: last_error,
        })
    }
}
