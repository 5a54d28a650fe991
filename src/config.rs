use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_BASE_URL: &str = "https://trading-dashboard-backend.fly.dev";
pub const DEFAULT_WS_PATH: &str = "/ws/dashboard";
pub const DEFAULT_SNAPSHOT_PATH: &str = "/dashboard";
pub const ALTERNATE_SNAPSHOT_PATH: &str = "/api/state";
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 1_000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_FALLBACK_RECONNECT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEALTHY_SESSION_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TRADE_CAPACITY: usize = 50;
pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_PORTFOLIO_HISTORY_CAPACITY: usize = 500;
pub const DEFAULT_ACTION_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ACTION_RETRY_DELAY_MS: u64 = 500;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const MAX_ACTION_ATTEMPTS: u32 = 10;
pub const MAX_PRIVACY_DELAY_MINUTES: u64 = 24 * 60;
pub const MAX_RETENTION_CAPACITY: usize = 10_000;

const ENV_API_BASE_URL: &str = "DASHBOARD_API_BASE_URL";
const ENV_WS_URL: &str = "DASHBOARD_WS_URL";
const ENV_ORCHESTRATOR_URL: &str = "DASHBOARD_ORCHESTRATOR_URL";
const ENV_WS_TOKEN: &str = "DASHBOARD_WS_TOKEN";
const ENV_SNAPSHOT_PATH: &str = "DASHBOARD_SNAPSHOT_PATH";
const ENV_CACHE_PATH: &str = "DASHBOARD_CACHE_PATH";
const ENV_PRIVACY_DELAY_MINUTES: &str = "DASHBOARD_PRIVACY_DELAY_MINUTES";

/// Reconnect schedule for the websocket transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    /// Consecutive failures after which polling takes over.
    pub failure_threshold: u32,
    /// Fixed cadence used once the failure threshold has been crossed.
    pub fallback_interval: Duration,
    /// A session that stayed open this long resets the failure counter.
    pub healthy_session: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            jitter: Duration::from_millis(DEFAULT_RECONNECT_JITTER_MS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            fallback_interval: Duration::from_millis(DEFAULT_FALLBACK_RECONNECT_INTERVAL_MS),
            healthy_session: Duration::from_millis(DEFAULT_HEALTHY_SESSION_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    pub trades: usize,
    pub logs: usize,
    pub portfolio_history: usize,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            trades: DEFAULT_TRADE_CAPACITY,
            logs: DEFAULT_LOG_CAPACITY,
            portfolio_history: DEFAULT_PORTFOLIO_HISTORY_CAPACITY,
        }
    }
}

/// Resolved client configuration. Built once at startup and handed to the
/// client; nothing inside the client re-reads the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub http_base_url: Url,
    pub ws_url: Url,
    pub orchestrator_url: Url,
    pub auth_token: Option<String>,
    pub snapshot_path: String,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub retention: RetentionLimits,
    pub action_max_attempts: u32,
    pub action_retry_delay: Duration,
    pub cache_path: Option<PathBuf>,
    pub privacy_delay: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigArgs {
    pub http_base_url: Option<String>,
    pub ws_url: Option<String>,
    pub orchestrator_url: Option<String>,
    pub auth_token: Option<String>,
    pub snapshot_path: Option<String>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub reconnect_multiplier: Option<f64>,
    pub reconnect_jitter_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub fallback_reconnect_interval_ms: Option<u64>,
    pub healthy_session_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub trade_capacity: Option<usize>,
    pub log_capacity: Option<usize>,
    pub portfolio_history_capacity: Option<usize>,
    pub action_max_attempts: Option<u32>,
    pub action_retry_delay_ms: Option<u64>,
    pub cache_path: Option<PathBuf>,
    pub privacy_delay_minutes: Option<u64>,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() {
        return Err(ClientError::InvalidArgument(format!(
            "{field} must be an absolute url"
        )));
    }
    Ok(url)
}

/// Maps an http(s) base url onto the matching ws(s) dashboard stream url.
pub fn derive_ws_url(http_base_url: &Url) -> Result<Url, ClientError> {
    let scheme = match http_base_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ClientError::InvalidArgument(format!(
                "unsupported base url scheme '{other}'"
            )))
        }
    };
    let mut ws_url = http_base_url.join(DEFAULT_WS_PATH)?;
    ws_url.set_scheme(scheme).map_err(|_| {
        ClientError::InvalidArgument(format!("cannot switch base url to scheme '{scheme}'"))
    })?;
    Ok(ws_url)
}

fn positive_ms(field: &str, value: u64) -> Result<Duration, ClientError> {
    if value == 0 {
        return Err(ClientError::InvalidArgument(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(Duration::from_millis(value))
}

fn capacity(field: &str, value: usize) -> Result<usize, ClientError> {
    if !(1..=MAX_RETENTION_CAPACITY).contains(&value) {
        return Err(ClientError::InvalidArgument(format!(
            "{field} must be between 1 and {MAX_RETENTION_CAPACITY}"
        )));
    }
    Ok(value)
}

impl ClientConfigArgs {
    /// Reads the deployment overrides from the process environment.
    pub fn from_env() -> Result<Self, ClientError> {
        let privacy_delay_minutes = match env_value(ENV_PRIVACY_DELAY_MINUTES) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ClientError::InvalidArgument(format!(
                    "{ENV_PRIVACY_DELAY_MINUTES} must be a whole number of minutes"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            http_base_url: env_value(ENV_API_BASE_URL),
            ws_url: env_value(ENV_WS_URL),
            orchestrator_url: env_value(ENV_ORCHESTRATOR_URL),
            auth_token: env_value(ENV_WS_TOKEN),
            snapshot_path: env_value(ENV_SNAPSHOT_PATH),
            cache_path: env_value(ENV_CACHE_PATH).map(PathBuf::from),
            privacy_delay_minutes,
            ..Self::default()
        })
    }

    pub fn normalize(self) -> Result<ClientConfig, ClientError> {
        let http_base_url = parse_url(
            "httpBaseUrl",
            self.http_base_url
                .as_deref()
                .unwrap_or(DEFAULT_HTTP_BASE_URL),
        )?;
        if !matches!(http_base_url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidArgument(
                "httpBaseUrl must use http or https".to_string(),
            ));
        }

        let ws_url = match self.ws_url.as_deref() {
            Some(raw) => parse_url("wsUrl", raw)?,
            None => derive_ws_url(&http_base_url)?,
        };
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidArgument(
                "wsUrl must use ws or wss".to_string(),
            ));
        }

        let orchestrator_url = match self.orchestrator_url.as_deref() {
            Some(raw) => parse_url("orchestratorUrl", raw)?,
            None => http_base_url.clone(),
        };

        let auth_token = self
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        let snapshot_path = self
            .snapshot_path
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_PATH.to_string())
            .trim()
            .to_string();
        if !snapshot_path.starts_with('/') {
            return Err(ClientError::InvalidArgument(
                "snapshotPath must start with '/'".to_string(),
            ));
        }

        let multiplier = self
            .reconnect_multiplier
            .unwrap_or(DEFAULT_RECONNECT_MULTIPLIER);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ClientError::InvalidArgument(
                "reconnectMultiplier must be a finite number >= 1".to_string(),
            ));
        }

        let base_delay = positive_ms(
            "reconnectBaseDelayMs",
            self.reconnect_base_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
        )?;
        let max_delay = positive_ms(
            "reconnectMaxDelayMs",
            self.reconnect_max_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
        )?;
        if max_delay < base_delay {
            return Err(ClientError::InvalidArgument(
                "reconnectMaxDelayMs must be >= reconnectBaseDelayMs".to_string(),
            ));
        }

        let failure_threshold = self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if failure_threshold == 0 {
            return Err(ClientError::InvalidArgument(
                "failureThreshold must be at least 1".to_string(),
            ));
        }

        let reconnect = ReconnectPolicy {
            base_delay,
            max_delay,
            multiplier,
            jitter: Duration::from_millis(
                self.reconnect_jitter_ms.unwrap_or(DEFAULT_RECONNECT_JITTER_MS),
            ),
            failure_threshold,
            fallback_interval: positive_ms(
                "fallbackReconnectIntervalMs",
                self.fallback_reconnect_interval_ms
                    .unwrap_or(DEFAULT_FALLBACK_RECONNECT_INTERVAL_MS),
            )?,
            healthy_session: positive_ms(
                "healthySessionMs",
                self.healthy_session_ms.unwrap_or(DEFAULT_HEALTHY_SESSION_MS),
            )?,
        };

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(ClientError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let request_timeout = positive_ms(
            "requestTimeoutMs",
            self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        )?;

        let retention = RetentionLimits {
            trades: capacity(
                "tradeCapacity",
                self.trade_capacity.unwrap_or(DEFAULT_TRADE_CAPACITY),
            )?,
            logs: capacity(
                "logCapacity",
                self.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY),
            )?,
            portfolio_history: capacity(
                "portfolioHistoryCapacity",
                self.portfolio_history_capacity
                    .unwrap_or(DEFAULT_PORTFOLIO_HISTORY_CAPACITY),
            )?,
        };

        let action_max_attempts = self
            .action_max_attempts
            .unwrap_or(DEFAULT_ACTION_MAX_ATTEMPTS);
        if !(1..=MAX_ACTION_ATTEMPTS).contains(&action_max_attempts) {
            return Err(ClientError::InvalidArgument(format!(
                "actionMaxAttempts must be between 1 and {MAX_ACTION_ATTEMPTS}"
            )));
        }

        let privacy_delay = match self.privacy_delay_minutes {
            Some(0) | None => None,
            Some(minutes) if minutes <= MAX_PRIVACY_DELAY_MINUTES => {
                Some(Duration::from_secs(minutes * 60))
            }
            Some(_) => {
                return Err(ClientError::InvalidArgument(format!(
                    "privacyDelayMinutes must be at most {MAX_PRIVACY_DELAY_MINUTES}"
                )))
            }
        };

        Ok(ClientConfig {
            http_base_url,
            ws_url,
            orchestrator_url,
            auth_token,
            snapshot_path,
            reconnect,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout,
            retention,
            action_max_attempts,
            action_retry_delay: Duration::from_millis(
                self.action_retry_delay_ms
                    .unwrap_or(DEFAULT_ACTION_RETRY_DELAY_MS),
            ),
            cache_path: self.cache_path,
            privacy_delay,
        })
    }
}
