use crate::config::ClientConfig;
use crate::error::ClientError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const HEALTH_PATH: &str = "/healthz";
const START_PATH: &str = "/start";
const STOP_PATH: &str = "/stop";
const EMERGENCY_STOP_PATH: &str = "/emergency_stop";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    #[serde(default)]
    pub running: bool,
    #[serde(default, alias = "paper_trading")]
    pub paper_trading: bool,
    #[serde(default, alias = "last_error")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub status: String,
}

/// Fully resolved backend urls.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEndpoints {
    pub health: Url,
    pub snapshot: Url,
    pub start: Url,
    pub stop: Url,
    pub emergency_stop: Url,
}

impl BackendEndpoints {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            health: endpoint(&config.http_base_url, HEALTH_PATH)?,
            snapshot: endpoint(&config.http_base_url, &config.snapshot_path)?,
            start: endpoint(&config.http_base_url, START_PATH)?,
            stop: endpoint(&config.http_base_url, STOP_PATH)?,
            emergency_stop: endpoint(&config.orchestrator_url, EMERGENCY_STOP_PATH)?,
        })
    }
}

/// Appends `path` to `base`, keeping any path prefix the base already has.
pub fn endpoint(base: &Url, path: &str) -> Result<Url, ClientError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}

pub fn build_http_client(request_timeout: Duration) -> Result<Client, ClientError> {
    Ok(Client::builder().timeout(request_timeout).build()?)
}

pub async fn fetch_health(client: &Client, url: &Url) -> Result<BackendHealth, ClientError> {
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    Ok(response.json::<BackendHealth>().await?)
}

/// Raw snapshot body; classification is left to the normalizer.
pub async fn fetch_snapshot_bytes(client: &Client, url: &Url) -> Result<Vec<u8>, ClientError> {
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

pub async fn post_action(client: &Client, url: &Url) -> Result<ActionResponse, ClientError> {
    let response = client.post(url.clone()).send().await?.error_for_status()?;
    Ok(response.json::<ActionResponse>().await?)
}
