use crate::backend::{fetch_health, BackendHealth};
use crate::db;
use crate::live::types::ConnectionState;
use reqwest::Client;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connection: ConnectionState,
    /// `None` when `/healthz` could not be reached.
    pub backend: Option<BackendHealth>,
    pub cache: &'static str,
}

pub async fn build_health_report(
    started_at: Instant,
    http: &Client,
    health_url: &Url,
    connection: ConnectionState,
    cache_pool: Option<&SqlitePool>,
) -> HealthReport {
    let backend = match fetch_health(http, health_url).await {
        Ok(health) => Some(health),
        Err(error) => {
            warn!(url = %health_url, error = %error, "backend health check failed");
            None
        }
    };

    let cache = match cache_pool {
        Some(pool) if db::ping(pool).await => "ok",
        Some(_) => "error",
        None => "disabled",
    };

    let status = match (&backend, connection) {
        (Some(health), ConnectionState::Open) if health.running => "ok",
        (Some(_), _) => "degraded",
        (None, _) => "unreachable",
    };

    HealthReport {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        connection,
        backend,
        cache,
    }
}
