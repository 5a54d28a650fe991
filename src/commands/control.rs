use crate::backend::{post_action, ActionResponse, BackendEndpoints};
use crate::error::ClientError;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    EmergencyStop,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    fn url(self, endpoints: &BackendEndpoints) -> &Url {
        match self {
            Self::Start => &endpoints.start,
            Self::Stop => &endpoints.stop,
            Self::EmergencyStop => &endpoints.emergency_stop,
        }
    }
}

/// User-triggered backend actions. Each call retries with a linear delay and
/// surfaces `ActionFailed` once attempts run out.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    endpoints: BackendEndpoints,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ControlClient {
    pub fn new(
        http: Client,
        endpoints: BackendEndpoints,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            http,
            endpoints,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub async fn start(&self) -> Result<ActionResponse, ClientError> {
        self.run(ControlAction::Start).await
    }

    pub async fn stop(&self) -> Result<ActionResponse, ClientError> {
        self.run(ControlAction::Stop).await
    }

    /// Sent to the orchestrator, which cancels open orders and flattens
    /// positions.
    pub async fn emergency_stop(&self) -> Result<ActionResponse, ClientError> {
        self.run(ControlAction::EmergencyStop).await
    }

    pub async fn run(&self, action: ControlAction) -> Result<ActionResponse, ClientError> {
        let url = action.url(&self.endpoints);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            match post_action(&self.http, url).await {
                Ok(response) => {
                    info!(action = action.as_str(), attempt, status = %response.status, "backend action accepted");
                    return Ok(response);
                }
                Err(error) => {
                    let retryable = is_retryable(&error);
                    warn!(
                        action = action.as_str(),
                        attempt,
                        max_attempts = self.max_attempts,
                        retryable,
                        error = %error,
                        "backend action failed"
                    );

                    if !retryable || attempt >= self.max_attempts {
                        return Err(ClientError::ActionFailed {
                            action: action.as_str(),
                            attempts: attempt,
                            reason: error.to_string(),
                        });
                    }
                }
            }

            tokio::time::sleep(self.retry_delay.saturating_mul(attempt)).await;
        }
    }
}

/// Client errors (4xx) will not change on retry.
fn is_retryable(error: &ClientError) -> bool {
    match error {
        ClientError::Reqwest(error) => !error
            .status()
            .is_some_and(|status| status.is_client_error()),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn control(server: &MockServer, max_attempts: u32) -> ControlClient {
        let base = Url::parse(&server.base_url()).expect("valid url");
        let endpoint = |path: &str| crate::backend::endpoint(&base, path).expect("valid endpoint");
        let endpoints = BackendEndpoints {
            health: endpoint("/healthz"),
            snapshot: endpoint("/dashboard"),
            start: endpoint("/start"),
            stop: endpoint("/stop"),
            emergency_stop: endpoint("/emergency_stop"),
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("client should build");
        ControlClient::new(http, endpoints, max_attempts, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn start_returns_backend_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/start");
                then.status(200).json_body(json!({"status": "started"}));
            })
            .await;

        let response = control(&server, 3).start().await.expect("start should succeed");

        assert_eq!(response.status, "started");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/emergency_stop");
                then.status(502);
            })
            .await;

        let result = control(&server, 3).emergency_stop().await;

        match result {
            Err(ClientError::ActionFailed {
                action, attempts, ..
            }) => {
                assert_eq!(action, "emergency_stop");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ActionFailed, got {other:?}"),
        }
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/stop");
                then.status(403);
            })
            .await;

        let result = control(&server, 5).stop().await;

        assert!(matches!(
            result,
            Err(ClientError::ActionFailed { attempts: 1, .. })
        ));
        assert_eq!(mock.hits_async().await, 1);
    }
}
