use crate::backend::fetch_snapshot_bytes;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// One successfully fetched snapshot body. `generation` identifies the
/// start/stop cycle that produced it so late deliveries can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub generation: u64,
    pub payload: Vec<u8>,
}

struct PollHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// HTTP pull used while the websocket is unavailable. At most one request is
/// in flight: the next tick is only awaited after the previous fetch settles.
pub struct PollFallback {
    client: Client,
    snapshot_url: Url,
    results_tx: mpsc::UnboundedSender<PollResult>,
    generation: u64,
    active: Option<PollHandle>,
}

impl PollFallback {
    pub fn new(
        client: Client,
        snapshot_url: Url,
        results_tx: mpsc::UnboundedSender<PollResult>,
    ) -> Self {
        Self {
            client,
            snapshot_url,
            results_tx,
            generation: 0,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// True when `result` belongs to the currently running cycle.
    pub fn accepts(&self, result: &PollResult) -> bool {
        self.is_active() && result.generation == self.generation
    }

    /// Starts polling. Returns false if already running.
    pub fn start(&mut self, interval: Duration) -> bool {
        if self.active.is_some() {
            return false;
        }

        self.generation = self.generation.wrapping_add(1);
        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let client = self.client.clone();
        let url = self.snapshot_url.clone();
        let results_tx = self.results_tx.clone();
        let generation = self.generation;

        info!(interval_ms = interval.as_millis() as u64, "starting snapshot poll fallback");
        let join_handle = tokio::spawn(async move {
            run_poll_loop(client, url, interval, generation, results_tx, task_token).await;
        });

        self.active = Some(PollHandle {
            cancellation_token,
            join_handle,
        });
        true
    }

    /// Stops polling and drops any in-flight request. Returns false when it
    /// was not running.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.active.take() else {
            return false;
        };
        handle.cancellation_token.cancel();
        handle.join_handle.abort();
        info!("stopped snapshot poll fallback");
        true
    }
}

impl Drop for PollFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_poll_loop(
    client: Client,
    url: Url,
    interval: Duration,
    generation: u64,
    results_tx: mpsc::UnboundedSender<PollResult>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = fetch_snapshot_bytes(&client, &url) => result,
        };

        match fetched {
            Ok(payload) => {
                if cancel_token.is_cancelled() {
                    break;
                }
                if results_tx.send(PollResult { generation, payload }).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(url = %url, error = %error, "snapshot poll failed; keeping last state");
            }
        }
    }

    debug!(generation, "poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;

    fn fallback(server: &MockServer) -> (PollFallback, mpsc::UnboundedReceiver<PollResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let url = Url::parse(&server.url("/dashboard")).expect("valid url");
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client should build");
        (PollFallback::new(client, url, results_tx), results_rx)
    }

    #[tokio::test]
    async fn delivers_snapshot_bodies_tagged_with_generation() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard");
                then.status(200).json_body(json!({"portfolio_value": 10}));
            })
            .await;

        let (mut poller, mut results) = fallback(&server);
        assert!(poller.start(Duration::from_millis(20)));
        assert!(!poller.start(Duration::from_millis(20)));

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("poll should deliver")
            .expect("channel open");
        assert_eq!(result.generation, 1);
        assert!(poller.accepts(&result));
        let body: serde_json::Value =
            serde_json::from_slice(&result.payload).expect("body is json");
        assert_eq!(body["portfolio_value"], 10);

        assert!(poller.stop());
        assert!(!poller.stop());
        assert!(!poller.accepts(&result));
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_loop() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard");
                then.status(500);
            })
            .await;

        let (mut poller, mut results) = fallback(&server);
        poller.start(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(failing.hits_async().await >= 2);
        assert!(poller.is_active());
        assert!(results.try_recv().is_err());
        poller.stop();
    }

    #[tokio::test]
    async fn never_overlaps_requests() {
        let server = MockServer::start_async().await;
        let slow = server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard");
                then.status(200)
                    .delay(Duration::from_millis(200))
                    .json_body(json!({"total_pnl": 1}));
            })
            .await;

        let (mut poller, _results) = fallback(&server);
        poller.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(700)).await;
        poller.stop();

        let hits = slow.hits_async().await;
        assert!(hits >= 1);
        assert!(hits <= 5, "expected sequential polls, saw {hits} requests");
    }

    #[tokio::test]
    async fn stop_discards_in_flight_request() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard");
                then.status(200)
                    .delay(Duration::from_millis(300))
                    .json_body(json!({"total_pnl": 1}));
            })
            .await;

        let (mut poller, mut results) = fallback(&server);
        poller.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(results.try_recv().is_err());
    }
}
