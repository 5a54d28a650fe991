#![allow(dead_code)]

use dashboard_live_client::{CanonicalState, ClientConfig, ClientConfigArgs};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const WAIT: Duration = Duration::from_secs(10);

/// Local dashboard websocket. The first `reject_first` connections are
/// dropped before the handshake; later ones receive `frames` and stay open.
pub struct MockDashboardStream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl MockDashboardStream {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/dashboard", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn spawn_ws_server(reject_first: usize, frames: Vec<String>) -> MockDashboardStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
    let addr = listener.local_addr().expect("ws addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            if seen < reject_first {
                drop(stream);
                continue;
            }

            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut writer, mut reader) = ws.split();
                for frame in frames {
                    if writer.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                while let Some(Ok(message)) = reader.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            });
        }
    });

    MockDashboardStream { addr, connections }
}

/// Port nothing listens on.
pub fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

pub fn fast_config(ws_url: &str, http_base_url: &str) -> ClientConfigArgs {
    ClientConfigArgs {
        http_base_url: Some(http_base_url.to_string()),
        ws_url: Some(ws_url.to_string()),
        reconnect_base_delay_ms: Some(20),
        reconnect_max_delay_ms: Some(50),
        reconnect_jitter_ms: Some(0),
        failure_threshold: Some(3),
        fallback_reconnect_interval_ms: Some(400),
        poll_interval_ms: Some(50),
        request_timeout_ms: Some(2_000),
        ..ClientConfigArgs::default()
    }
}

pub fn build(args: ClientConfigArgs) -> ClientConfig {
    args.normalize().expect("test config should be valid")
}

pub async fn wait_for_state<F>(
    updates: &mut watch::Receiver<CanonicalState>,
    predicate: F,
) -> CanonicalState
where
    F: FnMut(&CanonicalState) -> bool,
{
    let state = tokio::time::timeout(WAIT, updates.wait_for(predicate))
        .await
        .expect("state should reach the expected shape in time")
        .expect("state channel should stay open");
    (*state).clone()
}
