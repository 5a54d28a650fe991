use crate::config::ReconnectPolicy;
use crate::error::ClientError;
use futures_util::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub type DashboardWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    Error(String),
    /// Consecutive failures crossed the threshold; sent once per crossing.
    FallbackRequested,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub delay: Duration,
    pub activate_fallback: bool,
}

/// Reconnect bookkeeping. `attempt` drives the exponential schedule and
/// resets on open; `consecutive_failures` only resets after a healthy session.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempt: u32,
    consecutive_failures: u32,
    fallback_active: bool,
}

impl ReconnectState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    /// Returns true when polling had been requested and should now stop.
    pub fn on_open(&mut self) -> bool {
        self.attempt = 0;
        std::mem::take(&mut self.fallback_active)
    }

    /// `session` is how long the closed connection stayed open, `None` when
    /// the connect itself failed.
    pub fn on_close(
        &mut self,
        policy: &ReconnectPolicy,
        session: Option<Duration>,
        jitter: Duration,
    ) -> ReconnectPlan {
        if session.is_some_and(|length| length >= policy.healthy_session) {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let over_threshold = self.consecutive_failures >= policy.failure_threshold;
        let activate_fallback = over_threshold && !self.fallback_active;
        if activate_fallback {
            self.fallback_active = true;
        }

        let delay = if over_threshold {
            policy.fallback_interval
        } else {
            backoff_delay(policy, self.attempt).saturating_add(jitter)
        };
        self.attempt = self.attempt.saturating_add(1);

        ReconnectPlan {
            delay,
            activate_fallback,
        }
    }
}

/// `min(max_delay, base_delay * multiplier^attempt)`, without jitter.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base_ms = policy.base_delay.as_millis() as f64;
    let max_ms = policy.max_delay.as_millis() as f64;
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let scaled = base_ms * policy.multiplier.powi(exponent);
    let bounded = if scaled.is_finite() {
        scaled.min(max_ms)
    } else {
        max_ms
    };
    Duration::from_millis(bounded.round() as u64)
}

pub fn sample_jitter(policy: &ReconnectPolicy) -> Duration {
    let window_ms = policy.jitter.as_millis().min(u64::MAX as u128) as u64;
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=window_ms))
}

/// Appends the auth token as the `token` query parameter.
pub fn stream_endpoint(ws_url: &Url, auth_token: Option<&str>) -> Url {
    let mut endpoint = ws_url.clone();
    if let Some(token) = auth_token {
        endpoint.query_pairs_mut().append_pair("token", token);
    }
    endpoint
}

pub async fn connect_dashboard_stream(
    endpoint: &Url,
    connect_timeout: Duration,
) -> Result<DashboardWsStream, ClientError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let connect = connect_async_with_config(endpoint.as_str(), Some(ws_config), true);
    let (stream, _) = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "websocket connect timed out",
            ))
        })??;
    Ok(stream)
}

/// Handle to the reconnecting websocket. Events arrive on the receiver
/// returned by [`TransportChannel::connect`].
pub struct TransportChannel {
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
    reconnect_pending: Arc<AtomicBool>,
}

impl TransportChannel {
    pub fn connect(
        ws_url: &Url,
        auth_token: Option<&str>,
        settings: TransportSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let reconnect_pending = Arc::new(AtomicBool::new(false));

        let endpoint = stream_endpoint(ws_url, auth_token);
        let task_token = cancellation_token.clone();
        let task_pending = Arc::clone(&reconnect_pending);
        let join_handle = tokio::spawn(async move {
            run_transport(endpoint, settings, events_tx, task_token, task_pending).await;
        });

        (
            Self {
                cancellation_token,
                join_handle: Some(join_handle),
                reconnect_pending,
            },
            events_rx,
        )
    }

    /// True while a reconnect timer is armed.
    pub fn is_reconnect_pending(&self) -> bool {
        self.reconnect_pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.join_handle.is_none()
    }

    /// Cancels any pending reconnect, detaches the event sender and closes
    /// the socket. Safe to call more than once.
    pub async fn close(&mut self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
        self.reconnect_pending.store(false, Ordering::Release);
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<TransportEvent>>, event: TransportEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}

enum SessionEnd {
    Closed { code: Option<u16>, reason: String },
    Cancelled,
}

async fn run_transport(
    endpoint: Url,
    settings: TransportSettings,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    cancel_token: CancellationToken,
    reconnect_pending: Arc<AtomicBool>,
) {
    let mut events = Some(events_tx);
    let mut reconnect = ReconnectState::default();
    let host = endpoint.host_str().unwrap_or_default().to_string();

    while !cancel_token.is_cancelled() {
        debug!(%host, attempt = reconnect.attempt(), "opening dashboard websocket");
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_dashboard_stream(&endpoint, settings.connect_timeout) => result,
        };

        let session = match connected {
            Ok(mut stream) => {
                reconnect.on_open();
                info!(%host, "dashboard websocket open");
                emit(&events, TransportEvent::Open);
                let opened_at = Instant::now();

                match read_session(&mut stream, &events, &cancel_token).await {
                    SessionEnd::Cancelled => {
                        events.take();
                        let _ =
                            tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, stream.close(None)).await;
                        break;
                    }
                    SessionEnd::Closed { code, reason } => {
                        info!(%host, ?code, %reason, "dashboard websocket closed");
                        emit(&events, TransportEvent::Closed { code, reason });
                    }
                }
                Some(opened_at.elapsed())
            }
            Err(error) => {
                warn!(%host, error = %error, "dashboard websocket connect failed");
                emit(&events, TransportEvent::Error(error.to_string()));
                emit(
                    &events,
                    TransportEvent::Closed {
                        code: None,
                        reason: error.to_string(),
                    },
                );
                None
            }
        };

        let plan = reconnect.on_close(&settings.policy, session, sample_jitter(&settings.policy));
        if plan.activate_fallback {
            warn!(
                %host,
                failures = reconnect.consecutive_failures(),
                "websocket failure threshold crossed; requesting poll fallback"
            );
            emit(&events, TransportEvent::FallbackRequested);
        }

        debug!(%host, delay_ms = plan.delay.as_millis() as u64, "scheduling websocket reconnect");
        reconnect_pending.store(true, Ordering::Release);
        let cancelled = tokio::select! {
            _ = cancel_token.cancelled() => true,
            _ = tokio::time::sleep(plan.delay) => false,
        };
        reconnect_pending.store(false, Ordering::Release);
        if cancelled {
            break;
        }
    }

    events.take();
    reconnect_pending.store(false, Ordering::Release);
    debug!(%host, "dashboard transport stopped");
}

async fn read_session(
    stream: &mut DashboardWsStream,
    events: &Option<mpsc::UnboundedSender<TransportEvent>>,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            _ = cancel_token.cancelled() => return SessionEnd::Cancelled,
            next_frame = stream.next() => next_frame,
        };

        let Some(frame_result) = frame else {
            return SessionEnd::Closed {
                code: None,
                reason: "stream ended".to_string(),
            };
        };

        match frame_result {
            Ok(Message::Text(text_payload)) => {
                emit(events, TransportEvent::Message(text_payload.into_bytes()));
            }
            Ok(Message::Binary(binary_payload)) => {
                emit(events, TransportEvent::Message(binary_payload));
            }
            Ok(Message::Close(close_frame)) => {
                let (code, reason) = match close_frame {
                    Some(close_frame) => (
                        Some(u16::from(close_frame.code)),
                        close_frame.reason.into_owned(),
                    ),
                    None => (None, String::new()),
                };
                return SessionEnd::Closed { code, reason };
            }
            Ok(_) => {}
            Err(error) => {
                warn!(error = %error, "websocket frame error");
                emit(events, TransportEvent::Error(error.to_string()));
                return SessionEnd::Closed {
                    code: None,
                    reason: error.to_string(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 1.5,
            jitter: Duration::ZERO,
            failure_threshold: 3,
            fallback_interval: Duration::from_millis(30_000),
            healthy_session: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_grows_by_multiplier_and_caps() {
        let policy = policy();
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(1_500));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(2_250));
        assert_eq!(backoff_delay(&policy, 50), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(&policy, u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_is_monotonic_up_to_max() {
        let policy = policy();
        let delays: Vec<_> = (0..40).map(|attempt| backoff_delay(&policy, attempt)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= policy.max_delay));
    }

    #[test]
    fn jitter_stays_inside_window() {
        let mut policy = policy();
        policy.jitter = Duration::from_millis(250);
        for _ in 0..100 {
            assert!(sample_jitter(&policy) <= Duration::from_millis(250));
        }
    }

    #[test]
    fn open_resets_attempt_to_base_delay() {
        let mut policy = policy();
        policy.failure_threshold = 10;
        let mut state = ReconnectState::default();

        state.on_close(&policy, None, Duration::ZERO);
        let plan = state.on_close(&policy, None, Duration::ZERO);
        assert_eq!(plan.delay, Duration::from_millis(1_500));

        state.on_open();
        assert_eq!(state.attempt(), 0);
        let plan = state.on_close(&policy, Some(Duration::from_millis(5)), Duration::ZERO);
        assert_eq!(plan.delay, policy.base_delay);
    }

    #[test]
    fn fallback_activates_once_at_threshold_and_uses_fixed_cadence() {
        let policy = policy();
        let mut state = ReconnectState::default();

        let first = state.on_close(&policy, None, Duration::ZERO);
        let second = state.on_close(&policy, Some(Duration::from_millis(10)), Duration::ZERO);
        let third = state.on_close(&policy, None, Duration::ZERO);
        let fourth = state.on_close(&policy, None, Duration::ZERO);

        assert!(!first.activate_fallback);
        assert!(!second.activate_fallback);
        assert!(third.activate_fallback);
        assert!(!fourth.activate_fallback);
        assert_eq!(third.delay, policy.fallback_interval);
        assert_eq!(fourth.delay, policy.fallback_interval);
        assert!(state.fallback_active());
    }

    #[test]
    fn open_clears_fallback_exactly_once() {
        let mut policy = policy();
        policy.failure_threshold = 1;
        let mut state = ReconnectState::default();

        assert!(state.on_close(&policy, None, Duration::ZERO).activate_fallback);
        assert!(state.on_open());
        assert!(!state.on_open());
    }

    #[test]
    fn healthy_session_resets_failure_counter() {
        let policy = policy();
        let mut state = ReconnectState::default();
        state.on_close(&policy, None, Duration::ZERO);
        state.on_close(&policy, None, Duration::ZERO);
        assert_eq!(state.consecutive_failures(), 2);

        state.on_open();
        let plan = state.on_close(&policy, Some(Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(state.consecutive_failures(), 1);
        assert!(!plan.activate_fallback);
        assert_eq!(plan.delay, policy.base_delay);
    }

    #[test]
    fn token_is_appended_as_query_parameter() {
        let url = Url::parse("wss://example.com/ws/dashboard").expect("valid url");
        let endpoint = stream_endpoint(&url, Some("a b&c"));
        assert_eq!(
            endpoint.as_str(),
            "wss://example.com/ws/dashboard?token=a+b%26c"
        );
        assert_eq!(stream_endpoint(&url, None), url);
    }

    #[tokio::test]
    async fn close_cancels_pending_reconnect_and_detaches_events() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        let address = listener.local_addr().expect("local address");
        drop(listener);

        let ws_url = Url::parse(&format!("ws://{address}/ws/dashboard")).expect("valid url");
        let mut settings_policy = policy();
        settings_policy.base_delay = Duration::from_secs(30);
        settings_policy.max_delay = Duration::from_secs(30);
        let (mut channel, mut events) = TransportChannel::connect(
            &ws_url,
            None,
            TransportSettings {
                policy: settings_policy,
                connect_timeout: Duration::from_secs(2),
            },
        );

        let armed = tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.is_reconnect_pending() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(armed.is_ok(), "reconnect timer should be armed after refusal");

        channel.close().await;
        assert!(!channel.is_reconnect_pending());
        assert!(channel.is_closed());

        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                seen.push(event);
            }
            seen
        })
        .await
        .expect("event sender should be dropped after close");
        assert!(drained
            .iter()
            .all(|event| !matches!(event, TransportEvent::Open)));
    }
}
