use crate::backend::{build_http_client, BackendEndpoints};
use crate::commands::control::ControlClient;
use crate::commands::health::{build_health_report, HealthReport};
use crate::config::ClientConfig;
use crate::db::initialize_pool_from_path;
use crate::error::ClientError;
use crate::live::cache::{
    append_activity, load_warm_start, record_portfolio_point, replace_activity,
};
use crate::live::delay::{PrivacyBuffer, PublicView};
use crate::live::normalizer::normalize_frame;
use crate::live::now_unix_ms;
use crate::live::poller::{PollFallback, PollResult};
use crate::live::reconciler::{apply, ApplyOutcome};
use crate::live::transport::{TransportChannel, TransportEvent, TransportSettings};
use crate::live::types::{
    CanonicalState, ConnectionState, Normalized, PartialLogUpdate, StateUpdate,
};
use crate::state::{ClientCounters, ClientStats, SessionHandle};
use parking_lot::Mutex;
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PRIVACY_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Live dashboard client. Owns the websocket, the poll fallback, the
/// reconciled state and every timer behind them; `shutdown` tears all of it
/// down.
pub struct LiveClient {
    config: Arc<ClientConfig>,
    started_at: Instant,
    http: Client,
    endpoints: BackendEndpoints,
    cache_pool: Option<SqlitePool>,
    counters: Arc<ClientCounters>,
    state_rx: watch::Receiver<CanonicalState>,
    public_rx: Option<watch::Receiver<PublicView>>,
    privacy: Option<Arc<Mutex<PrivacyBuffer>>>,
    session: Option<SessionHandle>,
}

impl LiveClient {
    /// Connects and starts the client loop. Must be called inside a tokio
    /// runtime.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let config = Arc::new(config);
        let http = build_http_client(config.request_timeout)?;
        let endpoints = BackendEndpoints::from_config(&config)?;

        let mut initial = CanonicalState::new(config.retention);
        let cache_pool = open_cache(&config).await;
        if let Some(pool) = &cache_pool {
            match load_warm_start(pool, config.retention).await {
                Ok(warm) if !warm.is_empty() => {
                    info!(
                        history = warm.portfolio_history.len(),
                        trades = warm.recent_trades.len(),
                        logs = warm.logs.len(),
                        "restored warm-start cache"
                    );
                    warm.apply_to(&mut initial);
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "failed to load warm-start cache"),
            }
        }

        let (state_tx, state_rx) = watch::channel(initial);
        let privacy = config
            .privacy_delay
            .map(|delay| Arc::new(Mutex::new(PrivacyBuffer::new(delay, config.retention.trades))));
        let (public_tx, public_rx) = match &privacy {
            Some(buffer) => {
                let view = buffer.lock().view(&state_rx.borrow(), now_unix_ms());
                let (tx, rx) = watch::channel(view);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let counters = Arc::new(ClientCounters::default());
        let cancellation_token = CancellationToken::new();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (transport, transport_rx) = TransportChannel::connect(
            &config.ws_url,
            config.auth_token.as_deref(),
            TransportSettings {
                policy: config.reconnect.clone(),
                connect_timeout: config.request_timeout,
            },
        );

        let session = ClientSession {
            config: Arc::clone(&config),
            state_tx,
            public_tx,
            privacy: privacy.clone(),
            counters: Arc::clone(&counters),
            cache_pool: cache_pool.clone(),
            poller: PollFallback::new(http.clone(), endpoints.snapshot.clone(), poll_tx),
            transport,
            cancel_token: cancellation_token.clone(),
        };
        let join_handle = tokio::spawn(session.run(transport_rx, poll_rx));

        info!(
            ws_url = %config.ws_url,
            snapshot_url = %endpoints.snapshot,
            privacy_delay_ms = config.privacy_delay.map(|delay| delay.as_millis() as u64),
            "live client started"
        );

        Ok(Self {
            config,
            started_at: Instant::now(),
            http,
            endpoints,
            cache_pool,
            counters,
            state_rx,
            public_rx,
            privacy,
            session: Some(SessionHandle {
                cancellation_token,
                join_handle,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn snapshot(&self) -> CanonicalState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CanonicalState> {
        self.state_rx.clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.state_rx.borrow().connection
    }

    pub fn stats(&self) -> ClientStats {
        self.counters.snapshot(self.started_at)
    }

    /// `None` unless a privacy delay is configured.
    pub fn public_view(&self, now_ms: i64) -> Option<PublicView> {
        let privacy = self.privacy.as_ref()?;
        let state = self.state_rx.borrow();
        let view = privacy.lock().view(&state, now_ms);
        Some(view)
    }

    pub fn subscribe_public(&self) -> Option<watch::Receiver<PublicView>> {
        self.public_rx.clone()
    }

    pub fn control(&self) -> ControlClient {
        ControlClient::new(
            self.http.clone(),
            self.endpoints.clone(),
            self.config.action_max_attempts,
            self.config.action_retry_delay,
        )
    }

    pub async fn health(&self) -> HealthReport {
        build_health_report(
            self.started_at,
            &self.http,
            &self.endpoints.health,
            self.connection(),
            self.cache_pool.as_ref(),
        )
        .await
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Stops every timer, the poll loop and the socket. Once this returns the
    /// state no longer changes. Idempotent.
    pub async fn shutdown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancellation_token.cancel();
        if let Err(error) = session.join_handle.await {
            warn!(error = %error, "live client loop ended abnormally");
        }
        if let Some(pool) = self.cache_pool.take() {
            pool.close().await;
        }
        info!("live client stopped");
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancellation_token.cancel();
        }
    }
}

async fn open_cache(config: &ClientConfig) -> Option<SqlitePool> {
    let path = config.cache_path.as_ref()?;
    match initialize_pool_from_path(path).await {
        Ok(pool) => Some(pool),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "warm-start cache unavailable");
            None
        }
    }
}

/// Which cached rows an accepted update touches.
enum CacheWrite {
    Snapshot { trades: bool, logs: bool },
    Trade,
    Log,
}

impl CacheWrite {
    fn for_update(update: &StateUpdate) -> Self {
        match update {
            StateUpdate::Snapshot(snapshot) => Self::Snapshot {
                trades: snapshot.recent_trades.is_some(),
                logs: snapshot.logs.is_some(),
            },
            StateUpdate::Event(PartialLogUpdate::Trade(_)) => Self::Trade,
            StateUpdate::Event(PartialLogUpdate::Log(_)) => Self::Log,
        }
    }
}

/// State owned by the spawned client loop.
struct ClientSession {
    config: Arc<ClientConfig>,
    state_tx: watch::Sender<CanonicalState>,
    public_tx: Option<watch::Sender<PublicView>>,
    privacy: Option<Arc<Mutex<PrivacyBuffer>>>,
    counters: Arc<ClientCounters>,
    cache_pool: Option<SqlitePool>,
    poller: PollFallback,
    transport: TransportChannel,
    cancel_token: CancellationToken,
}

impl ClientSession {
    async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut poll_rx: mpsc::UnboundedReceiver<PollResult>,
    ) {
        let mut flush = tokio::time::interval(PRIVACY_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let privacy_enabled = self.public_tx.is_some();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                Some(event) = transport_rx.recv() => self.on_transport_event(event).await,
                Some(result) = poll_rx.recv() => {
                    if self.poller.accepts(&result) {
                        let mut payload = result.payload;
                        self.ingest(&mut payload).await;
                    } else {
                        debug!(generation = result.generation, "dropping stale poll result");
                    }
                }
                _ = flush.tick(), if privacy_enabled => self.publish_public_view(),
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.poller.stop() {
            self.counters.record_poll_stop();
        }
        self.transport.close().await;
        self.set_connection(ConnectionState::Closed);
        self.publish_public_view();
        debug!("client loop exited");
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if self.poller.stop() {
                    self.counters.record_poll_stop();
                }
                self.set_connection(ConnectionState::Open);
            }
            TransportEvent::Message(mut payload) => self.ingest(&mut payload).await,
            TransportEvent::Closed { code, reason } => {
                debug!(?code, reason = %reason, "dashboard stream closed");
                let next = if self.poller.is_active() {
                    ConnectionState::Polling
                } else {
                    ConnectionState::Closed
                };
                self.set_connection(next);
            }
            TransportEvent::Error(error) => {
                warn!(error = %error, "dashboard stream error");
            }
            TransportEvent::FallbackRequested => {
                if self.poller.start(self.config.poll_interval) {
                    self.counters.record_poll_start();
                }
                self.set_connection(ConnectionState::Polling);
            }
        }
    }

    async fn ingest(&mut self, payload: &mut [u8]) {
        let update = match normalize_frame(payload) {
            Normalized::Heartbeat => {
                self.counters.record_heartbeat();
                return;
            }
            Normalized::Unrecognized { reason } => {
                self.counters.record_dropped();
                warn!(reason = %reason, "dropping unrecognized dashboard message");
                return;
            }
            normalized => match normalized.into_state_update() {
                Some(update) => update,
                None => return,
            },
        };

        if self.cancel_token.is_cancelled() {
            return;
        }

        let accepted_at_ms = now_unix_ms();
        let cache_write = CacheWrite::for_update(&update);
        let private_copy = self.privacy.as_ref().map(|_| update.clone());

        let (next, outcome) = apply(&self.state_tx.borrow(), update, accepted_at_ms);
        if let ApplyOutcome::DuplicateEvent { key } = &outcome {
            self.counters.record_duplicate();
            debug!(key = %key, "dropping re-delivered entry");
            return;
        }

        if let (Some(privacy), Some(update)) = (&self.privacy, &private_copy) {
            privacy.lock().record(update, accepted_at_ms);
        }
        self.counters.record_applied(accepted_at_ms);
        self.state_tx.send_replace(next);
        self.publish_public_view();

        self.write_through(cache_write, &outcome, accepted_at_ms).await;
    }

    async fn write_through(&self, write: CacheWrite, outcome: &ApplyOutcome, accepted_at_ms: i64) {
        let Some(pool) = &self.cache_pool else {
            return;
        };
        let retention = self.config.retention;
        let state = self.state_tx.borrow().clone();

        let result = match write {
            CacheWrite::Snapshot { trades, logs } => {
                let mut result = Ok(());
                if let ApplyOutcome::SnapshotApplied {
                    portfolio_point: Some(point),
                } = outcome
                {
                    result = record_portfolio_point(pool, *point, retention.portfolio_history).await;
                }
                if result.is_ok() && trades {
                    result = replace_activity(
                        pool,
                        &state.recent_trades.to_vec(),
                        accepted_at_ms,
                        retention.trades,
                    )
                    .await;
                }
                if result.is_ok() && logs {
                    result =
                        replace_activity(pool, &state.logs.to_vec(), accepted_at_ms, retention.logs)
                            .await;
                }
                result
            }
            CacheWrite::Trade => match state.recent_trades.newest() {
                Some(trade) => append_activity(pool, trade, accepted_at_ms, retention.trades).await,
                None => Ok(()),
            },
            CacheWrite::Log => match state.logs.newest() {
                Some(entry) => append_activity(pool, entry, accepted_at_ms, retention.logs).await,
                None => Ok(()),
            },
        };

        if let Err(error) = result {
            warn!(error = %error, "warm-start cache write failed");
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.connection == connection {
                return false;
            }
            state.connection = connection;
            true
        });
        if changed {
            info!(connection = connection.as_str(), "connection state changed");
        }
    }

    fn publish_public_view(&self) {
        let (Some(public_tx), Some(privacy)) = (&self.public_tx, &self.privacy) else {
            return;
        };
        let view = privacy.lock().view(&self.state_tx.borrow(), now_unix_ms());
        public_tx.send_if_modified(|current| {
            let changed = current.connection != view.connection
                || current.portfolio_value != view.portfolio_value
                || current.total_pnl != view.total_pnl
                || current.agent_count != view.agent_count
                || current.active_agent_count != view.active_agent_count
                || current.open_positions != view.open_positions
                || current.recent_trades != view.recent_trades
                || current.withheld_trades != view.withheld_trades;
            *current = view;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfigArgs;

    fn config_for(ws_port: u16, http_base: &str) -> ClientConfig {
        ClientConfigArgs {
            http_base_url: Some(http_base.to_string()),
            ws_url: Some(format!("ws://127.0.0.1:{ws_port}/ws/dashboard")),
            reconnect_base_delay_ms: Some(20),
            reconnect_max_delay_ms: Some(50),
            reconnect_jitter_ms: Some(0),
            ..ClientConfigArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn refused_port() -> u16 {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("ephemeral port should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn starts_with_empty_state_and_shuts_down_closed() {
        let config = config_for(refused_port(), "http://127.0.0.1:9");
        let mut client = LiveClient::start(config).await.expect("client should start");

        let initial = client.snapshot();
        assert!(!initial.has_data());
        assert!(client.public_view(now_unix_ms()).is_none());
        assert!(client.is_running());

        client.shutdown().await;
        client.shutdown().await;

        assert!(!client.is_running());
        assert_eq!(client.connection(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn privacy_delay_exposes_public_view() {
        let mut config = config_for(refused_port(), "http://127.0.0.1:9");
        config.privacy_delay = Some(Duration::from_secs(60));
        let mut client = LiveClient::start(config).await.expect("client should start");

        let view = client
            .public_view(now_unix_ms())
            .expect("public view should be available");
        assert_eq!(view.delay_ms, 60_000);
        assert!(view.recent_trades.is_empty());
        assert!(client.subscribe_public().is_some());

        client.shutdown().await;
    }
}
