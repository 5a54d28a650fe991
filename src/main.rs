use dashboard_live_client::logging::{init_tracing, DEFAULT_LOG_FILTER};
use dashboard_live_client::{ClientConfigArgs, ClientError, LiveClient};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing(DEFAULT_LOG_FILTER);

    if let Err(error) = run().await {
        error!(error = %error, "dashboard-live exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ClientError> {
    let config = ClientConfigArgs::from_env()?.normalize()?;
    let mut client = LiveClient::start(config).await?;
    let mut updates = client.subscribe();

    let health = client.health().await;
    info!(
        status = health.status,
        cache = health.cache,
        backend_running = health.backend.as_ref().map(|backend| backend.running),
        "initial health"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received, shutting down");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                info!(
                    connection = state.connection.as_str(),
                    portfolio_value = state.portfolio_value,
                    total_pnl = state.total_pnl,
                    agents = state.agents.len(),
                    positions = state.open_positions.len(),
                    trades = state.recent_trades.len(),
                    logs = state.logs.len(),
                    "dashboard state updated"
                );
            }
        }
    }

    client.shutdown().await;
    let stats = client.stats();
    info!(
        frames_applied = stats.frames_applied,
        frames_dropped = stats.frames_dropped,
        duplicates = stats.duplicates,
        poll_starts = stats.poll_starts,
        "dashboard-live stopped"
    );
    Ok(())
}
