use crate::config::RetentionLimits;
use crate::error::ClientError;
use crate::live::types::{CanonicalState, IdempotencyKey, LogEntry, PortfolioPoint, Trade};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::warn;

/// Entries mirrored into `recent_activity`.
pub trait CachedActivity: IdempotencyKey + Serialize + DeserializeOwned {
    const KIND: &'static str;
}

impl CachedActivity for Trade {
    const KIND: &'static str = "trade";
}

impl CachedActivity for LogEntry {
    const KIND: &'static str = "log";
}

/// Rows restored from the cache, all newest-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmStart {
    pub portfolio_history: Vec<PortfolioPoint>,
    pub recent_trades: Vec<Trade>,
    pub logs: Vec<LogEntry>,
}

impl WarmStart {
    pub fn is_empty(&self) -> bool {
        self.portfolio_history.is_empty() && self.recent_trades.is_empty() && self.logs.is_empty()
    }

    /// Seeds the bounded sequences. `last_updated_ms` stays untouched so a
    /// cached state is never mistaken for live data.
    pub fn apply_to(self, state: &mut CanonicalState) {
        state.portfolio_history.replace(self.portfolio_history);
        state.recent_trades.replace_unique(self.recent_trades);
        state.logs.replace_unique(self.logs);
    }
}

pub async fn load_warm_start(
    pool: &SqlitePool,
    retention: RetentionLimits,
) -> Result<WarmStart, ClientError> {
    let rows = sqlx::query(
        "SELECT recorded_at_ms, portfolio_value FROM portfolio_history \
         ORDER BY recorded_at_ms DESC, id DESC LIMIT ?",
    )
    .bind(retention.portfolio_history as i64)
    .fetch_all(pool)
    .await?;

    let mut portfolio_history = Vec::with_capacity(rows.len());
    for row in rows {
        portfolio_history.push(PortfolioPoint {
            t: row.try_get("recorded_at_ms")?,
            value: row.try_get("portfolio_value")?,
        });
    }

    Ok(WarmStart {
        portfolio_history,
        recent_trades: load_activity(pool, retention.trades).await?,
        logs: load_activity(pool, retention.logs).await?,
    })
}

async fn load_activity<T: CachedActivity>(
    pool: &SqlitePool,
    limit: usize,
) -> Result<Vec<T>, ClientError> {
    let rows = sqlx::query(
        "SELECT activity_key, payload_json FROM recent_activity WHERE kind = ? \
         ORDER BY recorded_at_ms DESC, id DESC LIMIT ?",
    )
    .bind(T::KIND)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let payload: String = row.try_get("payload_json")?;
        match serde_json::from_str::<T>(&payload) {
            Ok(item) => items.push(item),
            Err(error) => {
                let key: Option<String> = row.try_get("activity_key")?;
                warn!(kind = T::KIND, key = ?key, error = %error, "skipping unreadable cached activity");
            }
        }
    }

    Ok(items)
}

pub async fn record_portfolio_point(
    pool: &SqlitePool,
    point: PortfolioPoint,
    keep: usize,
) -> Result<(), ClientError> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO portfolio_history (recorded_at_ms, portfolio_value) VALUES (?, ?)")
        .bind(point.t)
        .bind(point.value)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "DELETE FROM portfolio_history WHERE id NOT IN \
         (SELECT id FROM portfolio_history ORDER BY recorded_at_ms DESC, id DESC LIMIT ?)",
    )
    .bind(keep as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Adds one streamed entry unless an entry of the same kind with its key is
/// already cached.
pub async fn append_activity<T: CachedActivity>(
    pool: &SqlitePool,
    item: &T,
    recorded_at_ms: i64,
    keep: usize,
) -> Result<(), ClientError> {
    let mut tx = pool.begin().await?;
    insert_activity(&mut tx, item, recorded_at_ms).await?;
    trim_activity::<T>(&mut tx, keep).await?;
    tx.commit().await?;
    Ok(())
}

/// Mirrors a snapshot-provided list (newest-first), replacing what was cached
/// for that kind.
pub async fn replace_activity<T: CachedActivity>(
    pool: &SqlitePool,
    items: &[T],
    recorded_at_ms: i64,
    keep: usize,
) -> Result<(), ClientError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM recent_activity WHERE kind = ?")
        .bind(T::KIND)
        .execute(&mut *tx)
        .await?;

    // Oldest first so id order matches feed order within one timestamp.
    for item in items.iter().rev() {
        insert_activity(&mut tx, item, recorded_at_ms).await?;
    }
    trim_activity::<T>(&mut tx, keep).await?;

    tx.commit().await?;
    Ok(())
}

async fn insert_activity<T: CachedActivity>(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    item: &T,
    recorded_at_ms: i64,
) -> Result<(), ClientError> {
    let payload_json = serde_json::to_string(item)?;
    sqlx::query(
        "INSERT OR IGNORE INTO recent_activity (activity_key, kind, payload_json, recorded_at_ms) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(item.idempotency_key())
    .bind(T::KIND)
    .bind(payload_json)
    .bind(recorded_at_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn trim_activity<T: CachedActivity>(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    keep: usize,
) -> Result<(), ClientError> {
    sqlx::query(
        "DELETE FROM recent_activity WHERE kind = ? AND id NOT IN \
         (SELECT id FROM recent_activity WHERE kind = ? \
          ORDER BY recorded_at_ms DESC, id DESC LIMIT ?)",
    )
    .bind(T::KIND)
    .bind(T::KIND)
    .bind(keep as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
