use crate::error::ClientError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), ClientError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Opens (creating if needed) the warm-start cache at `path` and migrates it.
pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, ClientError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn ping(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}
