//! SpatiaLite connection pool.
//!
//! SpatiaLite layers are backed by the host-GIS application's own
//! SQLite connection (spec §4.8.2 notes the host-GIS's "separate SQLite
//! session" — temp tables there are invisible to the engine's own
//! connection). The engine therefore opens its own pool onto the same
//! file, rather than sharing the host's connection, and applies the
//! busy-timeout/retry policy from spec §5.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// SQLite busy-timeout (spec §5: 30s).
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry budget for `SQLITE_BUSY` (spec §5: bounded retries with
/// exponential backoff, bounded total retry time).
pub const SQLITE_MAX_RETRIES: u32 = 5;
pub const SQLITE_MAX_RETRY_TIME: Duration = Duration::from_secs(60);

pub async fn open(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .busy_timeout(BUSY_TIMEOUT)
        .extension("mod_spatialite");

    SqlitePoolOptions::new().max_connections(5).connect_with(options).await
}

/// Runs `op` with exponential backoff while it fails with a
/// `SQLITE_BUSY`-shaped error, up to [`SQLITE_MAX_RETRIES`] attempts or
/// [`SQLITE_MAX_RETRY_TIME`] elapsed, whichever comes first.
pub async fn execute_with_retry<F, Fut, T>(mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt < SQLITE_MAX_RETRIES && start.elapsed() < SQLITE_MAX_RETRY_TIME => {
                attempt += 1;
                let backoff = Duration::from_millis(50 * 2u64.pow(attempt));
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.message().to_lowercase().contains("database is locked"),
        _ => false,
    }
}
