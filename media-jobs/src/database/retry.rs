//! Retry helper for queue writes that race other worker processes for the
//! SQLite write lock.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const MAX_ATTEMPTS: u32 = 10;
const BASE_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 1_500;

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6), or the textual form when the error
/// surfaced outside a database response.
pub(crate) fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(inner) = err else {
        return false;
    };

    if let sqlx::Error::Database(db) = inner
        && matches!(db.code().map(Cow::into_owned).as_deref(), Some("5" | "6"))
    {
        return true;
    }

    let msg = inner.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn backoff(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(MAX_DELAY_MS))
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// the database as busy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < MAX_ATTEMPTS => {
                let delay = backoff(attempt);
                debug!(op = op_name, ?delay, attempt = attempt + 1, "sqlite busy, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
