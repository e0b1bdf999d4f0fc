//! Exclusion Coordinator: the per-pool distributed start lock.
//!
//! Acquisition is a conditional set on the registry, followed by a safety
//! TTL in case the holder dies. The returned [`ExclusionGuard`] must be
//! released with [`ExclusionGuard::release`]; if it is dropped instead
//! (error path, cancelled future) the delete is spawned from `Drop`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::AppError;
use crate::registry::{ExclusionRecord, Table, now_unix};

pub struct ExclusionGuard {
    table: Table,
    pool: String,
    released: bool,
}

/// Try to take the start lock of `pool`. `None` if another holder has it.
pub async fn acquire(
    table: &Table,
    pool: &str,
    mux_ep: &str,
    ttl: Duration,
) -> Result<Option<ExclusionGuard>, AppError> {
    let record = ExclusionRecord {
        pool: pool.to_string(),
        mux_ep: mux_ep.to_string(),
        timestamp: now_unix(),
    };
    if !table.set_exclusion_if_absent(record).await? {
        debug!(pool = %pool, "exclusion held elsewhere");
        return Ok(None);
    }
    let guard = ExclusionGuard { table: table.clone(), pool: pool.to_string(), released: false };
    if !table.set_exclusion_ttl(pool, ttl).await? {
        warn!(pool = %pool, "exclusion vanished before its ttl was set");
    }
    Ok(Some(guard))
}

impl ExclusionGuard {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub async fn release(mut self) -> Result<(), AppError> {
        self.released = true;
        self.table.delete_exclusion(&self.pool).await
    }
}

impl Drop for ExclusionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let table = self.table.clone();
        let pool = std::mem::take(&mut self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = table.delete_exclusion(&pool).await {
                        warn!(pool = %pool, "deferred exclusion release failed: {e}");
                    }
                });
            }
            Err(_) => warn!(pool = %pool, "exclusion dropped outside a runtime; left to its ttl"),
        }
    }
}
