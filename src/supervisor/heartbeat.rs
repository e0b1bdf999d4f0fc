//! Heartbeat Monitor: one task per running backend.
//!
//! Each tick probes the backend, checks for idleness, and refreshes the
//! backend record's TTL. Any of those failing ends the loop, after which
//! the backend is released from the handle table and stopped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Supervisor, process};
use crate::backend::BackendDelegate;
use crate::error::AppError;
use crate::registry::{BackendRecord, now_unix};

/// Everything a heartbeat task owns for its backend.
pub(crate) struct Monitor {
    pub record: BackendRecord,
    pub delegate: Arc<dyn BackendDelegate>,
    pub child: Child,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Exited,
    Unhealthy,
    Idle,
    RecordGone,
    RegistryFailure,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Cancelled => "shutdown",
            StopReason::Exited => "process exited",
            StopReason::Unhealthy => "heartbeat failures",
            StopReason::Idle => "idle",
            StopReason::RecordGone => "record expired",
            StopReason::RegistryFailure => "registry failure",
        })
    }
}

pub(crate) async fn run(sup: Supervisor, mut monitor: Monitor) {
    let reason = watch(&sup, &mut monitor).await;
    info!(pool = %monitor.record.pool, reason = %reason, "stopping backend");
    let released = sup.release(&monitor.record.pool, monitor.record.backend_pid).await;
    stop(&sup, &mut monitor, &reason).await;
    if let Some(port) = released {
        sup.settle(port).await;
    }
}

async fn watch(sup: &Supervisor, monitor: &mut Monitor) -> StopReason {
    let conf = sup.conf();
    let pool = monitor.record.pool.clone();
    let mut misses = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = monitor.cancel.cancelled() => return StopReason::Cancelled,
            status = monitor.child.wait() => {
                warn!(pool = %pool, status = ?status, "backend exited on its own");
                return StopReason::Exited;
            }
            _ = tokio::time::sleep(conf.heartbeat_interval) => {}
        }

        let probe = monitor.delegate.probe(&monitor.record, conf.heartbeat_timeout);
        match tokio::time::timeout(conf.heartbeat_timeout, probe).await {
            Ok(Ok(200)) => misses = 0,
            Ok(Ok(status)) => {
                misses += 1;
                warn!(pool = %pool, status, misses, "heartbeat failed");
            }
            Ok(Err(e)) => {
                misses += 1;
                warn!(pool = %pool, misses, "heartbeat failed: {e}");
            }
            Err(_) => {
                misses += 1;
                warn!(pool = %pool, misses, "heartbeat timed out");
            }
        }
        if misses > conf.heartbeat_miss_tolerance {
            return StopReason::Unhealthy;
        }

        match is_idle(sup, &monitor.record, conf.awake_duration).await {
            Ok(true) => return StopReason::Idle,
            Ok(false) => {}
            Err(e) => {
                sup.fatal(&e);
                return StopReason::RegistryFailure;
            }
        }
        match sup.table().set_backend_ttl(&pool, conf.backend_record_ttl).await {
            Ok(true) => debug!(pool = %pool, "backend record refreshed"),
            Ok(false) => return StopReason::RecordGone,
            Err(e) => {
                sup.fatal(&e);
                return StopReason::RegistryFailure;
            }
        }
    }
}

/// No access for longer than `awake`. The record's own timestamp stands in
/// when no access was ever recorded.
async fn is_idle(
    sup: &Supervisor,
    record: &BackendRecord,
    awake: Duration,
) -> Result<bool, AppError> {
    let last = sup
        .table()
        .get_access_timestamp(&record.pool)
        .await?
        .unwrap_or(record.timestamp);
    let elapsed = u64::try_from(now_unix() - last).unwrap_or(0);
    Ok(Duration::from_secs(elapsed) > awake)
}

/// Unregister, linger, then stop the process: the delegate's shutdown
/// command first, SIGTERM if that fails, and reaping with escalation.
async fn stop(sup: &Supervisor, monitor: &mut Monitor, reason: &StopReason) {
    let conf = sup.conf();
    let pool = monitor.record.pool.clone();
    let pid = monitor.record.backend_pid;

    if let Err(e) = sup.table().delete_exclusion(&pool).await {
        sup.fatal(&e);
    }
    if let Err(e) = sup.table().delete_backend(&pool).await {
        sup.fatal(&e);
    }

    if *reason != StopReason::Exited {
        tokio::time::sleep(conf.linger).await;
        let shutdown = monitor.delegate.shutdown(&monitor.record);
        let graceful = match tokio::time::timeout(conf.command_timeout, shutdown).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(pool = %pool, "shutdown command failed: {e}");
                false
            }
            Err(_) => {
                warn!(pool = %pool, "shutdown command timed out");
                false
            }
        };
        // An already-reaped pid may have been reused.
        if !graceful && matches!(monitor.child.try_wait(), Ok(None)) {
            if let Err(e) = process::terminate(pid) {
                warn!(pool = %pool, pid, "SIGTERM failed: {e}");
            }
        }
    }
    process::reap(&mut monitor.child, pid, conf.command_timeout).await;
    info!(pool = %pool, pid, "backend stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_text() {
        assert_eq!(StopReason::Idle.to_string(), "idle");
        assert_eq!(StopReason::RecordGone.to_string(), "record expired");
        assert_eq!(StopReason::Cancelled.to_string(), "shutdown");
    }
}
