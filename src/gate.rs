//! Access Gate: decides per request whether a pool may be served and, if
//! so, makes sure its backend runs.

use std::fmt;

use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::registry::{BackendRecord, BackendState, PoolReason, PoolRecord, UserRecord, now_unix};
use crate::supervisor::{StartOutcome, Supervisor, Unavailable};

/// Usability of a pool as seen by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Eligible, no backend known yet.
    Initial,
    Ready,
    Disabled(PoolReason),
    /// Masks READY while the synthetic record lives.
    Suspended(PoolReason),
    Inoperable(PoolReason),
}

impl PoolState {
    pub fn is_usable(&self) -> bool {
        matches!(self, PoolState::Initial | PoolState::Ready)
    }
}

/// Persistent eligibility of a pool, without the SUSPENDED overlay.
pub fn check_pool_is_usable(
    pool: Option<&PoolRecord>,
    user: Option<&UserRecord>,
    now: i64,
) -> PoolState {
    let Some(pool) = pool else {
        return PoolState::Inoperable(PoolReason::PoolRemoved);
    };
    if pool.inoperable {
        return PoolState::Inoperable(PoolReason::BackendFailed);
    }
    match user {
        Some(u) if u.enabled && u.expiration > now => {}
        _ => return PoolState::Disabled(PoolReason::UserInactive),
    }
    if !pool.enabled {
        return PoolState::Disabled(PoolReason::PoolOffline);
    }
    if pool.expiration <= now {
        return PoolState::Disabled(PoolReason::PoolExpired);
    }
    PoolState::Initial
}

/// Overlay the backend record on the persistent state.
pub fn combine(persistent: PoolState, backend: Option<&BackendRecord>) -> PoolState {
    if !persistent.is_usable() {
        return persistent;
    }
    match backend {
        Some(b) if b.state == BackendState::Suspended => PoolState::Suspended(b.reason),
        Some(_) => PoolState::Ready,
        None => persistent,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Rejection of a request. Messages are safe to show to clients; details
/// go to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    Disabled(PoolReason),
    Suspended(PoolReason),
    Unavailable,
    Inoperable(PoolReason),
    Internal,
}

impl GateError {
    pub fn status(&self) -> u16 {
        match self {
            GateError::Disabled(_) => 403,
            GateError::Suspended(_) | GateError::Unavailable => 503,
            GateError::Inoperable(_) | GateError::Internal => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            GateError::Disabled(reason) => format!("pool disabled: {reason}"),
            GateError::Suspended(reason) => format!("pool suspended: {reason}"),
            GateError::Unavailable => "backend unavailable, retry later".to_string(),
            GateError::Inoperable(reason) => format!("pool inoperable: {reason}"),
            GateError::Internal => "internal error".to_string(),
        }
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status(), self.message())
    }
}

impl std::error::Error for GateError {}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AccessGate {
    supervisor: Supervisor,
}

impl AccessGate {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Resolve `pool` to a READY backend, starting one if needed.
    pub async fn ensure_backend(&self, pool: &str) -> Result<BackendRecord, GateError> {
        match self.check_and_start(pool).await {
            Ok(result) => result,
            Err(e) if e.is_fatal() => {
                self.supervisor.fatal(&e);
                Err(GateError::Internal)
            }
            Err(e) => {
                error!(pool = %pool, error = %e, "request failed");
                Err(GateError::Internal)
            }
        }
    }

    async fn check_and_start(
        &self,
        pool: &str,
    ) -> Result<Result<BackendRecord, GateError>, AppError> {
        let table = self.supervisor.table();
        let now = now_unix();
        let pool_record = table.get_pool(pool).await?;
        let user = match &pool_record {
            Some(p) => table.get_user(&p.owner_uid).await?,
            None => None,
        };
        let persistent = check_pool_is_usable(pool_record.as_ref(), user.as_ref(), now);
        if !persistent.is_usable() {
            debug!(pool = %pool, state = ?persistent, "pool not usable");
            return Ok(Err(reject(persistent)));
        }

        // Before the backend check, so a backend near its idle limit stays up.
        table.set_access_timestamp(pool, now).await?;

        let backend = table.get_backend(pool).await?;
        match combine(persistent, backend.as_ref()) {
            PoolState::Ready => {
                if let Some(record) = backend {
                    return Ok(Ok(record));
                }
            }
            PoolState::Initial => {}
            state => return Ok(Err(reject(state))),
        }

        Ok(match self.supervisor.start_backend(pool).await? {
            StartOutcome::Ready(record) => Ok(record),
            StartOutcome::Unavailable(Unavailable::Suspended(reason)) => {
                Err(GateError::Suspended(reason))
            }
            StartOutcome::Unavailable(Unavailable::NoPool) => {
                Err(GateError::Inoperable(PoolReason::PoolRemoved))
            }
            StartOutcome::Unavailable(Unavailable::Failed(reason)) if reason.is_persistent() => {
                warn!(pool = %pool, reason = %reason, "backend failed");
                Err(GateError::Inoperable(PoolReason::BackendFailed))
            }
            StartOutcome::Unavailable(other) => {
                warn!(pool = %pool, reason = %other, "backend unavailable");
                Err(GateError::Unavailable)
            }
        })
    }
}

fn reject(state: PoolState) -> GateError {
    match state {
        PoolState::Disabled(reason) => GateError::Disabled(reason),
        PoolState::Suspended(reason) => GateError::Suspended(reason),
        PoolState::Inoperable(reason) => GateError::Inoperable(reason),
        PoolState::Initial | PoolState::Ready => GateError::Internal,
    }
}
