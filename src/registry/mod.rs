//! Registry: the shared key-value store used to coordinate supervisors.
//!
//! The store itself is external. [`Registry`] names the operations the
//! supervisor consumes; [`Table`] wraps any implementation and bounds every
//! round-trip with the configured timeout. A missing key is `Ok(None)`;
//! every other failure is an [`AppError::Registry`], which callers treat as
//! fatal to the whole service.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub use memory::MemoryRegistry;

// ── Records ───────────────────────────────────────────────────────────────────

/// Pool record, written by the registration API. Read-only here except for
/// the `inoperable` marking after a fatal backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool: String,
    pub owner_uid: String,
    pub owner_gid: String,
    pub directory: String,
    pub enabled: bool,
    /// Unix seconds.
    pub expiration: i64,
    #[serde(default)]
    pub inoperable: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: String,
    pub enabled: bool,
    /// Unix seconds.
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub bucket: String,
    pub pool: String,
    /// Unix seconds.
    pub expiration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Ready,
    Suspended,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Ready => f.write_str("ready"),
            BackendState::Suspended => f.write_str("suspended"),
        }
    }
}

/// Reason code attached to a pool's derived state and to backend records.
/// The display text is what clients see, so it never carries detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolReason {
    Normal,
    UserInactive,
    PoolOffline,
    PoolExpired,
    PoolRemoved,
    /// Every candidate port was tried and refused.
    ServerBusy,
    /// No candidate port was left to try.
    NoPorts,
    BackendFailed,
}

impl fmt::Display for PoolReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolReason::Normal => "-",
            PoolReason::UserInactive => "user inactive",
            PoolReason::PoolOffline => "pool offline",
            PoolReason::PoolExpired => "pool expired",
            PoolReason::PoolRemoved => "pool removed",
            PoolReason::ServerBusy => "server busy",
            PoolReason::NoPorts => "no ports",
            PoolReason::BackendFailed => "backend failed",
        };
        f.write_str(s)
    }
}

/// A running (READY) or synthetic (SUSPENDED) backend of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRecord {
    pub pool: String,
    /// `host:port`. Empty on a SUSPENDED record.
    pub backend_ep: String,
    pub backend_pid: u32,
    pub state: BackendState,
    pub reason: PoolReason,
    pub root_access: String,
    pub root_secret: String,
    /// Endpoint and pid of the supervisor that owns the process.
    pub mux_ep: String,
    pub mux_pid: u32,
    /// Unix seconds.
    pub timestamp: i64,
}

impl BackendRecord {
    /// The port part of `backend_ep`.
    pub fn port(&self) -> Option<u16> {
        self.backend_ep.rsplit_once(':')?.1.parse().ok()
    }

    /// The host part of `backend_ep`.
    pub fn host(&self) -> &str {
        self.backend_ep
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.backend_ep)
    }
}

/// Distributed start lock of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRecord {
    pub pool: String,
    pub mux_ep: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Current wall-clock time in unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Registry trait ────────────────────────────────────────────────────────────

/// A boxed future returned by [`Registry`] operations.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

/// Operations consumed from the shared store.
///
/// Conditional-set and TTL operations report with `bool` whether the key
/// was written, so a lost race or a vanished record is a value, not an error.
pub trait Registry: Send + Sync {
    fn get_pool<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<PoolRecord>>;
    fn set_pool(&self, record: PoolRecord) -> RegistryFuture<'_, ()>;
    fn get_user<'a>(&'a self, uid: &'a str) -> RegistryFuture<'a, Option<UserRecord>>;
    fn list_buckets<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Vec<BucketRecord>>;

    fn get_backend<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<BackendRecord>>;
    /// Write a backend record, with an expiry when `ttl` is given.
    fn set_backend(&self, record: BackendRecord, ttl: Option<Duration>) -> RegistryFuture<'_, ()>;
    /// Refresh the expiry of an existing record. `false` if it is gone.
    fn set_backend_ttl<'a>(&'a self, pool: &'a str, ttl: Duration) -> RegistryFuture<'a, bool>;
    fn delete_backend<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, ()>;
    /// `"*"` lists every backend; anything else matches one pool id.
    fn list_backends<'a>(&'a self, filter: &'a str) -> RegistryFuture<'a, Vec<BackendRecord>>;

    /// Atomic set-if-absent. `false` when another holder already has it.
    fn set_exclusion_if_absent(&self, record: ExclusionRecord) -> RegistryFuture<'_, bool>;
    fn set_exclusion_ttl<'a>(&'a self, pool: &'a str, ttl: Duration) -> RegistryFuture<'a, bool>;
    fn delete_exclusion<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, ()>;

    fn get_access_timestamp<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<i64>>;
    fn set_access_timestamp<'a>(&'a self, pool: &'a str, timestamp: i64) -> RegistryFuture<'a, ()>;
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Timeout-bounded accessor over a shared [`Registry`].
#[derive(Clone)]
pub struct Table {
    store: Arc<dyn Registry>,
    op_timeout: Duration,
}

impl Table {
    pub fn new(store: Arc<dyn Registry>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    async fn bounded<T>(&self, op: &str, fut: RegistryFuture<'_, T>) -> Result<T, AppError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Registry(format!(
                "{op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    pub async fn get_pool(&self, pool: &str) -> Result<Option<PoolRecord>, AppError> {
        self.bounded("get_pool", self.store.get_pool(pool)).await
    }

    pub async fn set_pool(&self, record: PoolRecord) -> Result<(), AppError> {
        self.bounded("set_pool", self.store.set_pool(record)).await
    }

    pub async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>, AppError> {
        self.bounded("get_user", self.store.get_user(uid)).await
    }

    pub async fn list_buckets(&self, pool: &str) -> Result<Vec<BucketRecord>, AppError> {
        self.bounded("list_buckets", self.store.list_buckets(pool)).await
    }

    pub async fn get_backend(&self, pool: &str) -> Result<Option<BackendRecord>, AppError> {
        let record = self.bounded("get_backend", self.store.get_backend(pool)).await?;
        if let Some(r) = &record {
            if r.pool != pool {
                return Err(AppError::Registry(format!(
                    "backend record for '{pool}' names pool '{}'",
                    r.pool
                )));
            }
        }
        Ok(record)
    }

    pub async fn set_backend(&self, record: BackendRecord, ttl: Option<Duration>) -> Result<(), AppError> {
        self.bounded("set_backend", self.store.set_backend(record, ttl)).await
    }

    pub async fn set_backend_ttl(&self, pool: &str, ttl: Duration) -> Result<bool, AppError> {
        self.bounded("set_backend_ttl", self.store.set_backend_ttl(pool, ttl)).await
    }

    pub async fn delete_backend(&self, pool: &str) -> Result<(), AppError> {
        self.bounded("delete_backend", self.store.delete_backend(pool)).await
    }

    pub async fn list_backends(&self, filter: &str) -> Result<Vec<BackendRecord>, AppError> {
        self.bounded("list_backends", self.store.list_backends(filter)).await
    }

    pub async fn set_exclusion_if_absent(&self, record: ExclusionRecord) -> Result<bool, AppError> {
        self.bounded("set_exclusion_if_absent", self.store.set_exclusion_if_absent(record))
            .await
    }

    pub async fn set_exclusion_ttl(&self, pool: &str, ttl: Duration) -> Result<bool, AppError> {
        self.bounded("set_exclusion_ttl", self.store.set_exclusion_ttl(pool, ttl)).await
    }

    pub async fn delete_exclusion(&self, pool: &str) -> Result<(), AppError> {
        self.bounded("delete_exclusion", self.store.delete_exclusion(pool)).await
    }

    pub async fn get_access_timestamp(&self, pool: &str) -> Result<Option<i64>, AppError> {
        self.bounded("get_access_timestamp", self.store.get_access_timestamp(pool)).await
    }

    pub async fn set_access_timestamp(&self, pool: &str, timestamp: i64) -> Result<(), AppError> {
        self.bounded("set_access_timestamp", self.store.set_access_timestamp(pool, timestamp))
            .await
    }
}
