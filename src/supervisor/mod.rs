//! Process Supervisor: starts backend processes on demand and keeps at
//! most one running per pool across every supervisor sharing a registry.
//!
//! # Start sequence
//!
//! [`Supervisor::start_backend`] returns an already-registered backend when
//! there is one. Otherwise it takes the pool's exclusion record; a loser of
//! that race polls for the winner's result instead. The holder walks a
//! shuffled list of free port blocks, spawns the backend on each until the
//! startup protocol gives a verdict, and registers the first that starts.
//! When no port works it publishes a short-lived SUSPENDED record.
//!
//! # Local state
//!
//! The handle table maps pools to the backends this process runs. It also
//! holds port blocks reserved by in-flight starts, so concurrent local
//! starts never try the same block. A stopping backend leaves the handle
//! table before its record is deleted, but its block stays taken until the
//! process is reaped. Once shutdown begins the table refuses new entries.

pub mod adapters;
pub mod backoff;
pub mod exclusion;
pub mod heartbeat;
pub mod process;
pub mod startup;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendDelegate, BackendFactory, FailureReason, StartVerdict, generate_access_key,
    generate_secret_key, minimal_environ,
};
use crate::config::ManagerConfig;
use crate::error::AppError;
use crate::registry::{BackendRecord, BackendState, PoolReason, PoolRecord, Table, now_unix};
use startup::StdioLine;

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Why `start_backend` returned without an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// A SUSPENDED record is in place.
    Suspended(PoolReason),
    /// Another supervisor held the exclusion and produced nothing in time.
    RaceTimeout,
    Failed(FailureReason),
    NoPool,
    ShuttingDown,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::Suspended(reason) => write!(f, "suspended ({reason})"),
            Unavailable::RaceTimeout => f.write_str("timed out waiting for another supervisor"),
            Unavailable::Failed(reason) => write!(f, "start failed ({reason})"),
            Unavailable::NoPool => f.write_str("no such pool"),
            Unavailable::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Ready(BackendRecord),
    Unavailable(Unavailable),
}

/// A backend run by this supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningBackend {
    pub pool: String,
    pub port: u16,
    pub pid: u32,
}

// ── Local handle table ────────────────────────────────────────────────────────

struct LocalHandle {
    port: u16,
    pid: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct LocalTable {
    handles: HashMap<String, LocalHandle>,
    reserved: HashSet<u16>,
    /// Base ports of backends between release and reaping.
    stopping: HashSet<u16>,
    shutting_down: bool,
}

impl LocalTable {
    fn ports_in_use(&self, n: u16) -> HashSet<u16> {
        let mut used = self.reserved.clone();
        for h in self.handles.values() {
            used.extend(port_block(h.port, n));
        }
        for port in &self.stopping {
            used.extend(port_block(*port, n));
        }
        used
    }

    fn take_handle(&mut self, pool: &str, pid: u32) -> Option<u16> {
        match self.handles.get(pool) {
            Some(h) if h.pid == pid => self.handles.remove(pool).map(|h| h.port),
            _ => None,
        }
    }
}

fn port_block(port: u16, n: u16) -> impl Iterator<Item = u16> {
    (0..n).filter_map(move |i| port.checked_add(i))
}

/// Start ports of every `n`-port block in `[min, max]` not touching `used`,
/// in random order. Blocks start at multiples of `n`.
pub fn list_candidate_ports(min: u16, max: u16, n: u16, used: &HashSet<u16>) -> Vec<u16> {
    let n = n.max(1);
    let mut ports: Vec<u16> = (min..=max)
        .filter(|p| p % n == 0 && u32::from(*p) + u32::from(n) - 1 <= u32::from(max))
        .filter(|p| port_block(*p, n).all(|q| !used.contains(&q)))
        .collect();
    ports.shuffle(&mut rand::thread_rng());
    ports
}

// ── Supervisor ────────────────────────────────────────────────────────────────

struct Inner {
    table: Table,
    factory: Arc<dyn BackendFactory>,
    conf: ManagerConfig,
    mux_ep: String,
    mux_host: String,
    mux_pid: u32,
    environ: Vec<(String, String)>,
    local: Mutex<LocalTable>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    fatal: OnceLock<String>,
}

/// Explicitly constructed and passed to request handlers and heartbeat
/// tasks. Clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// A backend that passed the startup protocol and awaits registration.
struct Started {
    record: BackendRecord,
    delegate: Box<dyn BackendDelegate>,
    child: Child,
    lines: mpsc::Receiver<StdioLine>,
}

enum Attempt {
    Started(Started),
    Retry,
    Failed(FailureReason),
}

impl Supervisor {
    /// `mux_ep` is this supervisor's `host:port`; backends are published
    /// under its host. Cancelling `shutdown` stops every backend.
    pub fn new(
        table: Table,
        factory: Arc<dyn BackendFactory>,
        conf: ManagerConfig,
        mux_ep: &str,
        shutdown: CancellationToken,
    ) -> Result<Self, AppError> {
        let (host, _) = mux_ep
            .rsplit_once(':')
            .ok_or_else(|| AppError::Config(format!("mux_ep must be host:port, got '{mux_ep}'")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                table,
                factory,
                conf,
                mux_ep: mux_ep.to_string(),
                mux_host: host.to_string(),
                mux_pid: std::process::id(),
                environ: minimal_environ(),
                local: Mutex::new(LocalTable::default()),
                shutdown,
                tracker: TaskTracker::new(),
                fatal: OnceLock::new(),
            }),
        })
    }

    pub fn table(&self) -> &Table {
        &self.inner.table
    }

    pub fn conf(&self) -> &ManagerConfig {
        &self.inner.conf
    }

    pub fn mux_ep(&self) -> &str {
        &self.inner.mux_ep
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Ensure a backend runs for `pool`. Idempotent: a registered backend is
    /// returned without spawning anything.
    pub async fn start_backend(&self, pool: &str) -> Result<StartOutcome, AppError> {
        if self.inner.local.lock().await.shutting_down {
            return Ok(StartOutcome::Unavailable(Unavailable::ShuttingDown));
        }
        if let Some(outcome) = self.registered(pool).await? {
            return Ok(outcome);
        }
        let guard = exclusion::acquire(
            &self.inner.table,
            pool,
            &self.inner.mux_ep,
            self.inner.conf.exclusion_ttl(),
        )
        .await?;
        let Some(guard) = guard else {
            return self.wait_for_backend_by_race(pool).await;
        };
        let result = self.start_exclusively(pool).await;
        let released = guard.release().await;
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    /// The outcome implied by an existing backend record, if any.
    async fn registered(&self, pool: &str) -> Result<Option<StartOutcome>, AppError> {
        Ok(self.inner.table.get_backend(pool).await?.map(|record| match record.state {
            BackendState::Ready => StartOutcome::Ready(record),
            BackendState::Suspended => {
                StartOutcome::Unavailable(Unavailable::Suspended(record.reason))
            }
        }))
    }

    /// Poll for the record of the supervisor that won the exclusion race.
    async fn wait_for_backend_by_race(&self, pool: &str) -> Result<StartOutcome, AppError> {
        let conf = &self.inner.conf;
        let deadline = Instant::now() + conf.race_wait_limit();
        debug!(pool = %pool, "exclusion taken; waiting for its holder");
        for delay in conf.race_backoff.delays() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => {
                    return Ok(StartOutcome::Unavailable(Unavailable::ShuttingDown));
                }
                _ = tokio::time::sleep(delay.min(deadline - now)) => {}
            }
            if let Some(outcome) = self.registered(pool).await? {
                return Ok(outcome);
            }
        }
        warn!(pool = %pool, "gave up waiting for another supervisor's backend");
        Ok(StartOutcome::Unavailable(Unavailable::RaceTimeout))
    }

    async fn start_exclusively(&self, pool: &str) -> Result<StartOutcome, AppError> {
        // Another supervisor may have finished between the first check and
        // the exclusion.
        if let Some(outcome) = self.registered(pool).await? {
            return Ok(outcome);
        }
        let Some(pool_record) = self.inner.table.get_pool(pool).await? else {
            return Ok(StartOutcome::Unavailable(Unavailable::NoPool));
        };

        let ports = self.candidate_ports().await?;
        if ports.is_empty() {
            return self.suspend(pool, PoolReason::NoPorts).await;
        }
        for port in ports {
            if !self.reserve(port).await {
                continue;
            }
            let outcome = match self.try_start(&pool_record, port).await {
                Ok(Attempt::Started(started)) => Some(self.register(port, started).await),
                Ok(Attempt::Retry) => None,
                Ok(Attempt::Failed(reason)) => Some(self.fail(pool, reason).await),
                Err(e) => Some(Err(e)),
            };
            self.unreserve(port).await;
            if let Some(result) = outcome {
                return result;
            }
        }
        self.suspend(pool, PoolReason::ServerBusy).await
    }

    async fn candidate_ports(&self) -> Result<Vec<u16>, AppError> {
        let n = self.inner.factory.use_n_ports();
        let mut used = HashSet::new();
        for record in self.inner.table.list_backends("*").await? {
            if record.state != BackendState::Ready || record.host() != self.inner.mux_host {
                continue;
            }
            if let Some(port) = record.port() {
                used.extend(port_block(port, n));
            }
        }
        used.extend(self.inner.local.lock().await.ports_in_use(n));
        let conf = &self.inner.conf;
        Ok(list_candidate_ports(conf.port_min, conf.port_max, n, &used))
    }

    async fn reserve(&self, port: u16) -> bool {
        let n = self.inner.factory.use_n_ports();
        let mut local = self.inner.local.lock().await;
        let used = local.ports_in_use(n);
        if port_block(port, n).any(|p| used.contains(&p)) {
            return false;
        }
        local.reserved.extend(port_block(port, n));
        true
    }

    async fn unreserve(&self, port: u16) {
        let n = self.inner.factory.use_n_ports();
        let mut local = self.inner.local.lock().await;
        for p in port_block(port, n) {
            local.reserved.remove(&p);
        }
    }

    /// Spawn a backend on `port` and run the startup protocol on it.
    async fn try_start(&self, pool: &PoolRecord, port: u16) -> Result<Attempt, AppError> {
        let conf = &self.inner.conf;
        let delegate = self.inner.factory.make_delegate(pool);
        let mut record = BackendRecord {
            pool: pool.pool.clone(),
            backend_ep: format!("{}:{port}", self.inner.mux_host),
            backend_pid: 0,
            state: BackendState::Ready,
            reason: PoolReason::Normal,
            root_access: generate_access_key(),
            root_secret: generate_secret_key(),
            mux_ep: self.inner.mux_ep.clone(),
            mux_pid: self.inner.mux_pid,
            timestamp: now_unix(),
        };
        let command = delegate.command_line(port, &pool.directory, &record);
        let spawned = process::spawn_backend(
            conf.sudo.as_deref(),
            &pool.owner_uid,
            &pool.owner_gid,
            &command,
            &self.inner.environ,
        );
        let mut spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(pool = %pool.pool, port, "cannot spawn backend: {e}");
                return Ok(Attempt::Failed(FailureReason::Exec(e.to_string())));
            }
        };
        record.backend_pid = spawned.pid;
        debug!(pool = %pool.pool, port, pid = spawned.pid, "backend spawned");

        let startup = startup::await_startup(
            &mut spawned.lines,
            |stream, lines| delegate.check_startup(stream, lines),
            conf.start_timeout,
        )
        .await;
        startup.drain_to_log(&pool.pool);

        let reason = match startup.verdict {
            StartVerdict::Started(message) => {
                info!(pool = %pool.pool, port, pid = spawned.pid, %message, "backend started");
                return Ok(Attempt::Started(Started {
                    record,
                    delegate,
                    child: spawned.child,
                    lines: spawned.lines,
                }));
            }
            StartVerdict::ToRetry(message) => {
                debug!(pool = %pool.pool, port, %message, "port in use; trying next");
                None
            }
            StartVerdict::Failed(reason) => {
                warn!(pool = %pool.pool, port, reason = %reason, "backend failed to start");
                Some(reason)
            }
            StartVerdict::Ongoing => {
                return Err(AppError::Invariant("startup ended without a verdict".into()));
            }
        };
        startup::spawn_drain(pool.pool.clone(), spawned.lines);
        process::discard(&mut spawned.child, spawned.pid, conf.command_timeout).await;
        Ok(match reason {
            None => Attempt::Retry,
            Some(reason) => Attempt::Failed(reason),
        })
    }

    /// Insert the handle, set the backend up, publish it as READY, and
    /// start its heartbeat.
    async fn register(&self, port: u16, started: Started) -> Result<StartOutcome, AppError> {
        let conf = &self.inner.conf;
        let Started { mut record, mut delegate, mut child, lines } = started;
        let pool = record.pool.clone();
        let pid = record.backend_pid;
        let cancel = self.inner.shutdown.child_token();

        startup::spawn_drain(pool.clone(), lines);
        {
            let mut local = self.inner.local.lock().await;
            if local.shutting_down {
                drop(local);
                info!(pool = %pool, "shutting down; discarding fresh backend");
                process::discard(&mut child, pid, conf.command_timeout).await;
                return Ok(StartOutcome::Unavailable(Unavailable::ShuttingDown));
            }
            local
                .handles
                .insert(pool.clone(), LocalHandle { port, pid, cancel: cancel.clone() });
        }

        if let Err(e) = self.set_up(&record, delegate.as_mut()).await {
            self.forget(&pool, pid).await;
            process::discard(&mut child, pid, conf.command_timeout).await;
            if e.is_fatal() {
                return Err(e);
            }
            warn!(pool = %pool, "backend setup failed: {e}");
            return Ok(StartOutcome::Unavailable(Unavailable::Failed(FailureReason::Setup(
                e.to_string(),
            ))));
        }

        // Before the monitor exists; its stop deletes the record.
        record.timestamp = now_unix();
        if let Err(e) = self
            .inner
            .table
            .set_backend(record.clone(), Some(conf.backend_record_ttl))
            .await
        {
            self.forget(&pool, pid).await;
            process::discard(&mut child, pid, conf.command_timeout).await;
            return Err(e);
        }
        info!(pool = %pool, ep = %record.backend_ep, pid, "backend ready");

        let monitor = heartbeat::Monitor {
            record: record.clone(),
            delegate: Arc::from(delegate),
            child,
            cancel,
        };
        self.inner.tracker.spawn(heartbeat::run(self.clone(), monitor));
        Ok(StartOutcome::Ready(record))
    }

    async fn set_up(
        &self,
        record: &BackendRecord,
        delegate: &mut dyn BackendDelegate,
    ) -> Result<(), AppError> {
        let conf = &self.inner.conf;
        tokio::time::sleep(conf.stabilize).await;
        tokio::time::timeout(conf.setup_timeout, delegate.establish(record))
            .await
            .map_err(|_| AppError::Delegate("establish timed out".into()))??;
        self.reconcile_buckets(record, delegate).await
    }

    /// Create, in the backend, every unexpired bucket recorded for the pool
    /// that the backend does not have.
    async fn reconcile_buckets(
        &self,
        record: &BackendRecord,
        delegate: &dyn BackendDelegate,
    ) -> Result<(), AppError> {
        let now = now_unix();
        let expected: Vec<String> = self
            .inner
            .table
            .list_buckets(&record.pool)
            .await?
            .into_iter()
            .filter(|b| b.expiration > now)
            .map(|b| b.bucket)
            .collect();
        if expected.is_empty() {
            return Ok(());
        }
        let present = match delegate.list_buckets(record).await {
            Ok(present) => present,
            Err(e) => {
                warn!(pool = %record.pool, "cannot list backend buckets: {e}");
                return Ok(());
            }
        };
        for bucket in expected.iter().filter(|b| !present.contains(b)) {
            match delegate.make_bucket(record, bucket).await {
                Ok(()) => info!(pool = %record.pool, bucket = %bucket, "bucket restored"),
                Err(e) => warn!(pool = %record.pool, bucket = %bucket, "cannot make bucket: {e}"),
            }
        }
        Ok(())
    }

    /// Record a failed start; the backend's own fatal output marks the
    /// pool inoperable.
    async fn fail(&self, pool: &str, reason: FailureReason) -> Result<StartOutcome, AppError> {
        if reason.is_persistent() {
            if let Some(mut record) = self.inner.table.get_pool(pool).await? {
                record.inoperable = true;
                record.reason = reason.to_string();
                self.inner.table.set_pool(record).await?;
                warn!(pool = %pool, reason = %reason, "pool marked inoperable");
            }
        }
        Ok(StartOutcome::Unavailable(Unavailable::Failed(reason)))
    }

    /// Publish a synthetic SUSPENDED record that expires on its own.
    async fn suspend(&self, pool: &str, reason: PoolReason) -> Result<StartOutcome, AppError> {
        let record = BackendRecord {
            pool: pool.to_string(),
            backend_ep: String::new(),
            backend_pid: 0,
            state: BackendState::Suspended,
            reason,
            root_access: String::new(),
            root_secret: String::new(),
            mux_ep: self.inner.mux_ep.clone(),
            mux_pid: self.inner.mux_pid,
            timestamp: now_unix(),
        };
        self.inner
            .table
            .set_backend(record, Some(self.inner.conf.suspension_ttl()))
            .await?;
        warn!(pool = %pool, reason = %reason, "backend suspended");
        Ok(StartOutcome::Unavailable(Unavailable::Suspended(reason)))
    }

    /// Drop a pool's handle if it still belongs to `pid`. A newer start of
    /// the same pool may already own the slot.
    pub(crate) async fn forget(&self, pool: &str, pid: u32) {
        self.inner.local.lock().await.take_handle(pool, pid);
    }

    /// Take a stopping backend out of the handle table, keeping its port
    /// block taken until [`Supervisor::settle`].
    pub(crate) async fn release(&self, pool: &str, pid: u32) -> Option<u16> {
        let mut local = self.inner.local.lock().await;
        let port = local.take_handle(pool, pid)?;
        local.stopping.insert(port);
        Some(port)
    }

    /// Free the port block of a reaped backend.
    pub(crate) async fn settle(&self, port: u16) {
        self.inner.local.lock().await.stopping.remove(&port);
    }

    /// Backends run by this supervisor, sorted by pool.
    pub async fn running_backends(&self) -> Vec<RunningBackend> {
        let local = self.inner.local.lock().await;
        let mut running: Vec<RunningBackend> = local
            .handles
            .iter()
            .map(|(pool, h)| RunningBackend { pool: pool.clone(), port: h.port, pid: h.pid })
            .collect();
        running.sort_by(|a, b| a.pool.cmp(&b.pool));
        running
    }

    /// Refuse new starts, stop every backend, and wait up to `grace` for
    /// them. Returns `false` if some were still stopping.
    pub async fn stop_all(&self, grace: Duration) -> bool {
        let tokens: Vec<CancellationToken> = {
            let mut local = self.inner.local.lock().await;
            local.shutting_down = true;
            local.handles.values().map(|h| h.cancel.clone()).collect()
        };
        info!(count = tokens.len(), "stopping backends");
        for token in tokens {
            token.cancel();
        }
        self.inner.tracker.close();
        let drained = tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_ok();
        if !drained {
            warn!(grace_ms = grace.as_millis() as u64, "backends still stopping after grace period");
        }
        drained
    }

    /// Abort the service on an unrecoverable error. The first reason wins.
    pub fn fatal(&self, err: &AppError) {
        error!(error = %err, "fatal error; shutting down");
        let _ = self.inner.fatal.set(err.to_string());
        self.inner.shutdown.cancel();
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.inner.fatal.get().map(String::as_str)
    }

    pub fn kind_name(&self) -> &'static str {
        self.inner.factory.kind_name()
    }

    pub fn clean_at_exit(&self) {
        self.inner.factory.clean_at_exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_aligned_blocks_in_range() {
        let ports = list_candidate_ports(9000, 9009, 2, &HashSet::new());
        let mut sorted = ports.clone();
        sorted.sort();
        assert_eq!(sorted, vec![9000, 9002, 9004, 9006, 9008]);
    }

    #[test]
    fn candidates_skip_blocks_touching_used_ports() {
        let used: HashSet<u16> = [9003, 9004].into_iter().collect();
        let mut ports = list_candidate_ports(9000, 9009, 2, &used);
        ports.sort();
        assert_eq!(ports, vec![9000, 9006, 9008]);
    }

    #[test]
    fn block_must_fit_below_max() {
        let mut ports = list_candidate_ports(9001, 9004, 2, &HashSet::new());
        ports.sort();
        assert_eq!(ports, vec![9002]);
        assert!(list_candidate_ports(9001, 9001, 2, &HashSet::new()).is_empty());
    }

    #[test]
    fn single_port_blocks() {
        let used: HashSet<u16> = [9001].into_iter().collect();
        let mut ports = list_candidate_ports(9000, 9003, 1, &used);
        ports.sort();
        assert_eq!(ports, vec![9000, 9002, 9003]);
    }

    #[test]
    fn top_of_port_space_does_not_overflow() {
        let ports = list_candidate_ports(65534, 65535, 2, &HashSet::new());
        assert_eq!(ports, vec![65534]);
    }

    #[test]
    fn unavailable_text() {
        assert_eq!(
            Unavailable::Suspended(PoolReason::ServerBusy).to_string(),
            "suspended (server busy)"
        );
        assert_eq!(Unavailable::ShuttingDown.to_string(), "shutting down");
    }
}
