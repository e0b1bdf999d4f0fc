//! Shared fixtures: a delegate that runs `sh` scripts and a registry seeded
//! with test pools.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use poolgate::backend::{
    BackendCommand, BackendDelegate, BackendFactory, DelegateFuture, FailureReason, StartVerdict,
    StdioStream,
};
use poolgate::config::{ManagerConfig, PoolSeed};
use poolgate::error::AppError;
use poolgate::registry::{BackendRecord, MemoryRegistry, PoolRecord, Table};
use poolgate::supervisor::Supervisor;

pub type Script = Arc<dyn Fn(u16) -> String + Send + Sync>;

/// Prints `ready` and stays up until signalled.
pub fn ready_script() -> Script {
    Arc::new(|_: u16| "echo ready; exec sleep 30".to_string())
}

/// Prints `line` and exits.
pub fn one_line_script(line: &'static str) -> Script {
    Arc::new(move |_: u16| format!("echo {line}"))
}

#[derive(Clone)]
pub struct ShFactory {
    pub n_ports: u16,
    pub script: Script,
    pub spawns: Arc<AtomicUsize>,
    pub probe_status: Arc<AtomicU16>,
}

impl ShFactory {
    pub fn new(n_ports: u16, script: Script) -> Self {
        Self {
            n_ports,
            script,
            spawns: Arc::new(AtomicUsize::new(0)),
            probe_status: Arc::new(AtomicU16::new(200)),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn set_probe_status(&self, status: u16) {
        self.probe_status.store(status, Ordering::SeqCst);
    }
}

impl BackendFactory for ShFactory {
    fn kind_name(&self) -> &'static str {
        "sh"
    }

    fn use_n_ports(&self) -> u16 {
        self.n_ports
    }

    fn make_delegate(&self, _pool: &PoolRecord) -> Box<dyn BackendDelegate> {
        Box::new(ShDelegate {
            script: self.script.clone(),
            spawns: self.spawns.clone(),
            probe_status: self.probe_status.clone(),
        })
    }
}

struct ShDelegate {
    script: Script,
    spawns: Arc<AtomicUsize>,
    probe_status: Arc<AtomicU16>,
}

impl BackendDelegate for ShDelegate {
    fn command_line(&self, port: u16, _directory: &str, _record: &BackendRecord) -> BackendCommand {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        BackendCommand {
            argv: vec!["sh".into(), "-c".into(), (self.script)(port)],
            envs: vec![],
        }
    }

    fn check_startup(&self, _stream: StdioStream, lines: &[String]) -> StartVerdict {
        match lines.last().map(String::as_str) {
            Some("ready") => StartVerdict::Started("ready".into()),
            Some("busy") => StartVerdict::ToRetry("busy".into()),
            Some("fatal") => StartVerdict::Failed(FailureReason::Fatal("fatal".into())),
            _ => StartVerdict::Ongoing,
        }
    }

    fn establish<'a>(&'a mut self, _record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    // No control channel: stopping always falls back to SIGTERM.
    fn shutdown<'a>(&'a self, _record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async { Err(AppError::Delegate("no control channel".into())) })
    }

    fn probe<'a>(&'a self, _record: &'a BackendRecord, _timeout: Duration) -> DelegateFuture<'a, u16> {
        let status = self.probe_status.load(Ordering::SeqCst);
        Box::pin(async move { Ok(status) })
    }

    fn list_buckets<'a>(&'a self, _record: &'a BackendRecord) -> DelegateFuture<'a, Vec<String>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn make_bucket<'a>(&'a self, _record: &'a BackendRecord, _bucket: &'a str) -> DelegateFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Fast timings, no privilege wrapper, ports `[min, max]`.
pub fn manager_config(port_min: u16, port_max: u16) -> ManagerConfig {
    ManagerConfig {
        sudo: None,
        port_min,
        port_max,
        start_timeout: Duration::from_secs(5),
        setup_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_miss_tolerance: 1,
        heartbeat_timeout: Duration::from_secs(1),
        backend_record_ttl: Duration::from_secs(10),
        stabilize: Duration::ZERO,
        linger: Duration::ZERO,
        shutdown_grace: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

pub fn seed(id: &str) -> PoolSeed {
    PoolSeed {
        id: id.to_string(),
        owner_uid: "alice".into(),
        owner_gid: "alice".into(),
        directory: PathBuf::from(format!("/tmp/{id}")),
        enabled: true,
        expiration: 4_102_444_800,
        buckets: vec![],
    }
}

pub async fn registry(pools: &[&str]) -> Arc<MemoryRegistry> {
    let store = Arc::new(MemoryRegistry::new());
    let seeds: Vec<PoolSeed> = pools.iter().map(|p| seed(p)).collect();
    store.seed(&seeds).await;
    store
}

pub fn supervisor(
    store: &Arc<MemoryRegistry>,
    factory: &ShFactory,
    conf: ManagerConfig,
    mux_ep: &str,
) -> Supervisor {
    let table = Table::new(store.clone(), Duration::from_secs(1));
    Supervisor::new(table, Arc::new(factory.clone()), conf, mux_ep, CancellationToken::new())
        .expect("valid mux endpoint")
}

/// Poll `check` every 20ms for up to `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
