//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or the path given with `-f`), then applies `POOLGATE_MUX_EP` and
//! `POOLGATE_LOG_LEVEL` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::backend::BackendKind;
use crate::error::AppError;
use crate::supervisor::backoff::RaceBackoff;

/// Timing and resource parameters of the process supervisor.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Privilege-dropping wrapper (`sudo`). `None` spawns backends directly.
    pub sudo: Option<String>,
    /// Inclusive port range handed out to backends.
    pub port_min: u16,
    pub port_max: u16,
    /// Idle budget: a backend with no client access for this long is stopped.
    pub awake_duration: Duration,
    pub start_timeout: Duration,
    pub setup_timeout: Duration,
    /// Bound on backend-native control commands (shutdown, alias setup…).
    pub command_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_tolerance: u32,
    pub heartbeat_timeout: Duration,
    /// TTL put on a READY backend record and refreshed on every heartbeat.
    pub backend_record_ttl: Duration,
    /// Pause between a successful start and `establish`.
    pub stabilize: Duration,
    /// Pause between unregistering a backend and shutting it down.
    pub linger: Duration,
    /// How long whole-service shutdown waits for backends to stop.
    pub shutdown_grace: Duration,
    pub race_backoff: RaceBackoff,
}

impl ManagerConfig {
    /// TTL of the synthetic SUSPENDED record published when no port works.
    pub fn suspension_ttl(&self) -> Duration {
        self.awake_duration / 3
    }

    /// Safety-net TTL on an exclusion record held by a start attempt.
    pub fn exclusion_ttl(&self) -> Duration {
        self.start_timeout * 3
    }

    /// How long a supervisor that lost the exclusion race waits for the winner.
    pub fn race_wait_limit(&self) -> Duration {
        self.start_timeout + self.setup_timeout
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_millis(default_heartbeat_interval_ms());
        Self {
            sudo: Some(default_sudo()),
            port_min: default_port_min(),
            port_max: default_port_max(),
            awake_duration: Duration::from_millis(default_awake_duration_ms()),
            start_timeout: Duration::from_millis(default_start_timeout_ms()),
            setup_timeout: Duration::from_millis(default_setup_timeout_ms()),
            command_timeout: Duration::from_millis(default_command_timeout_ms()),
            heartbeat_interval,
            heartbeat_miss_tolerance: default_heartbeat_miss_tolerance(),
            heartbeat_timeout: Duration::from_millis(default_heartbeat_timeout_ms()),
            backend_record_ttl: heartbeat_interval * 3,
            stabilize: Duration::from_millis(default_stabilize_ms()),
            linger: Duration::from_millis(default_linger_ms()),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            race_backoff: RaceBackoff::default(),
        }
    }
}

/// Registry accessor settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on every registry round-trip.
    pub op_timeout: Duration,
}

/// MinIO executables.
#[derive(Debug, Clone)]
pub struct MinioConfig {
    pub minio: String,
    pub mc: String,
}

/// rclone executable and extra `serve s3` options.
#[derive(Debug, Clone)]
pub struct RcloneConfig {
    pub rclone: String,
    pub command_options: Vec<String>,
}

/// A pool seeded into the in-process registry at startup.
#[derive(Debug, Clone)]
pub struct PoolSeed {
    pub id: String,
    pub owner_uid: String,
    pub owner_gid: String,
    pub directory: PathBuf,
    pub enabled: bool,
    /// Unix seconds.
    pub expiration: i64,
    pub buckets: Vec<String>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This supervisor's own endpoint (`host:port`). Its host part names
    /// the backends it starts.
    pub mux_ep: String,
    pub log_level: String,
    pub backend: BackendKind,
    pub stdio_control: bool,
    pub manager: ManagerConfig,
    pub registry: RegistryConfig,
    pub minio: MinioConfig,
    pub rclone: RcloneConfig,
    pub pools: Vec<PoolSeed>,
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    supervisor: RawSupervisor,
    #[serde(default)]
    manager: RawManager,
    #[serde(default)]
    registry: RawRegistry,
    #[serde(default)]
    minio: RawMinio,
    #[serde(default)]
    rclone: RawRclone,
    #[serde(default, rename = "pool")]
    pools: Vec<RawPool>,
}

#[derive(Deserialize)]
struct RawSupervisor {
    mux_ep: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_backend")]
    backend: String,
    #[serde(default = "default_true")]
    stdio_control: bool,
}

#[derive(Deserialize)]
struct RawManager {
    #[serde(default = "default_sudo")]
    sudo: String,
    #[serde(default = "default_port_min")]
    port_min: u16,
    #[serde(default = "default_port_max")]
    port_max: u16,
    #[serde(default = "default_awake_duration_ms")]
    backend_awake_duration_ms: u64,
    #[serde(default = "default_start_timeout_ms")]
    backend_start_timeout_ms: u64,
    #[serde(default = "default_setup_timeout_ms")]
    backend_setup_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    backend_command_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_miss_tolerance")]
    heartbeat_miss_tolerance: u32,
    #[serde(default = "default_heartbeat_timeout_ms")]
    heartbeat_timeout_ms: u64,
    /// Defaults to three heartbeat intervals.
    #[serde(default)]
    backend_record_ttl_ms: Option<u64>,
    #[serde(default = "default_stabilize_ms")]
    stabilize_ms: u64,
    #[serde(default = "default_linger_ms")]
    linger_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
    #[serde(default)]
    race_backoff: RawRaceBackoff,
}

impl Default for RawManager {
    fn default() -> Self {
        Self {
            sudo: default_sudo(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            backend_awake_duration_ms: default_awake_duration_ms(),
            backend_start_timeout_ms: default_start_timeout_ms(),
            backend_setup_timeout_ms: default_setup_timeout_ms(),
            backend_command_timeout_ms: default_command_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_tolerance: default_heartbeat_miss_tolerance(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            backend_record_ttl_ms: None,
            stabilize_ms: default_stabilize_ms(),
            linger_ms: default_linger_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            race_backoff: RawRaceBackoff::default(),
        }
    }
}

#[derive(Deserialize)]
struct RawRaceBackoff {
    #[serde(default = "default_race_initial_ms")]
    initial_ms: u64,
    #[serde(default = "default_race_factor")]
    factor: u32,
    #[serde(default = "default_race_cap_ms")]
    cap_ms: u64,
}

impl Default for RawRaceBackoff {
    fn default() -> Self {
        Self {
            initial_ms: default_race_initial_ms(),
            factor: default_race_factor(),
            cap_ms: default_race_cap_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawRegistry {
    #[serde(default = "default_registry_op_timeout_ms")]
    op_timeout_ms: u64,
}

impl Default for RawRegistry {
    fn default() -> Self {
        Self { op_timeout_ms: default_registry_op_timeout_ms() }
    }
}

#[derive(Deserialize)]
struct RawMinio {
    #[serde(default = "default_minio")]
    minio: String,
    #[serde(default = "default_mc")]
    mc: String,
}

impl Default for RawMinio {
    fn default() -> Self {
        Self { minio: default_minio(), mc: default_mc() }
    }
}

#[derive(Deserialize)]
struct RawRclone {
    #[serde(default = "default_rclone")]
    rclone: String,
    #[serde(default)]
    command_options: Vec<String>,
}

impl Default for RawRclone {
    fn default() -> Self {
        Self { rclone: default_rclone(), command_options: Vec::new() }
    }
}

#[derive(Deserialize)]
struct RawPool {
    id: String,
    owner_uid: String,
    /// Defaults to the owner's uid.
    #[serde(default)]
    owner_gid: Option<String>,
    directory: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_expiration")]
    expiration: i64,
    #[serde(default)]
    buckets: Vec<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_backend() -> String { "minio".to_string() }
fn default_sudo() -> String { "/usr/bin/sudo".to_string() }
fn default_port_min() -> u16 { 9000 }
fn default_port_max() -> u16 { 9999 }
fn default_awake_duration_ms() -> u64 { 15 * 60 * 1000 }
fn default_start_timeout_ms() -> u64 { 60 * 1000 }
fn default_setup_timeout_ms() -> u64 { 60 * 1000 }
fn default_command_timeout_ms() -> u64 { 30 * 1000 }
fn default_heartbeat_interval_ms() -> u64 { 60 * 1000 }
fn default_heartbeat_miss_tolerance() -> u32 { 3 }
fn default_heartbeat_timeout_ms() -> u64 { 60 * 1000 }
fn default_stabilize_ms() -> u64 { 10 }
fn default_linger_ms() -> u64 { 10 }
fn default_shutdown_grace_ms() -> u64 { 30 * 1000 }
fn default_race_initial_ms() -> u64 { 1 }
fn default_race_factor() -> u32 { 3 }
fn default_race_cap_ms() -> u64 { 1000 }
fn default_registry_op_timeout_ms() -> u64 { 5 * 1000 }
fn default_minio() -> String { "/usr/local/bin/minio".to_string() }
fn default_mc() -> String { "/usr/local/bin/mc".to_string() }
fn default_rclone() -> String { "/usr/local/bin/rclone".to_string() }
// 2100-01-01T00:00:00Z
fn default_expiration() -> i64 { 4_102_444_800 }

fn default_true() -> bool {
    true
}

/// Load config from `path` (default `config/default.toml`), then apply
/// env-var overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let mux_ep_override = env::var("POOLGATE_MUX_EP").ok();
    let log_level_override = env::var("POOLGATE_LOG_LEVEL").ok();
    load_from(
        Path::new(path.unwrap_or("config/default.toml")),
        mux_ep_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    mux_ep_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.supervisor;
    let mux_ep = mux_ep_override.unwrap_or(&s.mux_ep).to_string();
    if mux_ep.rsplit_once(':').is_none() {
        return Err(AppError::Config(format!("mux_ep must be host:port, got '{mux_ep}'")));
    }
    let backend = BackendKind::from_name(&s.backend)
        .ok_or_else(|| AppError::Config(format!("unknown backend '{}'", s.backend)))?;

    let m = parsed.manager;
    if m.port_min > m.port_max {
        return Err(AppError::Config(format!(
            "port_min ({}) exceeds port_max ({})",
            m.port_min, m.port_max
        )));
    }
    let b = &m.race_backoff;
    for (name, value) in [("initial_ms", b.initial_ms), ("factor", u64::from(b.factor)), ("cap_ms", b.cap_ms)] {
        if value == 0 {
            return Err(AppError::Config(format!("race_backoff.{name} must be positive")));
        }
    }
    let heartbeat_interval = Duration::from_millis(m.heartbeat_interval_ms);
    let manager = ManagerConfig {
        sudo: Some(m.sudo).filter(|s| !s.is_empty()),
        port_min: m.port_min,
        port_max: m.port_max,
        awake_duration: Duration::from_millis(m.backend_awake_duration_ms),
        start_timeout: Duration::from_millis(m.backend_start_timeout_ms),
        setup_timeout: Duration::from_millis(m.backend_setup_timeout_ms),
        command_timeout: Duration::from_millis(m.backend_command_timeout_ms),
        heartbeat_interval,
        heartbeat_miss_tolerance: m.heartbeat_miss_tolerance,
        heartbeat_timeout: Duration::from_millis(m.heartbeat_timeout_ms),
        backend_record_ttl: m
            .backend_record_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(heartbeat_interval * 3),
        stabilize: Duration::from_millis(m.stabilize_ms),
        linger: Duration::from_millis(m.linger_ms),
        shutdown_grace: Duration::from_millis(m.shutdown_grace_ms),
        race_backoff: RaceBackoff {
            initial: Duration::from_millis(m.race_backoff.initial_ms),
            factor: m.race_backoff.factor,
            cap: Duration::from_millis(m.race_backoff.cap_ms),
        },
    };

    let pools = parsed
        .pools
        .into_iter()
        .map(|p| PoolSeed {
            owner_gid: p.owner_gid.unwrap_or_else(|| p.owner_uid.clone()),
            id: p.id,
            owner_uid: p.owner_uid,
            directory: expand_home(&p.directory),
            enabled: p.enabled,
            expiration: p.expiration,
            buckets: p.buckets,
        })
        .collect();

    Ok(Config {
        mux_ep,
        log_level: log_level_override.unwrap_or(&s.log_level).to_string(),
        backend,
        stdio_control: s.stdio_control,
        manager,
        registry: RegistryConfig {
            op_timeout: Duration::from_millis(parsed.registry.op_timeout_ms),
        },
        minio: MinioConfig { minio: parsed.minio.minio, mc: parsed.minio.mc },
        rclone: RcloneConfig {
            rclone: parsed.rclone.rclone,
            command_options: parsed.rclone.command_options,
        },
        pools,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
