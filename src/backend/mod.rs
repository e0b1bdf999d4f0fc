//! Backend delegates — per-kind strategies for S3 server processes.
//!
//! # Delegate model
//!
//! A [`BackendFactory`] is built once per service from the configured
//! [`BackendKind`]. For every start attempt it hands out a fresh
//! [`BackendDelegate`], which owns whatever the attempt generates (control
//! channel credentials, a client config directory). Dropping the delegate
//! discards them.
//!
//! The supervisor drives a delegate through a fixed sequence:
//! `command_line` → `check_startup` (repeatedly) → `establish` → `probe`
//! (per heartbeat) → `shutdown`.

pub mod minio;
pub mod rclone;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::{MinioConfig, RcloneConfig};
use crate::error::AppError;
use crate::registry::{BackendRecord, PoolRecord};

// ── Startup classification ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioStream {
    Stdout,
    Stderr,
}

impl fmt::Display for StdioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioStream::Stdout => f.write_str("stdout"),
            StdioStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Why a start attempt ended without a running backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The executable could not be spawned.
    Exec(String),
    /// Both stdio streams closed without a verdict.
    PipeClosed,
    /// A stream produced more lines than the startup cap.
    Flooding,
    Timeout,
    /// The backend reported a fatal condition itself.
    Fatal(String),
    /// The backend started but post-start setup failed.
    Setup(String),
}

impl FailureReason {
    /// Only the backend's own fatal output marks a pool inoperable.
    pub fn is_persistent(&self) -> bool {
        matches!(self, FailureReason::Fatal(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exec(e) => write!(f, "exec failed: {e}"),
            FailureReason::PipeClosed => f.write_str("pipe closed"),
            FailureReason::Flooding => f.write_str("flooding"),
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Fatal(m) => write!(f, "backend fatal: {m}"),
            FailureReason::Setup(m) => write!(f, "setup failed: {m}"),
        }
    }
}

/// Verdict on the output a backend has produced so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartVerdict {
    Ongoing,
    Started(String),
    /// Benign failure (port taken); the next port may work.
    ToRetry(String),
    Failed(FailureReason),
}

// ── Delegate ──────────────────────────────────────────────────────────────────

/// Argv and extra environment of a backend process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCommand {
    pub argv: Vec<String>,
    pub envs: Vec<(String, String)>,
}

/// A boxed future returned by [`BackendDelegate`] operations.
pub type DelegateFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

/// Kind-specific capability set of one backend instance.
///
/// `record` always describes the instance being driven: its endpoint and
/// root credentials are filled in before `command_line` is called.
pub trait BackendDelegate: Send + Sync {
    fn command_line(&self, port: u16, directory: &str, record: &BackendRecord) -> BackendCommand;

    /// Classify the accumulated lines of one stream.
    fn check_startup(&self, stream: StdioStream, lines: &[String]) -> StartVerdict;

    /// Post-start initialisation.
    fn establish<'a>(&'a mut self, record: &'a BackendRecord) -> DelegateFuture<'a, ()>;

    /// Graceful stop via a backend-native control operation.
    fn shutdown<'a>(&'a self, record: &'a BackendRecord) -> DelegateFuture<'a, ()>;

    /// Cheap liveness check returning an HTTP status.
    fn probe<'a>(&'a self, record: &'a BackendRecord, timeout: Duration) -> DelegateFuture<'a, u16>;

    fn list_buckets<'a>(&'a self, record: &'a BackendRecord) -> DelegateFuture<'a, Vec<String>>;

    fn make_bucket<'a>(&'a self, record: &'a BackendRecord, bucket: &'a str) -> DelegateFuture<'a, ()>;
}

/// Builds delegates of one backend kind.
pub trait BackendFactory: Send + Sync {
    fn kind_name(&self) -> &'static str;

    /// Ports per instance: 1, or 2 when a control channel sits at `port + 1`.
    fn use_n_ports(&self) -> u16;

    fn make_delegate(&self, pool: &PoolRecord) -> Box<dyn BackendDelegate>;

    /// Remove leftovers of this kind at service exit.
    fn clean_at_exit(&self) {}
}

// ── BackendKind ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Single endpoint.
    Minio,
    /// Data endpoint plus a control channel.
    Rclone,
}

impl BackendKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "minio" => Some(BackendKind::Minio),
            "rclone" => Some(BackendKind::Rclone),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Minio => "minio",
            BackendKind::Rclone => "rclone",
        }
    }

    pub fn use_n_ports(&self) -> u16 {
        match self {
            BackendKind::Minio => 1,
            BackendKind::Rclone => 2,
        }
    }
}

/// Context every delegate carries.
#[derive(Debug, Clone)]
pub struct DelegateContext {
    pub command_timeout: Duration,
    /// Environment for control commands.
    pub environ: Vec<(String, String)>,
}

/// The production factory: dispatches on [`BackendKind`].
pub struct KindFactory {
    kind: BackendKind,
    minio: MinioConfig,
    rclone: RcloneConfig,
    context: DelegateContext,
}

impl KindFactory {
    pub fn new(
        kind: BackendKind,
        minio: MinioConfig,
        rclone: RcloneConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            minio,
            rclone,
            context: DelegateContext { command_timeout, environ: minimal_environ() },
        }
    }
}

impl BackendFactory for KindFactory {
    fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    fn use_n_ports(&self) -> u16 {
        self.kind.use_n_ports()
    }

    fn make_delegate(&self, pool: &PoolRecord) -> Box<dyn BackendDelegate> {
        match self.kind {
            BackendKind::Minio => Box::new(minio::MinioDelegate::new(
                &pool.pool,
                self.minio.clone(),
                self.context.clone(),
            )),
            BackendKind::Rclone => Box::new(rclone::RcloneDelegate::new(
                &pool.pool,
                &pool.directory,
                self.rclone.clone(),
                self.context.clone(),
            )),
        }
    }

    fn clean_at_exit(&self) {
        match self.kind {
            BackendKind::Minio => minio::clean_config_dirs(),
            BackendKind::Rclone => {}
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────────────────

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A random alphanumeric string whose first character is a letter.
pub fn random_key(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut key = String::with_capacity(len);
    if len == 0 {
        return key;
    }
    key.push(LETTERS[rng.gen_range(0..LETTERS.len())] as char);
    key.extend((1..len).map(|_| rng.sample(Alphanumeric) as char));
    key
}

pub fn generate_access_key() -> String {
    random_key(20)
}

pub fn generate_secret_key() -> String {
    random_key(48)
}

// ── Environment ───────────────────────────────────────────────────────────────

const PASSED_ENV: &[&str] =
    &["HOME", "LANG", "LC_CTYPE", "LOGNAME", "PATH", "SHELL", "USER", "USERNAME"];

/// The subset of this process's environment passed on to children.
pub fn minimal_environ() -> Vec<(String, String)> {
    filter_environ(std::env::vars())
}

fn filter_environ(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut kept: Vec<(String, String)> =
        vars.filter(|(k, _)| PASSED_ENV.contains(&k.as_str())).collect();
    kept.sort();
    kept
}

// ── Control commands ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a short-lived control command, killing it if `timeout` passes.
pub async fn run_control_command(
    argv: &[String],
    environ: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, AppError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(AppError::Delegate("empty command line".into()));
    };
    let child = Command::new(program)
        .args(args)
        .env_clear()
        .envs(environ.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Delegate(format!("cannot run {program}: {e}")))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            AppError::Delegate(format!("{program} timed out after {}ms", timeout.as_millis()))
        })?
        .map_err(|e| AppError::Delegate(format!("{program} failed: {e}")))?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(program = %program, status = %output.status, "control command done");
    Ok(result)
}

/// Decode a stream of concatenated JSON values.
pub fn decode_json_stream(text: &str) -> Result<Vec<serde_json::Value>, String> {
    let mut values = Vec::new();
    for value in serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>() {
        values.push(value.map_err(|e| format!("bad json: {e}"))?);
    }
    Ok(values)
}

/// Decode one log line as a JSON object of type `T`; non-JSON lines are
/// skipped by callers.
pub fn decode_json_line<T: for<'de> Deserialize<'de>>(line: &str) -> Option<T> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
