//! rclone delegate — `rclone serve s3` with a remote-control channel.
//!
//! The data endpoint listens on the allocated port and the rc channel on
//! `port + 1`, guarded by credentials generated per delegate. rclone logs
//! plain text on stderr, which is what startup classification reads.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    BackendCommand, BackendDelegate, DelegateContext, DelegateFuture, FailureReason, StartVerdict,
    StdioStream, random_key, run_control_command,
};
use crate::config::RcloneConfig;
use crate::error::AppError;
use crate::registry::BackendRecord;

const DATE_TIME: &str = r"\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}";
const URL: &str = r"http://([^:]*|\[[^\]]*\]):([0-9]*)/";

static EXPECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{DATE_TIME} NOTICE: Local file system at [^:]*: Starting s3 server on \[{URL}\]$"
    ))
    .expect("expected-message regex is valid")
});

static S3_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{DATE_TIME} Failed to s3: (.*)$")).expect("s3 failure regex is valid")
});

static RC_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{DATE_TIME} Failed to start remote control: (.*)$"))
        .expect("rc failure regex is valid")
});

static PORT_IN_USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^failed to init server: listen tcp :[0-9]*: bind: address already in use$")
        .expect("port-in-use regex is valid")
});

static CONTROL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{DATE_TIME} NOTICE: Serving remote control on {URL}$"))
        .expect("control-message regex is valid")
});

/// A failure line decides the verdict by its cause; only a bind conflict
/// is retryable.
fn failure_verdict(line: &str, re: &Regex) -> StartVerdict {
    let cause = re
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();
    if PORT_IN_USE_RE.is_match(cause) {
        StartVerdict::ToRetry(line.to_string())
    } else {
        StartVerdict::Failed(FailureReason::Fatal(line.to_string()))
    }
}

fn classify(lines: &[String]) -> StartVerdict {
    for re in [&*S3_FAILURE_RE, &*RC_FAILURE_RE] {
        if let Some(line) = lines.iter().find(|l| re.is_match(l)) {
            return failure_verdict(line, re);
        }
    }
    match lines.iter().find(|l| EXPECTED_RE.is_match(l)) {
        Some(line) => {
            if !lines.iter().any(|l| CONTROL_RE.is_match(l)) {
                warn!("rclone started without a remote control notice");
            }
            StartVerdict::Started(line.clone())
        }
        None => StartVerdict::Ongoing,
    }
}

/// rc replies with one JSON object, carrying an `error` string on failure.
fn simplify_rc_reply(stdout: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(stdout.trim()).map_err(|e| format!("bad json: {e}"))?;
    match value.get("error") {
        None | Some(Value::Null) => Ok(value),
        Some(Value::String(msg)) => Err(msg.clone()),
        Some(other) => Err(format!("non-string error: {other}")),
    }
}

/// Control-channel credentials. Owned by the delegate and dropped with it.
struct RcCredentials {
    user: String,
    pass: String,
}

pub struct RcloneDelegate {
    pool: String,
    directory: String,
    conf: RcloneConfig,
    context: DelegateContext,
    rc: RcCredentials,
    client: reqwest::Client,
}

impl RcloneDelegate {
    pub fn new(pool: &str, directory: &str, conf: RcloneConfig, context: DelegateContext) -> Self {
        Self {
            pool: pool.to_string(),
            directory: directory.to_string(),
            conf,
            context,
            rc: RcCredentials { user: random_key(10), pass: random_key(20) },
            client: reqwest::Client::new(),
        }
    }

    fn rc_url(record: &BackendRecord) -> Result<String, AppError> {
        let port = record
            .port()
            .ok_or_else(|| AppError::Delegate(format!("bad endpoint '{}'", record.backend_ep)))?;
        Ok(format!("http://{}:{}/", record.host(), port + 1))
    }

    async fn rc(&self, record: &BackendRecord, command: &str, params: &[String]) -> Result<Value, AppError> {
        let mut argv = vec![
            self.conf.rclone.clone(),
            "rc".to_string(),
            "--url".to_string(),
            Self::rc_url(record)?,
            "--user".to_string(),
            self.rc.user.clone(),
            "--pass".to_string(),
            self.rc.pass.clone(),
            command.to_string(),
        ];
        argv.extend(params.iter().cloned());
        let out =
            run_control_command(&argv, &self.context.environ, self.context.command_timeout).await?;
        if !out.success && out.stdout.trim().is_empty() {
            error!(pool = %self.pool, cmd = command, stderr = %out.stderr.trim(), "rc command failed");
            return Err(AppError::Delegate(format!("rc {command}: {}", out.stderr.trim())));
        }
        simplify_rc_reply(&out.stdout).map_err(|cause| {
            error!(pool = %self.pool, cmd = command, stderr = %out.stderr.trim(), "rc command failed");
            AppError::Delegate(format!("rc {command}: {cause}"))
        })
    }
}

impl BackendDelegate for RcloneDelegate {
    fn command_line(&self, port: u16, directory: &str, record: &BackendRecord) -> BackendCommand {
        let mut argv = vec![
            self.conf.rclone.clone(),
            "serve".into(),
            "s3".into(),
            directory.to_string(),
            "--config".into(),
            "notfound".into(),
            "--addr".into(),
            format!(":{port}"),
            "--auth-key".into(),
            format!("{},{}", record.root_access, record.root_secret),
            "--rc".into(),
            "--rc-addr".into(),
            format!(":{}", port + 1),
            "--rc-user".into(),
            self.rc.user.clone(),
            "--rc-pass".into(),
            self.rc.pass.clone(),
        ];
        argv.extend(self.conf.command_options.iter().cloned());
        BackendCommand { argv, envs: Vec::new() }
    }

    fn check_startup(&self, stream: StdioStream, lines: &[String]) -> StartVerdict {
        match stream {
            StdioStream::Stdout => StartVerdict::Ongoing,
            StdioStream::Stderr => classify(lines),
        }
    }

    fn establish<'a>(&'a mut self, _record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn shutdown<'a>(&'a self, record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async move {
            debug!(pool = %self.pool, pid = record.backend_pid, "stopping rclone");
            self.rc(record, "core/quit", &[]).await?;
            Ok(())
        })
    }

    fn probe<'a>(&'a self, record: &'a BackendRecord, timeout: Duration) -> DelegateFuture<'a, u16> {
        Box::pin(async move {
            let url = format!("{}rc/noop", Self::rc_url(record)?);
            let response = self
                .client
                .post(&url)
                .basic_auth(&self.rc.user, Some(&self.rc.pass))
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| AppError::Delegate(format!("probe {url}: {e}")))?;
            Ok(response.status().as_u16())
        })
    }

    fn list_buckets<'a>(&'a self, record: &'a BackendRecord) -> DelegateFuture<'a, Vec<String>> {
        Box::pin(async move {
            let params = [format!("fs={}", self.directory), "remote=".to_string()];
            let reply = self.rc(record, "operations/list", &params).await?;
            let entries = reply.get("list").and_then(Value::as_array).cloned().unwrap_or_default();
            Ok(entries
                .iter()
                .filter(|e| e.get("IsDir").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|e| e.get("Name").and_then(Value::as_str))
                .map(str::to_string)
                .collect())
        })
    }

    fn make_bucket<'a>(&'a self, record: &'a BackendRecord, bucket: &'a str) -> DelegateFuture<'a, ()> {
        Box::pin(async move {
            let params = [format!("fs={}", self.directory), format!("remote={bucket}")];
            self.rc(record, "operations/mkdir", &params).await?;
            Ok(())
        })
    }
}
