//! MinIO delegate — single endpoint, controlled through `mc`.
//!
//! MinIO runs with `--json`, so startup classification reads JSON records
//! on stdout and ignores stderr. `establish` registers an `mc` alias in a
//! private config directory owned by the delegate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    BackendCommand, BackendDelegate, DelegateContext, DelegateFuture, FailureReason, StartVerdict,
    StdioStream, decode_json_line, decode_json_stream, random_key, run_control_command,
};
use crate::config::MinioConfig;
use crate::error::AppError;
use crate::registry::BackendRecord;

const EXPECTED_PREFIX: &str = "API:";
const PORT_IN_USE_PREFIX: &str = "Specified port is already in use";
const CONFIG_DIR_PREFIX: &str = "poolgate-mc-";

#[derive(Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: String,
    #[serde(default)]
    message: String,
}

/// Classify MinIO's JSON startup records.
///
/// The first FATAL record decides a failure, and only a port conflict is
/// retryable. Without FATAL records, an `API:` message means started.
fn classify(lines: &[String]) -> StartVerdict {
    let records: Vec<LogRecord> = lines.iter().filter_map(|l| decode_json_line(l)).collect();
    if let Some(fatal) = records.iter().find(|r| r.level == "FATAL") {
        return if fatal.message.starts_with(PORT_IN_USE_PREFIX) {
            StartVerdict::ToRetry(fatal.message.clone())
        } else {
            StartVerdict::Failed(FailureReason::Fatal(fatal.message.clone()))
        };
    }
    match records.iter().find(|r| r.message.starts_with(EXPECTED_PREFIX)) {
        Some(r) => StartVerdict::Started(r.message.clone()),
        None => StartVerdict::Ongoing,
    }
}

/// Reduce `mc --json` output to its success values or the most specific
/// error text.
fn simplify_mc_reply(stdout: &str) -> Result<Vec<Value>, String> {
    let values = decode_json_stream(stdout)?;
    for v in &values {
        match v.get("status").and_then(Value::as_str) {
            Some("success") => {}
            Some("error") => {
                if values.len() != 1 {
                    warn!(count = values.len(), "mc replied with multiple records around an error");
                }
                let code = v.pointer("/error/cause/error/Code").and_then(Value::as_str);
                let message = v.pointer("/error/message").and_then(Value::as_str);
                return Err(match code.or(message) {
                    Some(text) if !text.is_empty() => text.to_string(),
                    _ => v.to_string(),
                });
            }
            _ => return Err(v.to_string()),
        }
    }
    Ok(values)
}

/// A private `mc` config directory and the alias registered in it.
/// The directory is removed when this is dropped, on the blocking pool
/// when a runtime is present.
struct McAlias {
    alias: String,
    config_dir: PathBuf,
}

impl Drop for McAlias {
    fn drop(&mut self) {
        let dir = std::mem::take(&mut self.config_dir);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_config_dir(&dir));
            }
            Err(_) => remove_config_dir(&dir),
        }
    }
}

fn remove_config_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "cannot remove mc config dir: {e}");
        }
    }
}

pub struct MinioDelegate {
    pool: String,
    conf: MinioConfig,
    context: DelegateContext,
    mc: Option<McAlias>,
    client: reqwest::Client,
}

impl MinioDelegate {
    pub fn new(pool: &str, conf: MinioConfig, context: DelegateContext) -> Self {
        Self { pool: pool.to_string(), conf, context, mc: None, client: reqwest::Client::new() }
    }

    async fn mc(&self, synopsis: &str, args: &[&str]) -> Result<Vec<Value>, AppError> {
        let alias = self
            .mc
            .as_ref()
            .ok_or_else(|| AppError::Delegate(format!("mc {synopsis}: no alias established")))?;
        mc_command(&self.conf.mc, &alias.config_dir, &self.context, synopsis, args).await
    }
}

async fn mc_command(
    mc: &str,
    config_dir: &Path,
    context: &DelegateContext,
    synopsis: &str,
    args: &[&str],
) -> Result<Vec<Value>, AppError> {
    let mut argv = vec![
        mc.to_string(),
        "--json".to_string(),
        format!("--config-dir={}", config_dir.display()),
    ];
    argv.extend(args.iter().map(|a| a.to_string()));
    let out = run_control_command(&argv, &context.environ, context.command_timeout).await?;
    if !out.success && out.stdout.trim().is_empty() {
        error!(cmd = synopsis, stderr = %out.stderr.trim(), "mc command failed");
        return Err(AppError::Delegate(format!("mc {synopsis}: {}", out.stderr.trim())));
    }
    simplify_mc_reply(&out.stdout).map_err(|cause| {
        error!(cmd = synopsis, stdout = %out.stdout.trim(), stderr = %out.stderr.trim(), "mc command failed");
        AppError::Delegate(format!("mc {synopsis}: {cause}"))
    })
}

impl BackendDelegate for MinioDelegate {
    fn command_line(&self, port: u16, directory: &str, record: &BackendRecord) -> BackendCommand {
        BackendCommand {
            argv: vec![
                self.conf.minio.clone(),
                "--json".into(),
                "--anonymous".into(),
                "server".into(),
                "--address".into(),
                format!(":{port}"),
                directory.to_string(),
            ],
            envs: vec![
                ("MINIO_ROOT_USER".into(), record.root_access.clone()),
                ("MINIO_ROOT_PASSWORD".into(), record.root_secret.clone()),
                ("MINIO_BROWSER".into(), "off".into()),
            ],
        }
    }

    fn check_startup(&self, stream: StdioStream, lines: &[String]) -> StartVerdict {
        match stream {
            StdioStream::Stderr => StartVerdict::Ongoing,
            StdioStream::Stdout => classify(lines),
        }
    }

    fn establish<'a>(&'a mut self, record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async move {
            let config_dir = std::env::temp_dir()
                .join(format!("{CONFIG_DIR_PREFIX}{}", uuid::Uuid::new_v4().simple()));
            tokio::fs::create_dir(&config_dir).await?;
            let mc = McAlias {
                alias: format!("pool-{}-{}", self.pool, random_key(12).to_lowercase()),
                config_dir,
            };
            let url = format!("http://{}", record.backend_ep);
            mc_command(
                &self.conf.mc,
                &mc.config_dir,
                &self.context,
                "alias set",
                &[
                    "alias",
                    "set",
                    &mc.alias,
                    &url,
                    &record.root_access,
                    &record.root_secret,
                    "--api",
                    "S3v4",
                ],
            )
            .await?;
            debug!(pool = %self.pool, alias = %mc.alias, "mc alias set");
            self.mc = Some(mc);
            Ok(())
        })
    }

    fn shutdown<'a>(&'a self, record: &'a BackendRecord) -> DelegateFuture<'a, ()> {
        Box::pin(async move {
            debug!(pool = %self.pool, pid = record.backend_pid, "stopping minio");
            let alias = self.mc.as_ref().map(|m| m.alias.clone()).unwrap_or_default();
            self.mc("admin service stop", &["admin", "service", "stop", &alias]).await?;
            Ok(())
        })
    }

    fn probe<'a>(&'a self, record: &'a BackendRecord, timeout: Duration) -> DelegateFuture<'a, u16> {
        Box::pin(async move {
            let url = format!("http://{}/minio/health/live", record.backend_ep);
            let response = self
                .client
                .get(&url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| AppError::Delegate(format!("probe {url}: {e}")))?;
            Ok(response.status().as_u16())
        })
    }

    fn list_buckets<'a>(&'a self, _record: &'a BackendRecord) -> DelegateFuture<'a, Vec<String>> {
        Box::pin(async move {
            let alias = self.mc.as_ref().map(|m| m.alias.clone()).unwrap_or_default();
            let values = self.mc("ls", &["ls", &alias]).await?;
            Ok(values
                .iter()
                .filter_map(|v| v.get("key").and_then(Value::as_str))
                .map(|k| k.trim_end_matches('/').to_string())
                .collect())
        })
    }

    fn make_bucket<'a>(&'a self, _record: &'a BackendRecord, bucket: &'a str) -> DelegateFuture<'a, ()> {
        Box::pin(async move {
            let alias = self.mc.as_ref().map(|m| m.alias.clone()).unwrap_or_default();
            let target = format!("{alias}/{bucket}");
            self.mc("mb", &["mb", &target]).await?;
            Ok(())
        })
    }
}

/// Remove `mc` config directories left in the temp dir.
pub fn clean_config_dirs() {
    let tmp = std::env::temp_dir();
    let entries = match std::fs::read_dir(&tmp) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %tmp.display(), "cannot scan temp dir: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(CONFIG_DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        debug!(path = %path.display(), "removing leftover mc config dir");
        if let Err(e) = std::fs::remove_dir_all(&path) {
            error!(path = %path.display(), "cannot remove: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendState, PoolReason};

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn delegate() -> MinioDelegate {
        MinioDelegate::new(
            "p1",
            MinioConfig { minio: "/opt/minio".into(), mc: "/opt/mc".into() },
            DelegateContext { command_timeout: Duration::from_secs(1), environ: Vec::new() },
        )
    }

    fn record() -> BackendRecord {
        BackendRecord {
            pool: "p1".into(),
            backend_ep: "node:9003".into(),
            backend_pid: 0,
            state: BackendState::Ready,
            reason: PoolReason::Normal,
            root_access: "AKEY".into(),
            root_secret: "SKEY".into(),
            mux_ep: "node:8004".into(),
            mux_pid: 1,
            timestamp: 0,
        }
    }

    #[test]
    fn api_message_means_started() {
        let v = classify(&lines(&[
            r#"{"level":"INFO","message":"MinIO Object Storage Server"}"#,
            r#"{"level":"INFO","message":"API: http://10.0.0.1:9003"}"#,
        ]));
        assert_eq!(v, StartVerdict::Started("API: http://10.0.0.1:9003".into()));
    }

    #[test]
    fn port_in_use_is_retryable() {
        let v = classify(&lines(&[
            r#"{"level":"FATAL","message":"Specified port is already in use: listen tcp :9003"}"#,
        ]));
        assert!(matches!(v, StartVerdict::ToRetry(_)));
    }

    #[test]
    fn other_fatal_fails() {
        let v = classify(&lines(&[
            r#"{"level":"INFO","message":"API: http://10.0.0.1:9003"}"#,
            r#"{"level":"FATAL","message":"Unable to write to the backend"}"#,
        ]));
        assert_eq!(
            v,
            StartVerdict::Failed(FailureReason::Fatal("Unable to write to the backend".into()))
        );
    }

    #[test]
    fn noise_is_ongoing() {
        assert_eq!(classify(&lines(&["not json", "{\"level\":\"INFO\"}"])), StartVerdict::Ongoing);
        assert_eq!(classify(&[]), StartVerdict::Ongoing);
    }

    #[test]
    fn stderr_is_ignored() {
        let d = delegate();
        let fatal = lines(&[r#"{"level":"FATAL","message":"boom"}"#]);
        assert_eq!(d.check_startup(StdioStream::Stderr, &fatal), StartVerdict::Ongoing);
        assert!(matches!(d.check_startup(StdioStream::Stdout, &fatal), StartVerdict::Failed(_)));
    }

    #[test]
    fn command_line_shape() {
        let cmd = delegate().command_line(9003, "/srv/p1", &record());
        assert_eq!(
            cmd.argv,
            vec!["/opt/minio", "--json", "--anonymous", "server", "--address", ":9003", "/srv/p1"]
        );
        assert!(cmd.envs.contains(&("MINIO_ROOT_USER".into(), "AKEY".into())));
        assert!(cmd.envs.contains(&("MINIO_ROOT_PASSWORD".into(), "SKEY".into())));
        assert!(cmd.envs.contains(&("MINIO_BROWSER".into(), "off".into())));
    }

    #[test]
    fn mc_reply_success_and_errors() {
        let ok = simplify_mc_reply(
            "{\"status\":\"success\",\"key\":\"b1/\"}\n{\"status\":\"success\",\"key\":\"b2/\"}\n",
        )
        .unwrap();
        assert_eq!(ok.len(), 2);
        assert!(simplify_mc_reply("").unwrap().is_empty());

        let coded = r#"{"status":"error","error":{"message":"Unable to make bucket","cause":{"error":{"Code":"BucketAlreadyOwnedByYou"}}}}"#;
        assert_eq!(simplify_mc_reply(coded).unwrap_err(), "BucketAlreadyOwnedByYou");

        let plain = r#"{"status":"error","error":{"message":"Unable to connect"}}"#;
        assert_eq!(simplify_mc_reply(plain).unwrap_err(), "Unable to connect");

        assert!(simplify_mc_reply(r#"{"status":"weird"}"#).is_err());
    }

    #[test]
    fn alias_dir_removed_on_drop() {
        let dir = std::env::temp_dir().join(format!("{CONFIG_DIR_PREFIX}test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        let alias = McAlias { alias: "a".into(), config_dir: dir.clone() };
        drop(alias);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn alias_dir_removed_on_the_blocking_pool() {
        let dir = std::env::temp_dir().join(format!("{CONFIG_DIR_PREFIX}test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        drop(McAlias { alias: "a".into(), config_dir: dir.clone() });
        for _ in 0..100 {
            if !dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn shutdown_without_alias_errors() {
        let err = delegate().shutdown(&record()).await.unwrap_err();
        assert!(matches!(err, AppError::Delegate(_)));
    }
}
