//! Backend child processes: spawning under the privilege-dropping
//! wrapper, termination signals, and reaping.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::startup::{self, StdioLine};
use crate::backend::BackendCommand;
use crate::error::AppError;

/// A spawned backend with its merged stdio line feed.
pub struct SpawnedBackend {
    pub child: Child,
    pub pid: u32,
    pub lines: mpsc::Receiver<StdioLine>,
}

/// Prefix `argv` with `sudo -n -u UID -g GID` when a wrapper is configured.
pub fn wrap_argv(sudo: Option<&str>, uid: &str, gid: &str, argv: &[String]) -> Vec<String> {
    let mut wrapped = Vec::with_capacity(argv.len() + 6);
    if let Some(sudo) = sudo {
        wrapped.extend([sudo, "-n", "-u", uid, "-g", gid].map(str::to_string));
    }
    wrapped.extend(argv.iter().cloned());
    wrapped
}

/// Spawn a backend with only `environ` plus the command's own variables.
pub fn spawn_backend(
    sudo: Option<&str>,
    uid: &str,
    gid: &str,
    command: &BackendCommand,
    environ: &[(String, String)],
) -> Result<SpawnedBackend, AppError> {
    let argv = wrap_argv(sudo, uid, gid, &command.argv);
    let Some((program, args)) = argv.split_first() else {
        return Err(AppError::Spawn("empty command line".into()));
    };
    debug!(argv = ?argv, "spawning backend");

    let mut child = Command::new(program)
        .args(args)
        .env_clear()
        .envs(environ.iter().chain(command.envs.iter()).map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| AppError::Spawn(format!("{program}: {e}")))?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::Spawn("failed to get process ID".to_string()))?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(AppError::Spawn("stdio pipes missing".to_string()));
    };
    let lines = startup::spawn_readers(stdout, stderr);
    Ok(SpawnedBackend { child, pid, lines })
}

/// Send SIGTERM. SIGTERM rather than SIGKILL so a sudo wrapper relays it.
pub fn terminate(pid: u32) -> Result<(), AppError> {
    let pid = i32::try_from(pid).map_err(|_| AppError::Invariant(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::Io(std::io::Error::from(e))),
    }
}

/// Wait for the child to exit, escalating to SIGTERM and then SIGKILL
/// when it outlives `grace` at each step.
pub async fn reap(child: &mut Child, pid: u32, grace: Duration) {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        debug!(pid, status = ?status, "backend reaped");
        return;
    }
    warn!(pid, "backend still running; sending SIGTERM");
    if let Err(e) = terminate(pid) {
        warn!(pid, "SIGTERM failed: {e}");
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        debug!(pid, status = ?status, "backend reaped after SIGTERM");
        return;
    }
    warn!(pid, "backend ignored SIGTERM; killing");
    if let Err(e) = child.start_kill() {
        warn!(pid, "kill failed: {e}");
    }
    match child.wait().await {
        Ok(status) => debug!(pid, status = %status, "backend reaped after kill"),
        Err(e) => warn!(pid, "wait failed: {e}"),
    }
}

/// Stop a backend that never became usable: SIGTERM, then reap.
pub async fn discard(child: &mut Child, pid: u32, grace: Duration) {
    if let Err(e) = terminate(pid) {
        warn!(pid, "SIGTERM failed: {e}");
    }
    reap(child, pid, grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StdioStream, minimal_environ};

    fn sh(script: &str) -> BackendCommand {
        BackendCommand {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            envs: vec![("POOLGATE_PROBE".into(), "42".into())],
        }
    }

    #[test]
    fn wrapper_prefixes_argv() {
        let argv = vec!["minio".to_string(), "server".to_string()];
        assert_eq!(
            wrap_argv(Some("/usr/bin/sudo"), "alice", "staff", &argv),
            vec!["/usr/bin/sudo", "-n", "-u", "alice", "-g", "staff", "minio", "server"]
        );
        assert_eq!(wrap_argv(None, "alice", "staff", &argv), argv);
    }

    #[tokio::test]
    async fn spawned_child_sees_only_curated_env() {
        let cmd = sh("echo \"probe=$POOLGATE_PROBE\"; echo \"home=$HOME\" >&2");
        let environ: Vec<(String, String)> =
            minimal_environ().into_iter().filter(|(k, _)| k == "PATH").collect();
        let mut spawned = spawn_backend(None, "u", "g", &cmd, &environ).unwrap();
        let mut got = Vec::new();
        while let Some(line) = spawned.lines.recv().await {
            got.push(line);
        }
        assert!(got.contains(&(StdioStream::Stdout, "probe=42".to_string())));
        assert!(got.contains(&(StdioStream::Stderr, "home=".to_string())));
        spawned.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn discard_stops_a_sleeper() {
        let mut spawned = spawn_backend(None, "u", "g", &sh("exec sleep 30"), &minimal_environ()).unwrap();
        discard(&mut spawned.child, spawned.pid, Duration::from_secs(5)).await;
        assert!(spawned.child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn reap_escalates_past_ignored_sigterm() {
        let mut spawned = spawn_backend(
            None,
            "u",
            "g",
            &sh("trap '' TERM; echo armed; while :; do sleep 1; done"),
            &minimal_environ(),
        )
        .unwrap();
        assert_eq!(spawned.lines.recv().await.unwrap().1, "armed");
        reap(&mut spawned.child, spawned.pid, Duration::from_millis(200)).await;
        assert!(spawned.child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let cmd = BackendCommand { argv: vec!["/nonexistent/poolgate-backend".into()], envs: vec![] };
        let err = spawn_backend(None, "u", "g", &cmd, &[]).err().unwrap();
        assert!(matches!(err, AppError::Spawn(_)));
    }
}
