//! Startup protocol and stdio plumbing.
//!
//! Two reader tasks forward a backend's stdout and stderr lines into one
//! channel. [`await_startup`] consumes it until the delegate reaches a
//! verdict; afterwards [`spawn_drain`] keeps logging whatever the backend
//! prints for the rest of its life.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{info, trace};

use crate::backend::{FailureReason, StartVerdict, StdioStream};

/// More lines than this on one stream during startup is flooding.
pub const STARTUP_LINE_CAP: usize = 500;

const CHANNEL_DEPTH: usize = 256;

pub type StdioLine = (StdioStream, String);

/// Start one reader task per stream. The receiver yields `None` once
/// both streams have closed.
pub fn spawn_readers<O, E>(stdout: O, stderr: E) -> mpsc::Receiver<StdioLine>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(read_lines(stdout, StdioStream::Stdout, tx.clone()));
    tokio::spawn(read_lines(stderr, StdioStream::Stderr, tx));
    rx
}

async fn read_lines<R>(reader: R, stream: StdioStream, tx: mpsc::Sender<StdioLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                trace!(%stream, "stdio read ended: {e}");
                break;
            }
        }
    }
}

/// Lines gathered during startup and the verdict they produced.
#[derive(Debug)]
pub struct Startup {
    pub verdict: StartVerdict,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Startup {
    pub fn drain_to_log(&self, pool: &str) {
        for line in &self.stdout {
            info!(pool = %pool, stream = "stdout", line = %line, "backend output");
        }
        for line in &self.stderr {
            info!(pool = %pool, stream = "stderr", line = %line, "backend output");
        }
    }
}

/// Read lines until `classify` gives a verdict for either stream.
///
/// Never returns [`StartVerdict::Ongoing`]: closure of both streams is
/// `PipeClosed`, passing `timeout` is `Timeout`, and a stream longer than
/// [`STARTUP_LINE_CAP`] is `Flooding`.
pub async fn await_startup<F>(
    rx: &mut mpsc::Receiver<StdioLine>,
    classify: F,
    timeout: Duration,
) -> Startup
where
    F: Fn(StdioStream, &[String]) -> StartVerdict,
{
    let deadline = Instant::now() + timeout;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let verdict = loop {
        let (stream, line) = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => break StartVerdict::Failed(FailureReason::Timeout),
            Ok(None) => break StartVerdict::Failed(FailureReason::PipeClosed),
            Ok(Some(item)) => item,
        };
        let lines = match stream {
            StdioStream::Stdout => &mut stdout,
            StdioStream::Stderr => &mut stderr,
        };
        lines.push(line);
        if lines.len() > STARTUP_LINE_CAP {
            break StartVerdict::Failed(FailureReason::Flooding);
        }
        match classify(stream, lines) {
            StartVerdict::Ongoing => {}
            verdict => break verdict,
        }
    };
    Startup { verdict, stdout, stderr }
}

/// Log the rest of a backend's output until both streams close.
pub fn spawn_drain(pool: String, mut rx: mpsc::Receiver<StdioLine>) {
    tokio::spawn(async move {
        while let Some((stream, line)) = rx.recv().await {
            info!(pool = %pool, %stream, line = %line, "backend output");
        }
        trace!(pool = %pool, "backend stdio closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(_stream: StdioStream, lines: &[String]) -> StartVerdict {
        match lines.last().map(String::as_str) {
            Some("ready") => StartVerdict::Started("ready".into()),
            Some("busy") => StartVerdict::ToRetry("busy".into()),
            Some("fatal") => StartVerdict::Failed(FailureReason::Fatal("fatal".into())),
            _ => StartVerdict::Ongoing,
        }
    }

    /// Queue `lines`, close the streams, and run the protocol over them.
    async fn feed(lines: &[(StdioStream, &str)]) -> Startup {
        let (tx, mut rx) = mpsc::channel(2048);
        for (stream, line) in lines {
            tx.send((*stream, line.to_string())).await.unwrap();
        }
        drop(tx);
        await_startup(&mut rx, classify, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn success_message_starts() {
        let s = feed(&[(StdioStream::Stdout, "booting"), (StdioStream::Stdout, "ready")]).await;
        assert_eq!(s.verdict, StartVerdict::Started("ready".into()));
        assert_eq!(s.stdout, vec!["booting", "ready"]);
    }

    #[tokio::test]
    async fn address_in_use_retries() {
        let s = feed(&[(StdioStream::Stderr, "busy")]).await;
        assert!(matches!(s.verdict, StartVerdict::ToRetry(_)));
        assert_eq!(s.stderr, vec!["busy"]);
    }

    #[tokio::test]
    async fn fatal_message_fails() {
        let s = feed(&[(StdioStream::Stdout, "x"), (StdioStream::Stderr, "fatal")]).await;
        assert_eq!(s.verdict, StartVerdict::Failed(FailureReason::Fatal("fatal".into())));
    }

    #[tokio::test]
    async fn noise_past_the_cap_is_flooding() {
        let noise: Vec<(StdioStream, &str)> = (0..STARTUP_LINE_CAP + 1).map(|_| (StdioStream::Stdout, "noise")).collect();
        let s = feed(&noise).await;
        assert_eq!(s.verdict, StartVerdict::Failed(FailureReason::Flooding));
        assert_eq!(s.stdout.len(), STARTUP_LINE_CAP + 1);
    }

    #[tokio::test]
    async fn cap_is_per_stream() {
        let mut lines: Vec<(StdioStream, &str)> = Vec::new();
        for _ in 0..STARTUP_LINE_CAP {
            lines.push((StdioStream::Stdout, "noise"));
            lines.push((StdioStream::Stderr, "noise"));
        }
        lines.push((StdioStream::Stderr, "ready"));
        let s = feed(&lines).await;
        assert_eq!(s.verdict, StartVerdict::Failed(FailureReason::Flooding));

        let mut lines: Vec<(StdioStream, &str)> = Vec::new();
        for _ in 0..STARTUP_LINE_CAP - 1 {
            lines.push((StdioStream::Stdout, "noise"));
            lines.push((StdioStream::Stderr, "noise"));
        }
        lines.push((StdioStream::Stderr, "ready"));
        let s = feed(&lines).await;
        assert!(matches!(s.verdict, StartVerdict::Started(_)));
    }

    #[tokio::test]
    async fn closed_streams_fail() {
        let s = feed(&[(StdioStream::Stdout, "partial")]).await;
        assert_eq!(s.verdict, StartVerdict::Failed(FailureReason::PipeClosed));
        assert_eq!(s.stdout, vec!["partial"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (_tx, mut rx) = mpsc::channel::<StdioLine>(1);
        let s = await_startup(&mut rx, classify, Duration::from_secs(60)).await;
        assert_eq!(s.verdict, StartVerdict::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn readers_forward_both_streams() {
        let out: &[u8] = b"one\ntwo\n";
        let err: &[u8] = b"three\n";
        let mut rx = spawn_readers(out, err);
        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item);
        }
        assert_eq!(got.len(), 3);
        assert!(got.contains(&(StdioStream::Stderr, "three".to_string())));
        let outs: Vec<&str> = got
            .iter()
            .filter(|(s, _)| *s == StdioStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(outs, vec!["one", "two"]);
    }
}
