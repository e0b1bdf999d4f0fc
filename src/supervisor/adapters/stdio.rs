use std::io::IsTerminal;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gate::AccessGate;
use crate::supervisor::Supervisor;

pub fn start(gate: AccessGate, supervisor: Supervisor, shutdown: CancellationToken) {
    let interactive_tty = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    if interactive_tty {
        info!("supervisor stdio adapter: interactive tty detected");
    } else {
        info!("supervisor stdio adapter: non-interactive stdio detected");
    }

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            if interactive_tty {
                print!("# ");
                use std::io::Write as _;
                let _ = std::io::stdout().flush();
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("supervisor stdio adapter shutting down");
                    break;
                }

                line = lines.next_line() => {
                    let input = match line {
                        Ok(Some(l)) => l,
                        Ok(None) => {
                            info!("supervisor stdio adapter stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!("supervisor stdio adapter read error: {e}");
                            break;
                        }
                    };

                    match parse_command(&input) {
                        Ok(None) => {}
                        Ok(Some(StdioFrame::Help)) => print_usage(),
                        Ok(Some(StdioFrame::Ensure { pool })) => {
                            match gate.ensure_backend(&pool).await {
                                Ok(record) => println!("{pool}: {}", record.backend_ep),
                                Err(err) => eprintln!("{pool}: {err}"),
                            }
                        }
                        Ok(Some(StdioFrame::Backends)) => {
                            let running = supervisor.running_backends().await;
                            if running.is_empty() {
                                println!("no backends running");
                            }
                            for b in running {
                                println!("{} port={} pid={}", b.pool, b.port, b.pid);
                            }
                        }
                        Ok(Some(StdioFrame::Quit)) => {
                            info!("shutdown requested from stdio");
                            shutdown.cancel();
                            break;
                        }
                        Err(e) => {
                            eprintln!("{e}");
                            print_usage();
                        }
                    }
                }
            }
        }
    });
}

#[derive(Debug, PartialEq, Eq)]
enum StdioFrame {
    Ensure { pool: String },
    Backends,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<StdioFrame>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match command {
        "ensure" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                Err("usage: ensure <pool>".to_string())
            } else {
                Ok(Some(StdioFrame::Ensure { pool: rest.to_string() }))
            }
        }
        "backends" => ensure_no_args(rest, StdioFrame::Backends),
        "quit" => ensure_no_args(rest, StdioFrame::Quit),
        "help" => ensure_no_args(rest, StdioFrame::Help),
        other => Err(format!("unknown command: {other}")),
    }
}

fn ensure_no_args(rest: &str, frame: StdioFrame) -> Result<Option<StdioFrame>, String> {
    if rest.is_empty() {
        Ok(Some(frame))
    } else {
        Err("unexpected arguments".to_string())
    }
}

fn print_usage() {
    eprintln!("commands:");
    eprintln!("  ensure <pool>");
    eprintln!("  backends");
    eprintln!("  quit");
    eprintln!("  help");
}

#[cfg(test)]
mod tests {
    use super::{StdioFrame, parse_command};

    #[test]
    fn parse_ensure_command() {
        match parse_command("ensure p1") {
            Ok(Some(StdioFrame::Ensure { pool })) => assert_eq!(pool, "p1"),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn parse_ensure_requires_one_pool() {
        assert!(parse_command("ensure").is_err());
        assert!(parse_command("ensure p1 p2").is_err());
    }

    #[test]
    fn parse_allows_surrounding_whitespace() {
        assert_eq!(parse_command("   backends  "), Ok(Some(StdioFrame::Backends)));
    }

    #[test]
    fn parse_blank_line_is_nothing() {
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn parse_rejects_arguments_to_plain_commands() {
        let err = parse_command("quit now").expect_err("arguments should fail");
        assert_eq!(err, "unexpected arguments");
    }

    #[test]
    fn parse_unknown_command() {
        let err = parse_command("stop p1").expect_err("unknown command should fail");
        assert!(err.contains("unknown command: stop"));
    }
}
