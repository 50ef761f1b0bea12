//! Worker in a child process.
//!
//! The child is this executable (or a configured one) started with the
//! hidden `--internal-worker` flag. Requests and responses are JSON lines on
//! the child's stdin and stdout; stderr is inherited for diagnostics.

use super::signals::{TerminationReason, analyze_exit_status};
use super::{Backend, WorkerEvent, WorkerLink};
use crate::error::{BridgeError, Result};
use crate::protocol::{Request, Response};
use crate::worker::stdio::EXIT_FAULT;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::filter::LevelFilter;

/// Flag that turns the binary into a worker.
pub const WORKER_FLAG: &str = "--internal-worker";

/// Environment variable carrying the worker's log level.
pub const WORKER_LOG_ENV: &str = "CLONIFIER_WORKER_LOG";

pub struct ProcessBackend {
    exe: Option<PathBuf>,
    log_level: LevelFilter,
}

impl ProcessBackend {
    pub fn new(exe: Option<PathBuf>, log_level: LevelFilter) -> Self {
        Self { exe, log_level }
    }

    fn executable(&self) -> Result<PathBuf> {
        match &self.exe {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| BridgeError::Launch(format!("cannot locate executable: {}", e))),
        }
    }
}

async fn write_requests(mut stdin: ChildStdin, mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.recv().await {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping request that cannot be encoded: {}", e);
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            // the reader side reports the exit
            break;
        }
    }
    // dropping stdin closes the pipe; the worker exits on EOF
}

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn launch(&self) -> Result<WorkerLink> {
        let exe = self.executable()?;
        debug!(exe = %exe.display(), "Spawning worker process");

        let mut child = Command::new(&exe)
            .arg(WORKER_FLAG)
            .env(WORKER_LOG_ENV, self.log_level.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Launch(format!("{}: {}", exe.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Launch("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Launch("worker stdout not captured".to_string()))?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_requests(stdin, req_rx));

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let event = match Response::from_line(&line) {
                            Ok(response) => WorkerEvent::Message(response),
                            Err(e) => WorkerEvent::Corrupt(format!(
                                "unparseable worker output ({}): {:.80}",
                                e, line
                            )),
                        };
                        if event_tx.send(event).is_err() {
                            // supervisor gone; kill_on_drop reaps the child
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Reading worker output failed: {}", e);
                        break;
                    }
                }
            }

            let reason = match child.wait().await {
                Ok(status) => match analyze_exit_status(status) {
                    TerminationReason::Exited(EXIT_FAULT) => {
                        TerminationReason::Fault("worker host reported a fault".to_string())
                    }
                    reason => reason,
                },
                Err(e) => {
                    warn!("Waiting for worker process failed: {}", e);
                    TerminationReason::Disconnected
                }
            };
            debug!(reason = %reason, "Worker process exited");
            let _ = event_tx.send(WorkerEvent::Exited(reason));
        });

        Ok(WorkerLink {
            requests: req_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_executable_fails_launch() {
        let backend = ProcessBackend::new(
            Some(PathBuf::from("/nonexistent/clonifier-worker")),
            LevelFilter::INFO,
        );
        let err = backend.launch().unwrap_err();
        assert!(matches!(err, BridgeError::Launch(_)));
        assert!(err.to_string().contains("/nonexistent/clonifier-worker"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_worker_output_is_corrupt() {
        // `echo` ignores the flag, prints it, and exits
        let backend = ProcessBackend::new(Some(PathBuf::from("echo")), LevelFilter::INFO);
        let mut link = backend.launch().unwrap();

        match link.events.recv().await {
            Some(WorkerEvent::Corrupt(msg)) => assert!(msg.contains("--internal-worker")),
            other => panic!("Expected corrupt output, got {:?}", other),
        }
        assert_eq!(
            link.events.recv().await,
            Some(WorkerEvent::Exited(TerminationReason::Exited(0)))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let backend = ProcessBackend::new(Some(PathBuf::from("false")), LevelFilter::INFO);
        let mut link = backend.launch().unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(WorkerEvent::Exited(TerminationReason::Exited(1)))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fault_exit_code_is_a_fault() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("faulting-worker");
        std::fs::write(&exe, format!("#!/bin/sh\nexit {}\n", EXIT_FAULT)).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = ProcessBackend::new(Some(exe), LevelFilter::INFO);
        let mut link = backend.launch().unwrap();
        assert!(matches!(
            link.events.recv().await,
            Some(WorkerEvent::Exited(TerminationReason::Fault(_)))
        ));
    }
}
