//! Worker subprocess main entry point.
//!
//! This runs when `clonifier --internal-worker` is invoked by the process
//! backend. Requests arrive as JSON lines on stdin, responses (including
//! forwarded log events) leave as JSON lines on stdout. Human readable
//! diagnostics go to stderr, which the parent inherits.

use super::WorkerHost;
use super::log_forward;
use crate::error::WorkerFault;
use crate::protocol::{Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// Exit code for a host fault (unknown object, desync).
pub const EXIT_FAULT: i32 = 2;

async fn write_response(out: &mut tokio::io::Stdout, response: &Response) -> bool {
    let line = match response.to_line() {
        Ok(line) => line,
        Err(e) => {
            eprintln!("clonifier worker: cannot encode response: {}", e);
            return false;
        }
    };
    out.write_all(line.as_bytes()).await.is_ok() && out.flush().await.is_ok()
}

/// Copy responses to stdout until told to stop, then drain what is queued.
async fn pump_stdout(
    mut responses: mpsc::UnboundedReceiver<Response>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut out = tokio::io::stdout();
    loop {
        tokio::select! {
            biased;
            Some(response) = responses.recv() => {
                if !write_response(&mut out, &response).await {
                    return;
                }
            }
            _ = &mut shutdown => {
                while let Ok(response) = responses.try_recv() {
                    if !write_response(&mut out, &response).await {
                        return;
                    }
                }
                return;
            }
        }
    }
}

async fn read_stdin(requests: mpsc::UnboundedSender<Request>) -> Result<(), WorkerFault> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = Request::from_line(&line)?;
        if requests.send(request).is_err() {
            break;
        }
    }
    Ok(())
}

async fn serve_stdio(level: LevelFilter) -> i32 {
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    if tracing::subscriber::set_global_default(log_forward::subscriber(resp_tx.clone(), level))
        .is_err()
    {
        eprintln!("clonifier worker: a global subscriber was already installed");
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let writer = tokio::spawn(pump_stdout(resp_rx, stop_rx));

    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_stdin(req_tx));

    let code = match WorkerHost::new(resp_tx).serve(req_rx).await {
        // the host only sees a closed channel once the reader has returned
        Ok(()) => match reader.await {
            Ok(Ok(())) => 0,
            Ok(Err(fault)) => {
                error!("Worker fault: {}", fault);
                EXIT_FAULT
            }
            Err(e) => {
                eprintln!("clonifier worker: stdin reader failed: {}", e);
                EXIT_FAULT
            }
        },
        Err(fault) => {
            reader.abort();
            error!("Worker fault: {}", fault);
            EXIT_FAULT
        }
    };

    let _ = stop_tx.send(());
    let _ = writer.await;
    code
}

/// Run the worker subprocess main function. Never returns.
pub fn run_worker_main(level: LevelFilter) -> ! {
    // Pipe errors are handled via io::Error on write
    #[cfg(unix)]
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("clonifier worker: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(serve_stdio(level));
    std::process::exit(code)
}
