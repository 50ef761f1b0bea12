//! Worker on a dedicated OS thread.
//!
//! Messages move through in-process channels without serialisation, so
//! binary payloads are handed over rather than copied. The thread runs its
//! own current-thread runtime; its tracing events are forwarded as `log`
//! responses through a thread-local subscriber.

use super::signals::{TerminationReason, panic_message};
use super::{Backend, WorkerEvent, WorkerLink};
use crate::error::{BridgeError, Result, WorkerFault};
use crate::protocol::{Request, Response};
use crate::worker::{WorkerHost, log_forward};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;

pub struct ThreadBackend {
    log_level: LevelFilter,
}

impl ThreadBackend {
    pub fn new(log_level: LevelFilter) -> Self {
        Self { log_level }
    }
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::new(LevelFilter::INFO)
    }
}

fn run_worker_thread(
    requests: mpsc::UnboundedReceiver<Request>,
    responses: mpsc::UnboundedSender<Response>,
    level: LevelFilter,
) -> TerminationReason {
    let subscriber = log_forward::subscriber(responses.clone(), level);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        tracing::subscriber::with_default(subscriber, || -> std::result::Result<(), WorkerFault> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(WorkerHost::new(responses).serve(requests))
        })
    }));

    match outcome {
        Ok(Ok(())) => TerminationReason::Exited(0),
        Ok(Err(fault)) => TerminationReason::Fault(fault.to_string()),
        Err(payload) => TerminationReason::Panicked(panic_message(payload.as_ref())),
    }
}

impl Backend for ThreadBackend {
    fn name(&self) -> &str {
        "thread"
    }

    fn launch(&self) -> Result<WorkerLink> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let level = self.log_level;

        std::thread::Builder::new()
            .name("clonifier-worker".to_string())
            .spawn(move || {
                let reason = run_worker_thread(req_rx, resp_tx, level);
                let _ = exit_tx.send(reason);
            })
            .map_err(|e| BridgeError::Launch(format!("failed to spawn worker thread: {}", e)))?;

        // Responses are relayed before the exit notice: the response channel
        // only closes once every sender inside the thread has been dropped.
        tokio::spawn(async move {
            while let Some(response) = resp_rx.recv().await {
                if event_tx.send(WorkerEvent::Message(response)).is_err() {
                    return;
                }
            }
            let reason = exit_rx.await.unwrap_or(TerminationReason::Disconnected);
            debug!(reason = %reason, "Worker thread finished");
            let _ = event_tx.send(WorkerEvent::Exited(reason));
        });

        Ok(WorkerLink {
            requests: req_tx,
            events: event_rx,
        })
    }
}
