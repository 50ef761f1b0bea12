//! A backend whose worker is played by the caller.
//!
//! Every launch hands a [`ManualWorker`] to the paired [`ManualController`].
//! Tests use it to script exact response orderings, crashes and bootstrap
//! failures; embedders can use it to host the worker loop themselves.

use super::{Backend, TerminationReason, WorkerEvent, WorkerLink};
use crate::error::{BridgeError, Result};
use crate::protocol::{Request, Response};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub struct ManualBackend {
    name: String,
    fail_launch: Option<String>,
    workers: mpsc::UnboundedSender<ManualWorker>,
    launches: Arc<AtomicUsize>,
}

impl ManualBackend {
    pub fn new(name: impl Into<String>) -> (Self, ManualController) {
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        let launches = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.into(),
                fail_launch: None,
                workers: workers_tx,
                launches: Arc::clone(&launches),
            },
            ManualController {
                workers: workers_rx,
                launches,
            },
        )
    }

    /// A backend whose every launch fails with `reason`.
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> (Self, ManualController) {
        let (mut backend, controller) = Self::new(name);
        backend.fail_launch = Some(reason.into());
        (backend, controller)
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self) -> Result<WorkerLink> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_launch {
            return Err(BridgeError::Launch(reason.clone()));
        }

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.workers
            .send(ManualWorker {
                requests: req_rx,
                events: event_tx,
            })
            .map_err(|_| BridgeError::Launch(format!("{} controller dropped", self.name)))?;

        Ok(WorkerLink {
            requests: req_tx,
            events: event_rx,
        })
    }
}

/// Receives the workers launched by a [`ManualBackend`].
pub struct ManualController {
    workers: mpsc::UnboundedReceiver<ManualWorker>,
    launches: Arc<AtomicUsize>,
}

impl ManualController {
    /// Wait for the next launch.
    pub async fn next_worker(&mut self) -> Option<ManualWorker> {
        self.workers.recv().await
    }

    /// Number of launch attempts so far, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

/// The caller's end of one launched worker.
pub struct ManualWorker {
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ManualWorker {
    /// Next request from the supervisor; `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Request> {
        self.requests.recv().await
    }

    /// A request that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<Request> {
        self.requests.try_recv().ok()
    }

    pub fn respond(&self, response: Response) {
        let _ = self.events.send(WorkerEvent::Message(response));
    }

    pub fn ready(&self) {
        self.respond(Response::Ready);
    }

    /// Emit bytes that are not a valid message.
    pub fn corrupt(&self, output: impl Into<String>) {
        let _ = self.events.send(WorkerEvent::Corrupt(output.into()));
    }

    /// Terminate the worker.
    pub fn exit(self, reason: TerminationReason) {
        let _ = self.events.send(WorkerEvent::Exited(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_hands_worker_to_controller() {
        let (backend, mut controller) = ManualBackend::new("manual");
        let mut link = backend.launch().unwrap();
        let mut worker = controller.next_worker().await.unwrap();
        assert_eq!(controller.launches(), 1);

        link.requests.send(Request::DebugListObjects).unwrap();
        assert_eq!(worker.recv().await, Some(Request::DebugListObjects));

        worker.ready();
        assert_eq!(
            link.events.recv().await,
            Some(WorkerEvent::Message(Response::Ready))
        );

        worker.exit(TerminationReason::Exited(3));
        assert_eq!(
            link.events.recv().await,
            Some(WorkerEvent::Exited(TerminationReason::Exited(3)))
        );
    }

    #[tokio::test]
    async fn test_failing_backend_counts_attempts() {
        let (backend, controller) = ManualBackend::failing("broken", "no sandbox");
        let err = backend.launch().unwrap_err();
        assert_eq!(err, BridgeError::Launch("no sandbox".to_string()));
        assert_eq!(controller.launches(), 1);
    }
}
