//! Execution backends.
//!
//! A backend launches one worker and hands back a [`WorkerLink`]. The
//! supervisor only ever sees the link, so the same state machine drives a
//! child process, a thread, or a test harness playing the worker.

mod manual;
mod process;
pub mod signals;
mod thread;

pub use manual::{ManualBackend, ManualController, ManualWorker};
pub use process::ProcessBackend;
pub use signals::TerminationReason;
pub use thread::ThreadBackend;

use crate::config::{BackendKind, BridgeConfig};
use crate::error::Result;
use crate::protocol::{Request, Response};
use tokio::sync::mpsc;

/// Something that happened on a worker link.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(Response),
    /// The worker is gone. Always the last event of a link.
    Exited(TerminationReason),
    /// The worker produced output that is not a valid message.
    Corrupt(String),
}

/// The two halves of a running worker's channel.
#[derive(Debug)]
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<Request>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Starts workers.
pub trait Backend: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Start a worker. Must be called from within a tokio runtime.
    ///
    /// A worker that starts but dies before announcing readiness is reported
    /// through an `Exited` event on the returned link, not through `Err`.
    fn launch(&self) -> Result<WorkerLink>;
}

/// Build the backend for `kind`.
pub fn from_kind(kind: BackendKind, config: &BridgeConfig) -> Box<dyn Backend> {
    match kind {
        BackendKind::Process => Box::new(ProcessBackend::new(
            config.worker_exe.clone(),
            config.worker_log_level,
        )),
        BackendKind::Thread => Box::new(ThreadBackend::new(config.worker_log_level)),
    }
}

/// Primary and optional fallback backend for `config`.
pub fn from_config(config: &BridgeConfig) -> (Box<dyn Backend>, Option<Box<dyn Backend>>) {
    (
        from_kind(config.primary, config),
        config.fallback.map(|kind| from_kind(kind, config)),
    )
}
