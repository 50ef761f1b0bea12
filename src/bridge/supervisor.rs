//! Worker supervisor.
//!
//! Tracks the lifecycle of the worker behind a connection:
//!
//! ```text
//! Starting ──ready──▶ Ready ──exit──▶ Faulted
//!    │
//!    └─exit/launch error─▶ StartFailed ─▶ StartingFallback ──ready──▶ ReadyFallback ──exit──▶ Faulted
//!                                               │
//!                                               └─exit/launch error─▶ Faulted
//! ```
//!
//! Requests submitted before the worker is ready are buffered and flushed in
//! submission order on `ready`. The fallback is tried at most once, and only
//! for failures before the primary was ever ready. `Faulted` and `Stopped`
//! are terminal.

use crate::error::{BridgeError, FatalError, Result};
use crate::protocol::Request;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Ready,
    StartFailed,
    StartingFallback,
    ReadyFallback,
    Faulted,
    Stopped,
}

impl SupervisorState {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::ReadyFallback)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::StartFailed => "start-failed",
            Self::StartingFallback => "starting-fallback",
            Self::ReadyFallback => "ready-fallback",
            Self::Faulted => "faulted",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after the worker failed before it was ready.
#[derive(Debug, PartialEq)]
pub enum BootstrapOutcome {
    LaunchFallback,
    Fatal(FatalError),
}

#[derive(Debug)]
pub struct Supervisor {
    state: SupervisorState,
    buffer: VecDeque<Request>,
    link: Option<mpsc::UnboundedSender<Request>>,
    has_fallback: bool,
    primary_failure: Option<String>,
    fatal: Option<FatalError>,
}

impl Supervisor {
    pub fn new(has_fallback: bool) -> Self {
        Self {
            state: SupervisorState::Starting,
            buffer: VecDeque::new(),
            link: None,
            has_fallback,
            primary_failure: None,
            fatal: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn fatal_error(&self) -> Option<&FatalError> {
        self.fatal.as_ref()
    }

    /// Requests waiting for the worker to become ready.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The error every new request fails with, if any.
    pub fn refusal(&self) -> Option<BridgeError> {
        match self.state {
            SupervisorState::Faulted => Some(
                self.fatal
                    .clone()
                    .map(BridgeError::Fatal)
                    .unwrap_or(BridgeError::Closed),
            ),
            SupervisorState::Stopped => Some(BridgeError::Closed),
            _ => None,
        }
    }

    /// Use `link` for the worker that is currently starting.
    pub fn attach(&mut self, link: mpsc::UnboundedSender<Request>) {
        self.link = Some(link);
    }

    /// Send now, or buffer until the worker is ready.
    pub fn submit(&mut self, request: Request) -> Result<()> {
        if let Some(err) = self.refusal() {
            return Err(err);
        }
        if self.state.is_ready()
            && let Some(link) = &self.link
        {
            // a closed link means the worker just died; its exit event
            // moves the supervisor to Faulted
            if link.send(request).is_err() {
                debug!("Worker link closed while sending");
            }
        } else {
            self.buffer.push_back(request);
        }
        Ok(())
    }

    /// The worker announced readiness. Flushes the buffer in order.
    pub fn on_ready(&mut self) {
        self.state = match self.state {
            SupervisorState::Starting => SupervisorState::Ready,
            SupervisorState::StartingFallback => SupervisorState::ReadyFallback,
            other => {
                warn!(state = %other, "Ignoring unexpected ready notification");
                return;
            }
        };
        let Some(link) = &self.link else {
            return;
        };
        debug!(buffered = self.buffer.len(), "Worker ready, flushing buffer");
        for request in self.buffer.drain(..) {
            if link.send(request).is_err() {
                debug!("Worker link closed while flushing");
                break;
            }
        }
    }

    /// The worker (or its launch) failed before it was ready.
    pub fn on_bootstrap_failure(&mut self, reason: String) -> BootstrapOutcome {
        self.link = None;
        match self.state {
            SupervisorState::Starting if self.has_fallback => {
                self.state = SupervisorState::StartFailed;
                self.primary_failure = Some(reason);
                BootstrapOutcome::LaunchFallback
            }
            SupervisorState::Starting => {
                BootstrapOutcome::Fatal(self.fault(FatalError::BootstrapNoFallback(reason)))
            }
            _ => {
                let primary = self.primary_failure.take().unwrap_or_default();
                BootstrapOutcome::Fatal(self.fault(FatalError::Bootstrap {
                    primary,
                    fallback: reason,
                }))
            }
        }
    }

    /// The fallback is about to be launched.
    pub fn begin_fallback(&mut self) {
        if self.state == SupervisorState::StartFailed {
            self.state = SupervisorState::StartingFallback;
        }
    }

    /// Enter the terminal faulted state. Buffered requests are dropped; the
    /// calls waiting for them stay pending.
    pub fn fault(&mut self, error: FatalError) -> FatalError {
        self.state = SupervisorState::Faulted;
        self.link = None;
        self.buffer.clear();
        self.fatal = Some(error.clone());
        error
    }

    /// Enter the terminal stopped state and close the link.
    pub fn stop(&mut self) {
        self.state = SupervisorState::Stopped;
        self.link = None;
        self.buffer.clear();
    }
}
