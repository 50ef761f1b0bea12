//! Termination analysis for dead workers.

use std::process::ExitStatus;

#[cfg(unix)]
use nix::sys::signal::Signal;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    #[cfg(unix)]
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from OOM killer).
    OutOfMemory,
    /// Stack overflow or bad memory access (SIGSEGV / SIGBUS).
    StackOverflow,
    /// The worker thread panicked.
    Panicked(String),
    /// The worker host stopped on a fatal condition.
    Fault(String),
    /// The backend could not start the worker at all.
    LaunchFailed(String),
    /// The link closed without any exit information.
    Disconnected,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            #[cfg(unix)]
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL from OOM killer)".to_string(),
            Self::StackOverflow => "crashed (SIGSEGV/SIGBUS)".to_string(),
            Self::Panicked(msg) => format!("panicked: {}", msg),
            Self::Fault(msg) => format!("stopped on fault: {}", msg),
            Self::LaunchFailed(msg) => format!("failed to launch: {}", msg),
            Self::Disconnected => "disconnected".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze the exit status of a worker process.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(raw) = status.signal()
            && let Ok(signal) = Signal::try_from(raw)
        {
            return match signal {
                Signal::SIGKILL => TerminationReason::OutOfMemory,
                Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::StackOverflow,
                _ => TerminationReason::Signaled(signal),
            };
        }
    }

    TerminationReason::Disconnected
}

/// Extract the message of a caught panic.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Information about a worker failure.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Backend that ran the worker.
    pub backend: String,
    /// Why the worker terminated.
    pub reason: TerminationReason,
    /// What the supervisor was doing when it failed.
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(backend: impl Into<String>, reason: TerminationReason) -> Self {
        Self {
            backend: backend.into(),
            reason,
            context: None,
        }
    }

    /// Add context about what the supervisor was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} worker {}", self.backend, self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::OutOfMemory.is_success());
        assert!(!TerminationReason::Panicked("boom".into()).is_success());
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        // raw wait status: exit code lives in the high byte
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(3));

        let status = ExitStatus::from_raw(Signal::SIGKILL as i32);
        assert_eq!(analyze_exit_status(status), TerminationReason::OutOfMemory);

        let status = ExitStatus::from_raw(Signal::SIGTERM as i32);
        assert_eq!(
            analyze_exit_status(status),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(payload.as_ref()), "index out of bounds");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new("process", TerminationReason::Exited(2))
            .with_context("starting up");

        let display = failure.to_string();
        assert!(display.contains("process worker"));
        assert!(display.contains("exited with code 2"));
        assert!(display.contains("while starting up"));
    }
}
