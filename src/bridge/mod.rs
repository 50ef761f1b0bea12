//! UI side of the bridge.
//!
//! A [`Connection`] is the explicit context object for one worker: it owns
//! the pending-call table, the supervisor and the worker log buffer, and is
//! passed to everything that talks to the worker. Cloning it is cheap and
//! every clone refers to the same worker.
//!
//! A background task drives the worker link: it launches the primary
//! backend, falls back once if the primary fails before it is ready, routes
//! responses to their callers, and raises the fatal error when the worker
//! is lost for good.

pub mod calls;
pub mod handle;
pub mod logs;
pub mod proxies;
pub mod supervisor;

pub use handle::{Handle, Proxy, RawReply, Reply};
pub use proxies::{Assembly, AssemblyResult, PcrResults, Pcrer, RemoteObject, Seq};
pub use supervisor::SupervisorState;

use crate::backend::signals::WorkerFailure;
use crate::backend::{self, Backend, TerminationReason, WorkerEvent};
use crate::config::{BridgeConfig, DEFAULT_LOG_CAPACITY};
use crate::error::{BridgeError, FatalError, Result};
use crate::protocol::{
    Arg, ArgKind, CallId, LogLevel, ObjectId, ObjectType, Request, Response, ReturnValue,
};
use calls::{CallTable, Settled};
use handle::{Decoder, decode_any, decode_object};
use logs::{LogBuffer, LogEntry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use supervisor::{BootstrapOutcome, Supervisor};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type FatalHandler = Arc<dyn Fn(&FatalError) + Send + Sync>;

/// Per-connection settings that are not about backends.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub call_timeout: Option<Duration>,
    pub log_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            call_timeout: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl From<&BridgeConfig> for ConnectionOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            call_timeout: config.call_timeout,
            log_capacity: config.log_capacity,
        }
    }
}

struct Core {
    calls: CallTable,
    supervisor: Supervisor,
    fatal_handler: Option<FatalHandler>,
}

/// What the fatal handler needs, taken under the same lock that recorded
/// the fault.
struct FatalNotice {
    error: FatalError,
    pending_calls: usize,
    handler: Option<FatalHandler>,
}

impl Core {
    fn fatal_notice(&self, error: FatalError) -> FatalNotice {
        FatalNotice {
            error,
            pending_calls: self.calls.len(),
            handler: self.fatal_handler.clone(),
        }
    }
}

struct Inner {
    id: u64,
    core: Mutex<Core>,
    state: watch::Sender<SupervisorState>,
    logs: Mutex<LogBuffer>,
    next_serial: AtomicU64,
    call_timeout: Option<Duration>,
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().expect("connection mutex poisoned")
    }

    fn publish(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(connection = self.id, state = %state, "Supervisor state changed");
        }
    }

    fn attach(&self, requests: mpsc::UnboundedSender<Request>) {
        self.core().supervisor.attach(requests);
    }

    /// Route one worker message.
    fn dispatch(&self, response: Response) -> std::result::Result<(), FatalError> {
        match response {
            Response::Ready => {
                let state = {
                    let mut core = self.core();
                    core.supervisor.on_ready();
                    core.supervisor.state()
                };
                info!(connection = self.id, state = %state, "Worker ready");
                self.publish(state);
                Ok(())
            }
            Response::Log { level, message } => {
                self.record_log(level, message);
                Ok(())
            }
            Response::Call { call_id, value } => self.settle(call_id, Ok(value)),
            Response::New {
                call_id,
                target_type,
                id,
            } => self.settle(
                call_id,
                Ok(ReturnValue::Object {
                    object_type: target_type,
                    id,
                }),
            ),
            Response::Error { call_id, error } => self.settle(call_id, Err(BridgeError::Call(error))),
        }
    }

    fn settle(&self, call_id: CallId, outcome: Result<ReturnValue>) -> std::result::Result<(), FatalError> {
        let mut core = self.core();
        trace!(
            call_id,
            function = core.calls.label(call_id).unwrap_or("?"),
            ok = outcome.is_ok(),
            "Settling call"
        );
        if let Settled::Orphaned(Some(value)) = core.calls.settle(call_id, outcome)? {
            for id in value.object_ids() {
                debug!(call_id, object_id = id, "Releasing object nobody is waiting for");
                let _ = core.supervisor.submit(Request::Delete { target: id });
            }
        }
        Ok(())
    }

    fn record_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!(target: "clonifier::worker", "{}", message),
            LogLevel::Warn => warn!(target: "clonifier::worker", "{}", message),
            LogLevel::Info => info!(target: "clonifier::worker", "{}", message),
            LogLevel::Debug => debug!(target: "clonifier::worker", "{}", message),
            LogLevel::Trace => trace!(target: "clonifier::worker", "{}", message),
        }
        self.logs
            .lock()
            .expect("log buffer mutex poisoned")
            .push(level, message);
    }

    /// Move to `Faulted` and notify, unless already terminal.
    fn raise_fatal(&self, error: FatalError) {
        let notice = {
            let mut core = self.core();
            if core.supervisor.state().is_terminal() {
                return;
            }
            core.supervisor.fault(error.clone());
            core.fatal_notice(error)
        };
        self.publish(SupervisorState::Faulted);
        self.notify_fatal(notice);
    }

    fn bootstrap_failed(&self, reason: String) -> Option<BootstrapOutcome> {
        let (outcome, state, notice) = {
            let mut core = self.core();
            if core.supervisor.state().is_terminal() {
                return None;
            }
            let outcome = core.supervisor.on_bootstrap_failure(reason.clone());
            let notice = match &outcome {
                BootstrapOutcome::Fatal(error) => Some(core.fatal_notice(error.clone())),
                BootstrapOutcome::LaunchFallback => None,
            };
            (outcome, core.supervisor.state(), notice)
        };
        self.publish(state);
        match notice {
            Some(notice) => self.notify_fatal(notice),
            None => {
                warn!(connection = self.id, "Worker failed to start ({}), trying fallback", reason)
            }
        }
        Some(outcome)
    }

    fn begin_fallback(&self) {
        let state = {
            let mut core = self.core();
            core.supervisor.begin_fallback();
            core.supervisor.state()
        };
        self.publish(state);
    }

    fn notify_fatal(&self, notice: FatalNotice) {
        error!(
            connection = self.id,
            pending_calls = notice.pending_calls,
            "Worker connection lost: {}",
            notice.error
        );
        if let Some(handler) = notice.handler {
            handler(&notice.error);
        }
    }
}

/// How a worker link ended.
enum LinkEnd {
    /// Nothing more to do: faulted, stopped, or the connection is gone.
    Done,
    /// The worker failed before it was ready.
    BootstrapFailed(String),
}

async fn run_link(
    weak: &Weak<Inner>,
    backend: &str,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) -> LinkEnd {
    loop {
        let event = events
            .recv()
            .await
            .unwrap_or(WorkerEvent::Exited(TerminationReason::Disconnected));
        let Some(inner) = weak.upgrade() else {
            return LinkEnd::Done;
        };

        match event {
            WorkerEvent::Message(response) => {
                if let Err(fatal) = inner.dispatch(response) {
                    inner.raise_fatal(fatal);
                    return LinkEnd::Done;
                }
            }
            WorkerEvent::Corrupt(output) => {
                let state = *inner.state.borrow();
                if state.is_terminal() {
                    return LinkEnd::Done;
                }
                if state.is_ready() {
                    inner.raise_fatal(FatalError::ProtocolDesync(output));
                    return LinkEnd::Done;
                }
                // a worker that cannot even say `ready` is a failed start
                return LinkEnd::BootstrapFailed(format!(
                    "{} worker wrote {} while starting up",
                    backend, output
                ));
            }
            WorkerEvent::Exited(reason) => {
                let state = *inner.state.borrow();
                if state.is_terminal() {
                    debug!(backend, reason = %reason, "Worker exited after shutdown");
                    return LinkEnd::Done;
                }
                let failure = WorkerFailure::new(backend, reason);
                if state.is_ready() {
                    let fatal = match &failure.reason {
                        TerminationReason::Fault(_) => FatalError::ProtocolDesync(failure.to_string()),
                        _ => FatalError::Runtime(failure.to_string()),
                    };
                    inner.raise_fatal(fatal);
                    return LinkEnd::Done;
                }
                return LinkEnd::BootstrapFailed(failure.with_context("starting up").to_string());
            }
        }
    }
}

/// Drive the worker for one connection until it is stopped or lost.
async fn supervise(
    weak: Weak<Inner>,
    primary: Box<dyn Backend>,
    mut fallback: Option<Box<dyn Backend>>,
) {
    let mut backend = primary;
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.state.borrow().is_terminal() {
            return;
        }

        debug!(connection = inner.id, backend = backend.name(), "Launching worker");
        let end = match backend.launch() {
            Ok(link) => {
                inner.attach(link.requests);
                drop(inner);
                run_link(&weak, backend.name(), link.events).await
            }
            Err(e) => {
                drop(inner);
                let failure =
                    WorkerFailure::new(backend.name(), TerminationReason::LaunchFailed(e.to_string()));
                LinkEnd::BootstrapFailed(failure.to_string())
            }
        };

        let LinkEnd::BootstrapFailed(reason) = end else {
            return;
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.bootstrap_failed(reason) {
            Some(BootstrapOutcome::LaunchFallback) => match fallback.take() {
                Some(next) => {
                    inner.begin_fallback();
                    backend = next;
                }
                None => {
                    inner.raise_fatal(FatalError::BootstrapNoFallback(
                        "fallback backend unavailable".to_string(),
                    ));
                    return;
                }
            },
            Some(BootstrapOutcome::Fatal(_)) | None => return,
        }
    }
}

/// Connection to one worker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Start a worker with the backends named in `config`.
    ///
    /// Must be called from within a tokio runtime. Calls may be issued
    /// immediately; they are buffered until the worker is ready.
    pub fn start(config: &BridgeConfig) -> Self {
        let (primary, fallback) = backend::from_config(config);
        Self::with_backends(primary, fallback, ConnectionOptions::from(config))
    }

    pub fn with_backends(
        primary: Box<dyn Backend>,
        fallback: Option<Box<dyn Backend>>,
        options: ConnectionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            core: Mutex::new(Core {
                calls: CallTable::new(),
                supervisor: Supervisor::new(fallback.is_some()),
                fatal_handler: None,
            }),
            state,
            logs: Mutex::new(LogBuffer::new(options.log_capacity)),
            next_serial: AtomicU64::new(1),
            call_timeout: options.call_timeout,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), primary, fallback));
        Self { inner }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Observe supervisor state changes.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Wait until the worker is ready, or fail if it never will be.
    pub async fn ready(&self) -> Result<()> {
        let mut states = self.watch_state();
        loop {
            let state = *states.borrow_and_update();
            match state {
                SupervisorState::Ready | SupervisorState::ReadyFallback => return Ok(()),
                SupervisorState::Faulted => {
                    return Err(self
                        .fatal_error()
                        .map(BridgeError::Fatal)
                        .unwrap_or(BridgeError::Closed));
                }
                SupervisorState::Stopped => return Err(BridgeError::Closed),
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(BridgeError::Closed);
            }
        }
    }

    /// Install the handler told about the fatal error. It runs once; if the
    /// connection already faulted it runs immediately.
    pub fn on_fatal(&self, handler: impl Fn(&FatalError) + Send + Sync + 'static) {
        let handler: FatalHandler = Arc::new(handler);
        // a fault recorded before this point already took the previous handler
        let raised = {
            let mut core = self.inner.core();
            core.fatal_handler = Some(Arc::clone(&handler));
            core.supervisor.fatal_error().cloned()
        };
        if let Some(error) = raised {
            handler(&error);
        }
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.inner.core().supervisor.fatal_error().cloned()
    }

    /// Send a request. Requests that expect an answer get a call id; one-way
    /// requests resolve to `null` as soon as they are queued.
    pub fn send(&self, mut request: Request) -> RawReply {
        let mut core = self.inner.core();
        if let Some(err) = core.supervisor.refusal() {
            return RawReply::ready(Err(err));
        }

        let label = match &request {
            Request::Call(call) => call.function.clone(),
            Request::New(new) => new.class.to_string(),
            Request::Delete { .. } | Request::DebugListObjects => {
                let queued = core.supervisor.submit(request);
                return RawReply::ready(queued.map(|()| ReturnValue::Value(serde_json::Value::Null)));
            }
        };

        let (call_id, receiver) = core.calls.register(label);
        request.set_call_id(call_id);
        trace!(call_id, "Sending request");
        if let Err(err) = core.supervisor.submit(request) {
            core.calls.cancel(call_id);
            return RawReply::ready(Err(err));
        }
        RawReply::pending(call_id, receiver, self.inner.call_timeout)
    }

    /// Low-level call: `function` on `target`, or a free function.
    pub fn call(
        &self,
        target: Option<ObjectId>,
        function: &str,
        args: Vec<Arg>,
        ret_kind: ArgKind,
    ) -> RawReply {
        self.send(Request::call(target, function, args, ret_kind))
    }

    /// Call and decode the reply.
    pub fn invoke<T>(
        &self,
        target: Option<ObjectId>,
        function: &str,
        args: Vec<Arg>,
        ret_kind: ArgKind,
        decode: Decoder<T>,
    ) -> Reply<T> {
        Reply::new(self.call(target, function, args, ret_kind), self.clone(), decode)
    }

    /// Construct a worker object of any class.
    pub fn new_object(&self, class: ObjectType, args: Vec<Arg>) -> Reply<RemoteObject> {
        Reply::new(
            self.send(Request::new_object(class, args)),
            self.clone(),
            decode_any,
        )
    }

    /// Construct a worker object of the proxy's class.
    pub fn construct_with<P: Proxy>(&self, args: impl FnOnce() -> Result<Vec<Arg>>) -> Reply<P> {
        match args() {
            Ok(args) => Reply::new(
                self.send(Request::new_object(P::TYPE, args)),
                self.clone(),
                decode_object,
            ),
            Err(err) => Reply::failed(self, err),
        }
    }

    /// Number of calls waiting for the worker.
    pub fn pending_calls(&self) -> usize {
        self.inner.core().calls.len()
    }

    /// Ask the worker to log every live object.
    pub fn debug_list_objects(&self) -> Result<()> {
        self.inner.core().supervisor.submit(Request::DebugListObjects)
    }

    /// Recent worker log entries, oldest first.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner
            .logs
            .lock()
            .expect("log buffer mutex poisoned")
            .snapshot()
    }

    /// Close the worker link. Every call still waiting fails with
    /// [`BridgeError::Abandoned`]; their ids are returned.
    pub fn shutdown(&self) -> Vec<CallId> {
        let abandoned = {
            let mut core = self.inner.core();
            if core.supervisor.state() == SupervisorState::Stopped {
                return Vec::new();
            }
            core.supervisor.stop();
            core.calls.abandon_all()
        };
        self.inner.publish(SupervisorState::Stopped);
        for (call_id, label) in &abandoned {
            warn!(call_id, function = %label, "Call abandoned by shutdown");
        }
        info!(connection = self.inner.id, abandoned = abandoned.len(), "Connection shut down");
        abandoned.into_iter().map(|(id, _)| id).collect()
    }

    pub(crate) fn release(&self, id: ObjectId) {
        trace!(object_id = id, "Releasing worker object");
        // nothing to release once the worker is gone
        let _ = self
            .inner
            .core()
            .supervisor
            .submit(Request::Delete { target: id });
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.inner.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}
