//! Message schema shared by the UI side and the worker.
//!
//! Every request that expects an answer carries a call id allocated by the
//! UI-side correlation table; the worker echoes it back in exactly one
//! `call`, `new` or `error` response. `log` and `ready` are one-way
//! notifications and never carry a call id.
//!
//! The thread backend moves these values through in-process channels as-is.
//! The process backend serializes them as newline-delimited JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into the UI-side table of pending calls.
pub type CallId = u32;

/// Index into the worker-side table of live objects.
pub type ObjectId = u32;

/// Every class the worker can hand out a handle for.
///
/// The wire tag is the variant name. Decoding maps it onto this closed set;
/// an unknown class name fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Seq,
    Assembly,
    AssemblyResult,
    Pcrer,
    PcrResults,
}

impl ObjectType {
    /// The wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Seq => "Seq",
            ObjectType::Assembly => "Assembly",
            ObjectType::AssemblyResult => "AssemblyResult",
            ObjectType::Pcrer => "Pcrer",
            ObjectType::PcrResults => "PcrResults",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an argument or a return value crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// Plain data, copied as-is.
    Value,
    /// A live worker object, referenced by id.
    Object,
    /// A list of live worker objects.
    ObjectArray,
    /// An opaque byte buffer, moved rather than copied where the transport allows.
    Binary,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::Value => "value",
            ArgKind::Object => "object",
            ArgKind::ObjectArray => "object_array",
            ArgKind::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// A positional argument, tagged with its [`ArgKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Value(serde_json::Value),
    Object(ObjectId),
    ObjectArray(Vec<ObjectId>),
    Binary(Vec<u8>),
}

impl Arg {
    /// Build a `value` argument from anything serializable.
    pub fn value(value: impl Serialize) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Arg::Value)
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Value(_) => ArgKind::Value,
            Arg::Object(_) => ArgKind::Object,
            Arg::ObjectArray(_) => ArgKind::ObjectArray,
            Arg::Binary(_) => ArgKind::Binary,
        }
    }
}

/// Per-argument kinds of an argument list.
pub fn arg_kinds(args: &[Arg]) -> Vec<ArgKind> {
    args.iter().map(Arg::kind).collect()
}

/// The payload of a successful `call` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ret_kind", content = "ret_val", rename_all = "snake_case")]
pub enum ReturnValue {
    Value(serde_json::Value),
    Object {
        object_type: ObjectType,
        id: ObjectId,
    },
    /// `object_type` is absent for an empty array.
    ObjectArray {
        object_type: Option<ObjectType>,
        ids: Vec<ObjectId>,
    },
    Binary(Vec<u8>),
}

impl ReturnValue {
    pub fn kind(&self) -> ArgKind {
        match self {
            ReturnValue::Value(_) => ArgKind::Value,
            ReturnValue::Object { .. } => ArgKind::Object,
            ReturnValue::ObjectArray { .. } => ArgKind::ObjectArray,
            ReturnValue::Binary(_) => ArgKind::Binary,
        }
    }

    /// Ids of every worker object this value hands over.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        match self {
            ReturnValue::Object { id, .. } => vec![*id],
            ReturnValue::ObjectArray { ids, .. } => ids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Invoke a free function (no target) or a method on a live object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectId>,
    pub function: String,
    pub args: Vec<Arg>,
    pub ret_kind: ArgKind,
}

/// Construct a new worker object of the named class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub call_id: CallId,
    pub class: ObjectType,
    pub args: Vec<Arg>,
}

/// Message from the UI side to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Call(CallRequest),
    New(NewRequest),
    /// Release a worker object. Fire-and-forget, never answered.
    Delete { target: ObjectId },
    /// Log every live worker object. Never answered.
    DebugListObjects,
}

impl Request {
    /// Build a call request; the call id is stamped when it is sent.
    pub fn call(
        target: Option<ObjectId>,
        function: impl Into<String>,
        args: Vec<Arg>,
        ret_kind: ArgKind,
    ) -> Self {
        Request::Call(CallRequest {
            call_id: 0,
            target,
            function: function.into(),
            args,
            ret_kind,
        })
    }

    /// Build a constructor request; the call id is stamped when it is sent.
    pub fn new_object(class: ObjectType, args: Vec<Arg>) -> Self {
        Request::New(NewRequest {
            call_id: 0,
            class,
            args,
        })
    }

    /// The correlation id, for requests that expect a response.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Request::Call(req) => Some(req.call_id),
            Request::New(req) => Some(req.call_id),
            Request::Delete { .. } | Request::DebugListObjects => None,
        }
    }

    /// Stamp the correlation id onto a request that expects a response.
    pub fn set_call_id(&mut self, id: CallId) {
        match self {
            Request::Call(req) => req.call_id = id,
            Request::New(req) => req.call_id = id,
            Request::Delete { .. } | Request::DebugListObjects => {}
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Severity of a worker log notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// Message from the worker to the UI side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Response {
    Call {
        call_id: CallId,
        value: ReturnValue,
    },
    New {
        call_id: CallId,
        target_type: ObjectType,
        id: ObjectId,
    },
    Error {
        call_id: CallId,
        error: String,
    },
    /// One-way, uncorrelated.
    Log { level: LogLevel, message: String },
    /// One-way; the worker finished bootstrapping.
    Ready,
}

impl Response {
    /// Create an error response.
    pub fn error(call_id: CallId, error: impl Into<String>) -> Self {
        Self::Error {
            call_id,
            error: error.into(),
        }
    }

    /// Create a log notification.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    /// The correlation id, for responses that settle a call.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Response::Call { call_id, .. }
            | Response::New { call_id, .. }
            | Response::Error { call_id, .. } => Some(*call_id),
            Response::Log { .. } | Response::Ready => None,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
