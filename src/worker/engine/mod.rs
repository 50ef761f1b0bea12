//! Compute engine reachable through the bridge.
//!
//! Every worker-side class is one variant of [`WorkerObject`]. Dispatch is a
//! static match on class and method name; there is no reflection.

mod assembly;
mod pcr;
mod seq;

pub use assembly::{Assembly, AssemblyResult};
pub use pcr::{PcrResults, Pcrer};
pub use seq::{BIN_FORMAT_VERSION, Sequence, parse_bin, parse_fasta};

use crate::protocol::{ArgKind, ObjectType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

/// A recoverable failure of one engine operation, reported to the caller as
/// an `error` response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CallError(String);

impl CallError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    fn no_method(class: &str, method: &str) -> Self {
        Self(format!("{} has no method '{}'", class, method))
    }
}

pub type CallResult<T> = std::result::Result<T, CallError>;

/// A live worker-side object.
///
/// Cloning is cheap (shared immutable data) and is how object arguments are
/// lent to a call without taking them away from their owner.
#[derive(Debug, Clone)]
pub enum WorkerObject {
    Seq(Arc<Sequence>),
    Assembly(Assembly),
    AssemblyResult(Arc<AssemblyResult>),
    Pcrer(Pcrer),
    PcrResults(Arc<PcrResults>),
}

impl WorkerObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            WorkerObject::Seq(_) => ObjectType::Seq,
            WorkerObject::Assembly(_) => ObjectType::Assembly,
            WorkerObject::AssemblyResult(_) => ObjectType::AssemblyResult,
            WorkerObject::Pcrer(_) => ObjectType::Pcrer,
            WorkerObject::PcrResults(_) => ObjectType::PcrResults,
        }
    }

    /// One-line description for debug listings.
    pub fn describe(&self) -> String {
        match self {
            WorkerObject::Seq(seq) => format!(
                "Seq {:?} ({} bp{})",
                seq.name.as_deref().unwrap_or(""),
                seq.len(),
                if seq.circular { ", circular" } else { "" }
            ),
            WorkerObject::Assembly(asm) => format!("Assembly ({} fragments)", asm.len()),
            WorkerObject::AssemblyResult(res) => {
                format!("AssemblyResult ({} fragments)", res.fragment_count())
            }
            WorkerObject::Pcrer(pcr) => format!("Pcrer ({})", pcr.describe()),
            WorkerObject::PcrResults(res) => {
                format!("PcrResults ({} products)", res.product_count())
            }
        }
    }

    /// The object left the table. A PCR job still scanning is stopped.
    pub fn release(&self) {
        if let WorkerObject::Pcrer(pcr) = self {
            pcr.cancel();
        }
    }

    /// Invoke `method` on this object.
    pub fn call(&mut self, method: &str, args: &mut Args) -> CallResult<Output> {
        match self {
            WorkerObject::Seq(seq) => seq::call(seq, method, args),
            WorkerObject::Assembly(asm) => asm.call(method, args),
            WorkerObject::AssemblyResult(res) => assembly::call_result(res, method, args),
            WorkerObject::Pcrer(pcr) => pcr.call(method, args),
            WorkerObject::PcrResults(res) => pcr::call_results(res, method, args),
        }
    }
}

/// Argument after object ids were resolved against the object table.
#[derive(Debug, Clone)]
pub enum ResolvedArg {
    Value(serde_json::Value),
    Object(WorkerObject),
    Objects(Vec<WorkerObject>),
    Binary(Vec<u8>),
}

/// Positional arguments of one call.
#[derive(Debug, Default)]
pub struct Args {
    args: Vec<ResolvedArg>,
}

impl Args {
    pub fn new(args: Vec<ResolvedArg>) -> Self {
        Self { args }
    }

    fn missing(idx: usize) -> CallError {
        CallError::new(format!("Missing argument {}", idx))
    }

    /// Decode a `value` argument.
    pub fn value<T: DeserializeOwned>(&self, idx: usize) -> CallResult<T> {
        match self.args.get(idx) {
            Some(ResolvedArg::Value(v)) => serde_json::from_value(v.clone())
                .map_err(|e| CallError::new(format!("Argument {}: {}", idx, e))),
            Some(_) => Err(CallError::new(format!("Argument {} is not a value", idx))),
            None => Err(Self::missing(idx)),
        }
    }

    /// Like [`Args::value`], with a missing or `null` argument read as `None`.
    pub fn opt_value<T: DeserializeOwned>(&self, idx: usize) -> CallResult<Option<T>> {
        match self.args.get(idx) {
            None | Some(ResolvedArg::Value(serde_json::Value::Null)) => Ok(None),
            Some(_) => self.value(idx).map(Some),
        }
    }

    pub fn object(&self, idx: usize) -> CallResult<&WorkerObject> {
        match self.args.get(idx) {
            Some(ResolvedArg::Object(obj)) => Ok(obj),
            Some(_) => Err(CallError::new(format!("Argument {} is not an object", idx))),
            None => Err(Self::missing(idx)),
        }
    }

    pub fn seq(&self, idx: usize) -> CallResult<Arc<Sequence>> {
        match self.object(idx)? {
            WorkerObject::Seq(seq) => Ok(Arc::clone(seq)),
            other => Err(CallError::new(format!(
                "Argument {} must be a Seq, got {}",
                idx,
                other.object_type()
            ))),
        }
    }

    /// Take ownership of a binary argument.
    pub fn take_binary(&mut self, idx: usize) -> CallResult<Vec<u8>> {
        match self.args.get_mut(idx) {
            Some(ResolvedArg::Binary(bytes)) => Ok(std::mem::take(bytes)),
            Some(_) => Err(CallError::new(format!("Argument {} is not binary", idx))),
            None => Err(Self::missing(idx)),
        }
    }
}

/// What an engine operation produced, before objects get ids.
#[derive(Debug)]
pub enum Output {
    Value(serde_json::Value),
    Object(WorkerObject),
    Objects(Vec<WorkerObject>),
    Binary(Vec<u8>),
}

impl Output {
    pub fn value(value: impl Serialize) -> CallResult<Output> {
        serde_json::to_value(value)
            .map(Output::Value)
            .map_err(|e| CallError::new(format!("Couldn't encode result: {}", e)))
    }

    pub fn unit() -> CallResult<Output> {
        Ok(Output::Value(serde_json::Value::Null))
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Output::Value(_) => ArgKind::Value,
            Output::Object(_) => ArgKind::Object,
            Output::Objects(_) => ArgKind::ObjectArray,
            Output::Binary(_) => ArgKind::Binary,
        }
    }
}

/// Invoke a free function.
pub fn call_function(name: &str, args: &mut Args) -> CallResult<Output> {
    match name {
        "tester" => {
            let n: u32 = args.value(0)?;
            Output::value(n)
        }
        "parse_fasta" => {
            let data = args.take_binary(0)?;
            let seqs = parse_fasta(&data)?;
            Ok(Output::Objects(
                seqs.into_iter()
                    .map(|s| WorkerObject::Seq(Arc::new(s)))
                    .collect(),
            ))
        }
        "parse_bin" => {
            let data = args.take_binary(0)?;
            Ok(Output::Object(WorkerObject::Seq(Arc::new(parse_bin(&data)?))))
        }
        _ => Err(CallError::new(format!("Unknown function '{}'", name))),
    }
}

/// Construct an object of `class`.
pub fn construct(class: ObjectType, args: &mut Args) -> CallResult<WorkerObject> {
    match class {
        ObjectType::Assembly => Ok(WorkerObject::Assembly(Assembly::default())),
        ObjectType::Pcrer => Pcrer::start(args).map(WorkerObject::Pcrer),
        ObjectType::Seq | ObjectType::AssemblyResult | ObjectType::PcrResults => Err(
            CallError::new(format!("{} cannot be constructed directly", class)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tester_echoes_argument() {
        let mut args = Args::new(vec![ResolvedArg::Value(json!(7))]);
        match call_function("tester", &mut args).unwrap() {
            Output::Value(v) => assert_eq!(v, json!(7)),
            other => panic!("Expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function_is_call_error() {
        let err = call_function("frobnicate", &mut Args::default()).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_parse_fasta_yields_seq_objects() {
        let mut args = Args::new(vec![ResolvedArg::Binary(b">a\nAC\n>b\nGT\n".to_vec())]);
        let out = call_function("parse_fasta", &mut args).unwrap();
        assert_eq!(out.kind(), ArgKind::ObjectArray);
        match out {
            Output::Objects(objs) => {
                assert_eq!(objs.len(), 2);
                assert!(objs.iter().all(|o| o.object_type() == ObjectType::Seq));
            }
            other => panic!("Expected objects, got {:?}", other),
        }
    }

    #[test]
    fn test_seq_cannot_be_constructed() {
        let err = construct(ObjectType::Seq, &mut Args::default()).unwrap_err();
        assert!(err.to_string().contains("cannot be constructed"));
    }

    #[test]
    fn test_argument_type_errors() {
        let mut args = Args::new(vec![ResolvedArg::Value(json!("x"))]);
        assert!(args.value::<u32>(0).is_err());
        assert!(args.object(0).is_err());
        assert!(args.take_binary(0).is_err());
        assert!(args.value::<String>(1).unwrap_err().to_string().contains("Missing"));
        assert_eq!(args.opt_value::<String>(3).unwrap(), None);
    }

    #[test]
    fn test_unknown_method_names_class() {
        let mut obj = WorkerObject::Seq(Arc::new(Sequence::new("s", b"ACGT".to_vec())));
        let err = obj.call("fly", &mut Args::default()).unwrap_err();
        assert_eq!(err.to_string(), "Seq has no method 'fly'");
    }
}
