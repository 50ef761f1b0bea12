//! Worker side of the bridge.
//!
//! [`WorkerHost`] owns every live worker object in a [`Slab`] and answers
//! requests one at a time to completion. The host is transport agnostic: it
//! consumes [`Request`]s from a channel and emits [`Response`]s into another.
//! The thread backend wires those channels directly to the UI side, the
//! process backend wires them to stdin/stdout (see [`stdio`]).

pub mod engine;
pub mod log_forward;
pub mod stdio;

use crate::error::WorkerFault;
use crate::protocol::{
    Arg, CallId, CallRequest, NewRequest, ObjectId, Request, Response, ReturnValue, arg_kinds,
};
use crate::slab::Slab;
use engine::{Args, Output, ResolvedArg, WorkerObject};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Request loop state of one worker.
pub struct WorkerHost {
    objects: Slab<WorkerObject>,
    responses: mpsc::UnboundedSender<Response>,
}

impl WorkerHost {
    pub fn new(responses: mpsc::UnboundedSender<Response>) -> Self {
        Self {
            objects: Slab::new(),
            responses,
        }
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    fn send(&self, response: Response) -> Result<(), WorkerFault> {
        self.responses
            .send(response)
            .map_err(|_| WorkerFault::ChannelClosed)
    }

    /// Announce readiness, then serve until the request channel closes.
    ///
    /// The host yields to the runtime after every request so that background
    /// jobs (PCR scans) keep progressing under a steady request stream.
    pub async fn serve(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
    ) -> Result<(), WorkerFault> {
        self.send(Response::Ready)?;
        debug!("Worker ready");

        while let Some(request) = requests.recv().await {
            self.handle(request)?;
            tokio::task::yield_now().await;
        }

        if !self.objects.is_empty() {
            debug!(
                live = self.objects.len(),
                "Request channel closed with live objects"
            );
        }
        Ok(())
    }

    /// Handle one request. An `Err` means the worker can no longer trust its
    /// state and must stop.
    pub fn handle(&mut self, request: Request) -> Result<(), WorkerFault> {
        match request {
            Request::Call(call) => self.handle_call(call),
            Request::New(new) => self.handle_new(new),
            Request::Delete { target } => {
                let object = self
                    .objects
                    .free(target)
                    .map_err(|_| WorkerFault::UnknownObject(target))?;
                object.release();
                debug!(object_id = target, "Deleted object");
                Ok(())
            }
            Request::DebugListObjects => {
                info!(live = self.objects.len(), "Live worker objects");
                for (id, object) in self.objects.iter() {
                    info!("  [{}] {}", id, object.describe());
                }
                Ok(())
            }
        }
    }

    fn resolve(&self, args: Vec<Arg>) -> Result<Args, WorkerFault> {
        let resolved = args
            .into_iter()
            .map(|arg| {
                Ok(match arg {
                    Arg::Value(v) => ResolvedArg::Value(v),
                    Arg::Binary(bytes) => ResolvedArg::Binary(bytes),
                    Arg::Object(id) => ResolvedArg::Object(self.lookup(id)?.clone()),
                    Arg::ObjectArray(ids) => ResolvedArg::Objects(
                        ids.into_iter()
                            .map(|id| self.lookup(id).cloned())
                            .collect::<Result<_, _>>()?,
                    ),
                })
            })
            .collect::<Result<Vec<_>, WorkerFault>>()?;
        Ok(Args::new(resolved))
    }

    fn lookup(&self, id: ObjectId) -> Result<&WorkerObject, WorkerFault> {
        self.objects
            .get(id)
            .map_err(|_| WorkerFault::UnknownObject(id))
    }

    fn handle_call(&mut self, call: CallRequest) -> Result<(), WorkerFault> {
        let CallRequest {
            call_id,
            target,
            function,
            args,
            ret_kind,
        } = call;
        trace!(call_id, ?target, function = %function, args = ?arg_kinds(&args), "Call");
        let mut args = self.resolve(args)?;

        let outcome = match target {
            Some(id) => self
                .objects
                .get_mut(id)
                .map_err(|_| WorkerFault::UnknownObject(id))?
                .call(&function, &mut args),
            None => engine::call_function(&function, &mut args),
        };

        match outcome {
            Ok(output) => {
                if output.kind() != ret_kind {
                    return Err(WorkerFault::ReturnKind {
                        function,
                        expected: ret_kind,
                        actual: output.kind(),
                    });
                }
                let value = self.adopt(output);
                self.send(Response::Call { call_id, value })
            }
            Err(e) => self.reject(call_id, &function, e.to_string()),
        }
    }

    fn handle_new(&mut self, new: NewRequest) -> Result<(), WorkerFault> {
        let NewRequest {
            call_id,
            class,
            args,
        } = new;
        let mut args = self.resolve(args)?;
        match engine::construct(class, &mut args) {
            Ok(object) => {
                let id = self.objects.allocate(object);
                debug!(call_id, object_id = id, class = %class, "Constructed object");
                self.send(Response::New {
                    call_id,
                    target_type: class,
                    id,
                })
            }
            Err(e) => self.reject(call_id, class.as_str(), e.to_string()),
        }
    }

    fn reject(&self, call_id: CallId, function: &str, error: String) -> Result<(), WorkerFault> {
        warn!(call_id, function, "Call failed: {}", error);
        self.send(Response::error(call_id, error))
    }

    /// Give ids to the objects in an output.
    fn adopt(&mut self, output: Output) -> ReturnValue {
        match output {
            Output::Value(v) => ReturnValue::Value(v),
            Output::Binary(bytes) => ReturnValue::Binary(bytes),
            Output::Object(object) => {
                let object_type = object.object_type();
                ReturnValue::Object {
                    object_type,
                    id: self.objects.allocate(object),
                }
            }
            Output::Objects(objects) => {
                let object_type = objects.first().map(WorkerObject::object_type);
                let ids = objects
                    .into_iter()
                    .map(|object| self.objects.allocate(object))
                    .collect();
                ReturnValue::ObjectArray { object_type, ids }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArgKind, ObjectType};
    use serde_json::json;

    fn host() -> (WorkerHost, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerHost::new(tx), rx)
    }

    fn call(call_id: CallId, target: Option<ObjectId>, function: &str, args: Vec<Arg>, ret_kind: ArgKind) -> Request {
        let mut req = Request::call(target, function, args, ret_kind);
        req.set_call_id(call_id);
        req
    }

    fn parse_two(host: &mut WorkerHost, rx: &mut mpsc::UnboundedReceiver<Response>) -> Vec<ObjectId> {
        let fasta = Arg::Binary(b">a\nACGTACGT\n>b\nGGGG\n".to_vec());
        host.handle(call(0, None, "parse_fasta", vec![fasta], ArgKind::ObjectArray))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Call {
                call_id: 0,
                value: ReturnValue::ObjectArray { object_type, ids },
            } => {
                assert_eq!(object_type, Some(ObjectType::Seq));
                ids
            }
            other => panic!("Expected object array, got {:?}", other),
        }
    }

    #[test]
    fn test_free_function_returns_object_ids() {
        let (mut host, mut rx) = host();
        let ids = parse_two(&mut host, &mut rx);
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(host.live_objects(), 2);
    }

    #[test]
    fn test_method_call_on_target() {
        let (mut host, mut rx) = host();
        let ids = parse_two(&mut host, &mut rx);
        host.handle(call(1, Some(ids[1]), "get_metadata", vec![], ArgKind::Value))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Call {
                call_id: 1,
                value: ReturnValue::Value(v),
            } => assert_eq!(v, json!({"name": "b", "len": 4, "circular": false})),
            other => panic!("Expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_error_becomes_error_response() {
        let (mut host, mut rx) = host();
        let bad = Arg::Binary(b"ACGT\n".to_vec());
        host.handle(call(3, None, "parse_fasta", vec![bad], ArgKind::ObjectArray))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Error { call_id: 3, error } => assert!(error.contains("Parsing failed")),
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(host.live_objects(), 0);
    }

    #[test]
    fn test_empty_object_array_has_no_type_tag() {
        let (mut host, mut rx) = host();
        let empty = Arg::Binary(Vec::new());
        host.handle(call(0, None, "parse_fasta", vec![empty], ArgKind::ObjectArray))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Call {
                value: ReturnValue::ObjectArray { object_type, ids },
                ..
            } => {
                assert_eq!(object_type, None);
                assert!(ids.is_empty());
            }
            other => panic!("Expected object array, got {:?}", other),
        }
    }

    #[test]
    fn test_new_and_object_argument_is_borrowed() {
        let (mut host, mut rx) = host();
        let ids = parse_two(&mut host, &mut rx);

        let mut new = Request::new_object(ObjectType::Assembly, vec![]);
        new.set_call_id(5);
        host.handle(new).unwrap();
        let asm = match rx.try_recv().unwrap() {
            Response::New {
                call_id: 5,
                target_type: ObjectType::Assembly,
                id,
            } => id,
            other => panic!("Expected new, got {:?}", other),
        };

        host.handle(call(6, Some(asm), "push", vec![Arg::Object(ids[0])], ArgKind::Value))
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Response::Call { call_id: 6, .. }));
        // the pushed Seq is still owned by the caller
        assert_eq!(host.live_objects(), 3);
        host.handle(Request::Delete { target: ids[0] }).unwrap();
        assert_eq!(host.live_objects(), 2);
    }

    #[tokio::test]
    async fn test_deleting_pcrer_stops_its_scan() {
        let (mut host, mut rx) = host();
        let ids = parse_two(&mut host, &mut rx);

        let primers = json!([{"name": "fw", "seq": "ACGT"}, {"name": "rv", "seq": "CCCC"}]);
        let mut new = Request::new_object(
            ObjectType::Pcrer,
            vec![Arg::Object(ids[0]), Arg::Value(primers)],
        );
        new.set_call_id(1);
        host.handle(new).unwrap();
        let id = match rx.try_recv().unwrap() {
            Response::New { call_id: 1, id, .. } => id,
            other => panic!("Expected new, got {:?}", other),
        };
        let job = match host.objects.get(id).unwrap() {
            WorkerObject::Pcrer(pcr) => pcr.clone(),
            other => panic!("Expected Pcrer, got {:?}", other.object_type()),
        };

        // the scan has not been polled yet on this runtime
        host.handle(Request::Delete { target: id }).unwrap();
        while !job.status().cancelled && !job.status().done {
            tokio::task::yield_now().await;
        }
        assert!(job.status().cancelled);
    }

    #[test]
    fn test_deleted_id_is_reused() {
        let (mut host, mut rx) = host();
        let ids = parse_two(&mut host, &mut rx);
        host.handle(Request::Delete { target: ids[0] }).unwrap();
        let again = parse_two(&mut host, &mut rx);
        assert_eq!(again, vec![ids[0], 2]);
    }

    #[test]
    fn test_unknown_object_is_fatal() {
        let (mut host, _rx) = host();
        let err = host
            .handle(call(0, Some(9), "get_metadata", vec![], ArgKind::Value))
            .unwrap_err();
        assert!(matches!(err, WorkerFault::UnknownObject(9)));

        let err = host.handle(Request::Delete { target: 4 }).unwrap_err();
        assert!(matches!(err, WorkerFault::UnknownObject(4)));
    }

    #[test]
    fn test_return_kind_mismatch_is_fatal() {
        let (mut host, _rx) = host();
        let err = host
            .handle(call(0, None, "tester", vec![Arg::value(1).unwrap()], ArgKind::Object))
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerFault::ReturnKind {
                expected: ArgKind::Object,
                actual: ArgKind::Value,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_serve_announces_ready_and_stops_on_close() {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        req_tx
            .send(call(0, None, "tester", vec![Arg::value(42).unwrap()], ArgKind::Value))
            .unwrap();
        drop(req_tx);

        WorkerHost::new(resp_tx).serve(req_rx).await.unwrap();
        assert_eq!(resp_rx.recv().await, Some(Response::Ready));
        assert_eq!(
            resp_rx.recv().await,
            Some(Response::Call {
                call_id: 0,
                value: ReturnValue::Value(json!(42)),
            })
        );
    }
}
