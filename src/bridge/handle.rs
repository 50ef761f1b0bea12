//! Handles to worker objects and the futures that carry replies.
//!
//! A [`Handle`] is the UI-side ownership token for one worker object. It is
//! deliberately not `Clone`: the holder is the single owner and must call
//! `free` exactly once. There is no finalizer fallback; a handle dropped
//! while still live only produces a leak warning.

use super::Connection;
use super::proxies::RemoteObject;
use crate::error::{BridgeError, Result};
use crate::protocol::{Arg, ArgKind, CallId, ObjectId, ObjectType, ReturnValue};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{error, warn};

/// Turns the raw reply of a call into the caller's type.
pub type Decoder<T> = fn(ReturnValue, &Connection) -> Result<T>;

enum RawState {
    Done(Option<Result<ReturnValue>>),
    Waiting {
        call_id: CallId,
        receiver: oneshot::Receiver<Result<ReturnValue>>,
        timeout: Option<Duration>,
        sleep: Option<Pin<Box<Sleep>>>,
    },
}

/// Future of an undecoded reply.
///
/// Dropping it stops waiting but keeps the call slot until the worker
/// answers; objects in a late reply are then released automatically.
pub struct RawReply {
    state: RawState,
}

impl RawReply {
    pub(crate) fn pending(
        call_id: CallId,
        receiver: oneshot::Receiver<Result<ReturnValue>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: RawState::Waiting {
                call_id,
                receiver,
                timeout,
                sleep: None,
            },
        }
    }

    pub(crate) fn ready(outcome: Result<ReturnValue>) -> Self {
        Self {
            state: RawState::Done(Some(outcome)),
        }
    }

    /// The correlation id, if the request was sent.
    pub fn call_id(&self) -> Option<CallId> {
        match &self.state {
            RawState::Waiting { call_id, .. } => Some(*call_id),
            RawState::Done(_) => None,
        }
    }
}

impl Future for RawReply {
    type Output = Result<ReturnValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            RawState::Done(outcome) => {
                Poll::Ready(outcome.take().expect("reply polled after completion"))
            }
            RawState::Waiting {
                call_id,
                receiver,
                timeout,
                sleep,
            } => {
                if let Poll::Ready(result) = Pin::new(receiver).poll(cx) {
                    // sender dropped: the connection went away with the call
                    return Poll::Ready(result.unwrap_or(Err(BridgeError::Abandoned {
                        call_id: *call_id,
                    })));
                }
                if let Some(after) = *timeout {
                    let sleep = sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep(after)));
                    if sleep.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(BridgeError::Timeout {
                            call_id: *call_id,
                            after,
                        }));
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Future of a decoded reply.
pub struct Reply<T> {
    raw: RawReply,
    conn: Connection,
    decode: Decoder<T>,
}

impl<T> Reply<T> {
    pub(crate) fn new(raw: RawReply, conn: Connection, decode: Decoder<T>) -> Self {
        Self { raw, conn, decode }
    }

    /// A reply that fails with `err` without contacting the worker.
    pub(crate) fn failed(conn: &Connection, err: BridgeError) -> Self {
        Self {
            raw: RawReply::ready(Err(err)),
            conn: conn.clone(),
            decode: |_, _| Err(BridgeError::Closed),
        }
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.raw.call_id()
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.raw).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready((this.decode)(value, &this.conn)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Ownership token for one worker object.
#[derive(Debug)]
pub struct Handle {
    conn: Connection,
    object_type: ObjectType,
    /// `None` once freed.
    id: Option<ObjectId>,
    /// Unique per connection; ids are reused, serials are not.
    serial: u64,
}

impl Handle {
    pub(crate) fn adopt(conn: Connection, object_type: ObjectType, id: ObjectId) -> Self {
        let serial = conn.next_serial();
        Self {
            conn,
            object_type,
            id: Some(id),
            serial,
        }
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.id.is_some()
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Call `method` on the object.
    pub fn call<T>(
        &self,
        method: &str,
        args: Vec<Arg>,
        ret_kind: ArgKind,
        decode: Decoder<T>,
    ) -> Reply<T> {
        self.call_with(method, || Ok(args), ret_kind, decode)
    }

    /// Like [`Handle::call`], with arguments that may fail to encode.
    pub fn call_with<T>(
        &self,
        method: &str,
        args: impl FnOnce() -> Result<Vec<Arg>>,
        ret_kind: ArgKind,
        decode: Decoder<T>,
    ) -> Reply<T> {
        let Some(id) = self.id else {
            error!(
                object_type = %self.object_type,
                serial = self.serial,
                method,
                "Attempt to call method on freed object"
            );
            return Reply::failed(
                &self.conn,
                BridgeError::UseAfterFree {
                    method: method.to_string(),
                },
            );
        };
        match args() {
            Ok(args) => self.conn.invoke(Some(id), method, args, ret_kind, decode),
            Err(err) => Reply::failed(&self.conn, err),
        }
    }

    /// Lend the object as a call argument.
    pub fn arg(&self) -> Result<Arg> {
        self.id.map(Arg::Object).ok_or(BridgeError::UseAfterFree {
            method: "<argument>".to_string(),
        })
    }

    /// Release the worker-side object. Fails on a second call.
    pub fn free(&mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => {
                self.conn.release(id);
                Ok(())
            }
            None => Err(BridgeError::UseAfterFree {
                method: "free".to_string(),
            }),
        }
    }

    /// Release if still live.
    pub(crate) fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.conn.release(id);
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            warn!(
                object_type = %self.object_type,
                object_id = id,
                serial = self.serial,
                "Handle dropped without free(); worker object leaked"
            );
        }
    }
}

/// A typed handle for one worker class.
pub trait Proxy: Sized {
    const TYPE: ObjectType;

    fn from_handle(handle: Handle) -> Self;

    fn handle(&self) -> &Handle;
}

/// Release every object a reply carries that nobody will own.
fn discard(value: &ReturnValue, conn: &Connection) {
    for id in value.object_ids() {
        conn.release(id);
    }
}

fn wrong_kind(value: ReturnValue, expected: ArgKind, conn: &Connection) -> BridgeError {
    discard(&value, conn);
    BridgeError::ReturnKind {
        expected,
        actual: value.kind(),
    }
}

pub fn decode_value<T: DeserializeOwned>(value: ReturnValue, conn: &Connection) -> Result<T> {
    match value {
        ReturnValue::Value(json) => {
            serde_json::from_value(json).map_err(|e| BridgeError::Decode(e.to_string()))
        }
        other => Err(wrong_kind(other, ArgKind::Value, conn)),
    }
}

pub fn decode_unit(value: ReturnValue, conn: &Connection) -> Result<()> {
    match value {
        ReturnValue::Value(_) => Ok(()),
        other => Err(wrong_kind(other, ArgKind::Value, conn)),
    }
}

pub fn decode_binary(value: ReturnValue, conn: &Connection) -> Result<Vec<u8>> {
    match value {
        ReturnValue::Binary(bytes) => Ok(bytes),
        other => Err(wrong_kind(other, ArgKind::Binary, conn)),
    }
}

/// Wrap a returned object in the proxy matching its type tag.
pub fn decode_any(value: ReturnValue, conn: &Connection) -> Result<RemoteObject> {
    match value {
        ReturnValue::Object { object_type, id } => Ok(RemoteObject::wrap(Handle::adopt(
            conn.clone(),
            object_type,
            id,
        ))),
        other => Err(wrong_kind(other, ArgKind::Object, conn)),
    }
}

pub fn decode_object<P: Proxy>(value: ReturnValue, conn: &Connection) -> Result<P> {
    decode_any(value, conn)?.downcast::<P>().map_err(|other| {
        let actual = other.object_type();
        other.free();
        BridgeError::UnexpectedType {
            expected: P::TYPE,
            actual,
        }
    })
}

pub fn decode_objects<P: Proxy>(value: ReturnValue, conn: &Connection) -> Result<Vec<P>> {
    match value {
        ReturnValue::ObjectArray { object_type, ids } => match object_type {
            None if ids.is_empty() => Ok(Vec::new()),
            Some(actual) if actual == P::TYPE => Ok(ids
                .into_iter()
                .map(|id| P::from_handle(Handle::adopt(conn.clone(), actual, id)))
                .collect()),
            tag => {
                for id in &ids {
                    conn.release(*id);
                }
                match tag {
                    Some(actual) => Err(BridgeError::UnexpectedType {
                        expected: P::TYPE,
                        actual,
                    }),
                    None => Err(BridgeError::Decode(
                        "object array without a type tag".to_string(),
                    )),
                }
            }
        },
        other => Err(wrong_kind(other, ArgKind::ObjectArray, conn)),
    }
}
