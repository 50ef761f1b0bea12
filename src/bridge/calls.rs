//! Correlation of responses with the calls that are waiting for them.
//!
//! Each in-flight request occupies one slot of a [`Slab`]; the slot index is
//! the call id carried on the wire. The slot is released exactly when the
//! matching response settles it, so ids are reused as soon as possible and
//! the table never grows beyond the peak number of concurrent calls.

use crate::error::{BridgeError, FatalError, Result};
use crate::protocol::{CallId, ReturnValue};
use crate::slab::Slab;
use tokio::sync::oneshot;

/// Continuation of one pending call.
pub type Settler = oneshot::Sender<Result<ReturnValue>>;

#[derive(Debug)]
struct PendingCall {
    settler: Settler,
    /// Function or class name, for diagnostics.
    label: String,
}

/// What happened to a settled call's outcome.
#[derive(Debug, PartialEq)]
pub enum Settled {
    Delivered,
    /// The caller stopped waiting. Any objects in the value have no owner.
    Orphaned(Option<ReturnValue>),
}

#[derive(Debug, Default)]
pub struct CallTable {
    pending: Slab<PendingCall>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a call id and the receiver its outcome will arrive on.
    pub fn register(
        &mut self,
        label: impl Into<String>,
    ) -> (CallId, oneshot::Receiver<Result<ReturnValue>>) {
        let (settler, receiver) = oneshot::channel();
        let call_id = self.pending.allocate(PendingCall {
            settler,
            label: label.into(),
        });
        (call_id, receiver)
    }

    /// Release a slot whose request never left the UI side.
    pub fn cancel(&mut self, call_id: CallId) {
        let _ = self.pending.free(call_id);
    }

    /// Deliver the outcome of `call_id` and free its slot.
    ///
    /// A response for an id that is not pending means the two sides disagree
    /// about the conversation, which is fatal.
    pub fn settle(
        &mut self,
        call_id: CallId,
        outcome: Result<ReturnValue>,
    ) -> std::result::Result<Settled, FatalError> {
        let call = self.pending.free(call_id).map_err(|_| {
            FatalError::ProtocolDesync(format!("response for unknown call id {}", call_id))
        })?;
        match call.settler.send(outcome) {
            Ok(()) => Ok(Settled::Delivered),
            Err(outcome) => Ok(Settled::Orphaned(outcome.ok())),
        }
    }

    pub fn label(&self, call_id: CallId) -> Option<&str> {
        self.pending.get(call_id).ok().map(|c| c.label.as_str())
    }

    /// Number of calls waiting for a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Settle every pending call with [`BridgeError::Abandoned`] and return
    /// the ids and labels that were still waiting.
    pub fn abandon_all(&mut self) -> Vec<(CallId, String)> {
        self.pending
            .drain()
            .into_iter()
            .map(|(call_id, call)| {
                let _ = call.settler.send(Err(BridgeError::Abandoned { call_id }));
                (call_id, call.label)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let mut table = CallTable::new();
        let (a, rx_a) = table.register("tester");
        let (b, rx_b) = table.register("tester");
        assert_ne!(a, b);

        // responses arrive in reverse order
        table.settle(b, Ok(ReturnValue::Value(json!(2)))).unwrap();
        table.settle(a, Ok(ReturnValue::Value(json!(1)))).unwrap();

        assert_eq!(rx_a.await.unwrap(), Ok(ReturnValue::Value(json!(1))));
        assert_eq!(rx_b.await.unwrap(), Ok(ReturnValue::Value(json!(2))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_settled_id_is_reused() {
        let mut table = CallTable::new();
        let (a, _rx_a) = table.register("first");
        table.settle(a, Ok(ReturnValue::Value(json!(null)))).unwrap();
        let (b, _rx_b) = table.register("second");
        assert_eq!(a, b);
        assert_eq!(table.label(b), Some("second"));
    }

    #[test]
    fn test_second_response_for_same_id_is_desync() {
        let mut table = CallTable::new();
        let (a, _rx) = table.register("tester");
        table.settle(a, Ok(ReturnValue::Value(json!(1)))).unwrap();
        let err = table
            .settle(a, Ok(ReturnValue::Value(json!(1))))
            .unwrap_err();
        assert!(matches!(err, FatalError::ProtocolDesync(_)));
    }

    #[test]
    fn test_dropped_receiver_orphans_value() {
        let mut table = CallTable::new();
        let (a, rx) = table.register("parse_bin");
        drop(rx);
        let value = ReturnValue::Object {
            object_type: crate::protocol::ObjectType::Seq,
            id: 4,
        };
        assert_eq!(
            table.settle(a, Ok(value.clone())),
            Ok(Settled::Orphaned(Some(value)))
        );
    }

    #[tokio::test]
    async fn test_abandon_all_settles_waiters() {
        let mut table = CallTable::new();
        let (a, rx) = table.register("get_result");
        let abandoned = table.abandon_all();
        assert_eq!(abandoned, vec![(a, "get_result".to_string())]);
        assert_eq!(rx.await.unwrap(), Err(BridgeError::Abandoned { call_id: a }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_frees_slot() {
        let mut table = CallTable::new();
        let (a, _rx) = table.register("x");
        table.cancel(a);
        assert_eq!(table.len(), 0);
    }
}
