//! Memoization of remote call results for synchronous-style readers.
//!
//! Rendering code cannot await. It calls [`MethodCache::read`], which either
//! returns the settled outcome at once or returns [`Suspend::Pending`]
//! holding a future that completes when the outcome is in; the reader
//! awaits it and reads again. Each distinct `(target, method, args)` key
//! issues at most one remote call until it is invalidated.
//!
//! [`CachedReply`] is the coarser variant: it shares one in-flight reply
//! between several readers.

use crate::bridge::{Connection, Handle, Reply};
use crate::error::{BridgeError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// What a cached result is keyed on besides the method and arguments.
///
/// Slab ids are reused after `free`, so objects are identified by their
/// per-connection handle serial instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheIdentity {
    pub connection: u64,
    pub serial: u64,
}

/// Something a cached call is made on.
pub trait CacheTarget {
    fn cache_identity(&self) -> CacheIdentity;
}

impl CacheTarget for Handle {
    fn cache_identity(&self) -> CacheIdentity {
        CacheIdentity {
            connection: self.connection().id(),
            serial: self.serial(),
        }
    }
}

/// Free functions are cached against the connection itself.
impl CacheTarget for Connection {
    fn cache_identity(&self) -> CacheIdentity {
        CacheIdentity {
            connection: self.id(),
            serial: 0,
        }
    }
}

/// Completes once the outcome a reader is waiting for has been recorded.
pub type Suspended = Shared<BoxFuture<'static, ()>>;

/// Why a synchronous read produced no value.
#[derive(Clone)]
pub enum Suspend {
    /// Not settled yet. Await the future, then read again.
    Pending(Suspended),
    /// Settled with an error; every read of the key sees the same one.
    Failed(BridgeError),
}

impl std::fmt::Debug for Suspend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

impl From<BridgeError> for Suspend {
    fn from(err: BridgeError) -> Self {
        Self::Failed(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    target: CacheIdentity,
    method: &'static str,
    value_type: TypeId,
    args: String,
}

enum EntryState {
    Pending(Suspended),
    Resolved(Arc<dyn Any + Send + Sync>),
    Failed(BridgeError),
}

struct Entry {
    generation: u64,
    state: EntryState,
}

#[derive(Default)]
struct Entries {
    map: HashMap<CacheKey, Entry>,
    next_generation: u64,
}

/// Cache of method call outcomes.
///
/// Clones share entries. Drop it (or [`MethodCache::clear`]) together with
/// the view that owns it.
#[derive(Clone, Default)]
pub struct MethodCache {
    entries: Arc<Mutex<Entries>>,
}

impl std::fmt::Debug for MethodCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().expect("method cache mutex poisoned")
    }

    fn key<V: 'static>(
        target: &impl CacheTarget,
        method: &'static str,
        args: &impl Serialize,
    ) -> Result<CacheKey> {
        Ok(CacheKey {
            target: target.cache_identity(),
            method,
            value_type: TypeId::of::<V>(),
            args: serde_json::to_string(args)?,
        })
    }

    /// Read the outcome of `method(args)` on `target`.
    ///
    /// On a miss `issue` is called with the same `target` and `args` that
    /// form the key, and must make the `method` call on them. Its outcome is
    /// recorded before anyone can observe it: a reply that is already
    /// settled is returned directly, otherwise the entry is marked pending
    /// before the task waiting for the reply is spawned.
    pub fn read<T, A, V>(
        &self,
        target: &T,
        method: &'static str,
        args: &A,
        issue: impl FnOnce(&T, &A) -> Reply<V>,
    ) -> std::result::Result<V, Suspend>
    where
        T: CacheTarget,
        A: Serialize,
        V: Clone + Send + Sync + 'static,
    {
        let key = Self::key::<V>(target, method, args)?;
        let mut entries = self.entries();
        if let Some(entry) = entries.map.get(&key) {
            trace!(method, "Method cache hit");
            return match &entry.state {
                EntryState::Pending(suspended) => Err(Suspend::Pending(suspended.clone())),
                EntryState::Resolved(value) => downcast(value),
                EntryState::Failed(err) => Err(Suspend::Failed(err.clone())),
            };
        }

        debug!(method, args = %key.args, "Method cache miss, issuing call");
        let mut reply = issue(target, args);
        let generation = entries.next_generation;
        entries.next_generation += 1;

        if let Some(outcome) = (&mut reply).now_or_never() {
            let (state, result) = settled(outcome);
            entries.map.insert(key, Entry { generation, state });
            return result;
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let suspended: Suspended = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();
        entries.map.insert(
            key.clone(),
            Entry {
                generation,
                state: EntryState::Pending(suspended.clone()),
            },
        );
        drop(entries);

        let shared = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let outcome = reply.await;
            {
                let mut entries = shared.lock().expect("method cache mutex poisoned");
                // an entry replaced after invalidation keeps its own outcome
                if let Some(entry) = entries.map.get_mut(&key)
                    && entry.generation == generation
                {
                    entry.state = settled(outcome).0;
                }
            }
            let _ = done_tx.send(());
        });
        Err(Suspend::Pending(suspended))
    }

    /// Await the outcome of `method(args)` on `target`, issuing the call
    /// only if no entry exists.
    pub async fn resolve<T, A, V>(
        &self,
        target: &T,
        method: &'static str,
        args: &A,
        issue: impl Fn(&T, &A) -> Reply<V>,
    ) -> Result<V>
    where
        T: CacheTarget,
        A: Serialize,
        V: Clone + Send + Sync + 'static,
    {
        loop {
            match self.read(target, method, args, &issue) {
                Ok(value) => return Ok(value),
                Err(Suspend::Failed(err)) => return Err(err),
                Err(Suspend::Pending(suspended)) => suspended.await,
            }
        }
    }

    /// Evict one entry so the next read issues the call again.
    pub fn invalidate<V: 'static>(
        &self,
        target: &impl CacheTarget,
        method: &'static str,
        args: &impl Serialize,
    ) -> bool {
        let Ok(key) = Self::key::<V>(target, method, args) else {
            return false;
        };
        self.entries().map.remove(&key).is_some()
    }

    /// Evict every entry of `target`, e.g. after a mutating call.
    pub fn invalidate_target(&self, target: &impl CacheTarget) -> usize {
        let identity = target.cache_identity();
        let mut entries = self.entries();
        let before = entries.map.len();
        entries.map.retain(|key, _| key.target != identity);
        before - entries.map.len()
    }

    pub fn clear(&self) {
        self.entries().map.clear();
    }

    pub fn len(&self) -> usize {
        self.entries().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn settled<V>(outcome: Result<V>) -> (EntryState, std::result::Result<V, Suspend>)
where
    V: Clone + Send + Sync + 'static,
{
    match outcome {
        Ok(value) => (EntryState::Resolved(Arc::new(value.clone())), Ok(value)),
        Err(err) => (EntryState::Failed(err.clone()), Err(Suspend::Failed(err))),
    }
}

fn downcast<V: Clone + 'static>(
    value: &Arc<dyn Any + Send + Sync>,
) -> std::result::Result<V, Suspend> {
    value
        .downcast_ref::<V>()
        .cloned()
        .ok_or_else(|| Suspend::Failed(BridgeError::Decode("cached value has another type".into())))
}

/// One in-flight reply shared by several readers.
///
/// The reply is awaited once; every reader sees the same value or error.
pub struct CachedReply<V> {
    shared: Shared<BoxFuture<'static, Result<Arc<V>>>>,
}

impl<V> Clone for CachedReply<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V: Send + Sync + 'static> CachedReply<V> {
    /// Start sharing `reply`. Must be called from within a tokio runtime.
    pub fn new(reply: Reply<V>) -> Self {
        let shared = reply.map(|outcome| outcome.map(Arc::new)).boxed().shared();
        // capture an already-settled reply before anyone reads it
        if shared.clone().now_or_never().is_none() {
            tokio::spawn(shared.clone().map(|_| ()));
        }
        Self { shared }
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<Result<Arc<V>>> {
        self.shared.peek().cloned()
    }

    /// Synchronous read; see [`MethodCache::read`].
    pub fn read(&self) -> std::result::Result<Arc<V>, Suspend> {
        match self.peek() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(Suspend::Failed(err)),
            None => Err(Suspend::Pending(self.shared.clone().map(|_| ()).boxed().shared())),
        }
    }

    pub async fn get(&self) -> Result<Arc<V>> {
        self.shared.clone().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ManualBackend, ManualWorker};
    use crate::bridge::ConnectionOptions;
    use crate::bridge::handle::decode_value;
    use crate::protocol::{Arg, ArgKind, ObjectType, Request, Response, ReturnValue};
    use serde_json::json;

    async fn connected() -> (Connection, ManualWorker) {
        let (backend, mut controller) = ManualBackend::new("manual");
        let conn = Connection::with_backends(Box::new(backend), None, ConnectionOptions::default());
        let worker = controller.next_worker().await.unwrap();
        worker.ready();
        conn.ready().await.unwrap();
        (conn, worker)
    }

    fn tester(conn: &Connection, n: u32) -> Reply<u32> {
        conn.invoke(
            None,
            "tester",
            vec![Arg::Value(json!(n))],
            ArgKind::Value,
            decode_value,
        )
    }

    async fn answer(worker: &mut ManualWorker, value: serde_json::Value) {
        let call_id = worker.recv().await.unwrap().call_id().unwrap();
        worker.respond(Response::Call {
            call_id,
            value: ReturnValue::Value(value),
        });
    }

    fn pending<V: std::fmt::Debug>(read: std::result::Result<V, Suspend>) -> Suspended {
        match read {
            Err(Suspend::Pending(suspended)) => suspended,
            other => panic!("Expected pending read, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_reads_issue_one_call() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        let first = pending(cache.read(&conn, "tester", &(5,), |conn, _| tester(conn, 5)));
        let second = pending(cache.read(&conn, "tester", &(5,), |conn, _| tester(conn, 5)));

        answer(&mut worker, json!(5)).await;
        first.await;
        second.await;

        assert_eq!(
            cache.read(&conn, "tester", &(5,), |conn, _| tester(conn, 5)).unwrap(),
            5
        );
        assert_eq!(
            cache.read(&conn, "tester", &(5,), |conn, _| tester(conn, 5)).unwrap(),
            5
        );
        assert!(worker.try_recv().is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_call_is_issued_with_keyed_args() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        pending(cache.read(&conn, "tester", &(7u32,), |conn, &(n,)| tester(conn, n)));
        match worker.recv().await {
            Some(Request::Call(call)) => {
                assert_eq!(call.function, "tester");
                assert_eq!(call.target, None);
                assert_eq!(call.args, vec![Arg::Value(json!(7))]);
            }
            other => panic!("Expected call request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_distinct_args_are_distinct_entries() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        pending(cache.read(&conn, "tester", &(1,), |conn, _| tester(conn, 1)));
        pending(cache.read(&conn, "tester", &(2,), |conn, _| tester(conn, 2)));
        assert!(worker.recv().await.is_some());
        assert!(worker.recv().await.is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_reissues() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        let first = pending(cache.read(&conn, "tester", &(3,), |conn, _| tester(conn, 3)));
        answer(&mut worker, json!(3)).await;
        first.await;

        assert!(cache.invalidate::<u32>(&conn, "tester", &(3,)));
        assert!(!cache.invalidate::<u32>(&conn, "tester", &(3,)));

        let again = pending(cache.read(&conn, "tester", &(3,), |conn, _| tester(conn, 3)));
        answer(&mut worker, json!(33)).await;
        again.await;
        assert_eq!(
            cache.read(&conn, "tester", &(3,), |conn, _| tester(conn, 3)).unwrap(),
            33
        );
    }

    #[tokio::test]
    async fn test_error_is_resurfaced_without_new_call() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        let suspended = pending(cache.read(&conn, "tester", &(), |conn, _| tester(conn, 0)));
        let call_id = worker.recv().await.unwrap().call_id().unwrap();
        worker.respond(Response::error(call_id, "no such sequence"));
        suspended.await;

        for _ in 0..2 {
            match cache.read(&conn, "tester", &(), |conn, _| tester(conn, 0)) {
                Err(Suspend::Failed(err)) => {
                    assert_eq!(err, BridgeError::Call("no such sequence".into()))
                }
                other => panic!("Expected cached error, got {:?}", other),
            }
        }
        assert!(worker.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_settled_reply_is_recorded_before_returning() {
        let (conn, _worker) = connected().await;
        conn.shutdown();
        let cache = MethodCache::new();

        let mut issued = 0;
        let first = cache.read(&conn, "tester", &(1,), |conn, _| {
            issued += 1;
            tester(conn, 1)
        });
        assert!(matches!(first, Err(Suspend::Failed(BridgeError::Closed))));
        let second = cache.read(&conn, "tester", &(1,), |conn, _| tester(conn, 1));
        assert!(matches!(second, Err(Suspend::Failed(BridgeError::Closed))));
        assert_eq!(issued, 1);
    }

    #[tokio::test]
    async fn test_stale_outcome_after_invalidate_is_discarded() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        let stale = pending(cache.read(&conn, "tester", &(4,), |conn, _| tester(conn, 4)));
        let stale_id = worker.recv().await.unwrap().call_id().unwrap();
        cache.invalidate::<u32>(&conn, "tester", &(4,));

        let fresh = pending(cache.read(&conn, "tester", &(4,), |conn, _| tester(conn, 4)));
        worker.respond(Response::Call {
            call_id: stale_id,
            value: ReturnValue::Value(json!(40)),
        });
        stale.await;
        assert!(cache.read(&conn, "tester", &(4,), |conn, _| tester(conn, 4)).is_err());

        answer(&mut worker, json!(44)).await;
        fresh.await;
        assert_eq!(
            cache.read(&conn, "tester", &(4,), |conn, _| tester(conn, 4)).unwrap(),
            44
        );
    }

    #[tokio::test]
    async fn test_resolve_waits_for_outcome() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();

        let reader = {
            let cache = cache.clone();
            let conn = conn.clone();
            tokio::spawn(async move { cache.resolve(&conn, "tester", &(9,), |conn, _| tester(conn, 9)).await })
        };
        answer(&mut worker, json!(9)).await;
        assert_eq!(reader.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_invalidate_target_drops_only_that_target() {
        let (conn, mut worker) = connected().await;
        let cache = MethodCache::new();
        let mut handle = Handle::adopt(conn.clone(), ObjectType::Seq, 1);

        pending(cache.read(&conn, "tester", &(1,), |conn, _| tester(conn, 1)));
        pending(cache.read(&handle, "tester", &(1,), |handle, _| {
            tester(handle.connection(), 1)
        }));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate_target(&handle), 1);
        assert_eq!(cache.len(), 1);

        handle.free().unwrap();
        cache.clear();
        assert!(cache.is_empty());

        let mut requests = Vec::new();
        while let Some(request) = worker.try_recv() {
            requests.push(request);
        }
        assert!(requests.contains(&Request::Delete { target: 1 }));
    }

    #[tokio::test]
    async fn test_cached_reply_is_shared() {
        let (conn, mut worker) = connected().await;
        let shared = CachedReply::new(tester(&conn, 8));
        let other = shared.clone();

        assert!(matches!(shared.read(), Err(Suspend::Pending(_))));
        answer(&mut worker, json!(8)).await;

        assert_eq!(*shared.get().await.unwrap(), 8);
        assert_eq!(*other.get().await.unwrap(), 8);
        assert_eq!(*other.read().unwrap(), 8);
        assert!(worker.try_recv().is_none());
    }
}
