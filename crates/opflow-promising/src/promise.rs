use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// Stable identifier for one promise, used when reporting dependency cycles
/// and abandoned requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The awaiting worker transitively owns a promise that blocks itself.
    /// Always a graph-construction bug; the ids identify the participants.
    #[error("self-dependency between requests {}", format_ids(.request_ids))]
    SelfDependency { request_ids: Vec<RequestId> },

    /// The promise's responsible worker went away without resolving it.
    #[error("request {request_id} was abandoned without being resolved")]
    Unresolved { request_id: RequestId },
}

fn format_ids(ids: &[RequestId]) -> String {
    let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    parts.join(", ")
}

/// Shared home for a set of promises and the workers that resolve them.
///
/// The registry behind this handle tracks, under one mutex, which worker is
/// currently responsible for each unresolved promise and which promises each
/// worker is blocked on. That is all the state cycle detection needs.
#[derive(Clone)]
pub struct PromiseRuntime {
    registry: Arc<Registry>,
}

impl PromiseRuntime {
    pub fn new() -> Self {
        PromiseRuntime {
            registry: Arc::new(Registry::default()),
        }
    }

    /// Hand out a new worker. Workers must not be shared across tasks: each
    /// concurrently-running participant needs its own, or cycle detection
    /// reports dependencies that do not exist.
    pub fn new_worker(&self) -> Worker {
        Worker {
            id: WorkerId(self.registry.next_worker.fetch_add(1, Ordering::Relaxed)),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Create an unresolved promise owned by `owner`.
    pub fn new_request<T: Clone + Send + 'static>(
        &self,
        owner: &Worker,
    ) -> (Resolver<T>, Promise<T>) {
        debug_assert!(
            Arc::ptr_eq(&self.registry, &owner.registry),
            "worker belongs to a different promise runtime"
        );
        let id = RequestId(self.registry.next_request.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(Shared {
            id,
            registry: Arc::clone(&self.registry),
            state: Mutex::new(None),
            notify: Notify::new(),
        });
        {
            let mut st = self.registry.state.lock().unwrap();
            st.owner_of.insert(id, owner.id);
            st.owned_by.entry(owner.id).or_default().insert(id);
            let weak: Weak<dyn Failable + Send + Sync> = {
                let shared: Arc<dyn Failable + Send + Sync> = shared.clone();
                Arc::downgrade(&shared)
            };
            st.slots.insert(id, weak);
        }
        (
            Resolver {
                shared: shared.clone(),
                resolved: false,
            },
            Promise { shared },
        )
    }
}

impl Default for PromiseRuntime {
    fn default() -> Self {
        PromiseRuntime::new()
    }
}

/// A participant in the promise graph. Owns zero or more unresolved promises;
/// dropping a worker force-fails anything it still owns so that no awaiter
/// can block forever on an abandoned request.
pub struct Worker {
    id: WorkerId,
    registry: Arc<Registry>,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let abandoned = {
            let mut st = self.registry.state.lock().unwrap();
            st.awaiting.remove(&self.id);
            let owned = st.owned_by.remove(&self.id).unwrap_or_default();
            owned
                .into_iter()
                .map(|id| {
                    st.owner_of.remove(&id);
                    (id, st.slots.remove(&id))
                })
                .collect::<Vec<_>>()
        };
        for (id, slot) in abandoned {
            warn!(request = %id, "worker dropped with unresolved promise");
            if let Some(slot) = slot.and_then(|weak| weak.upgrade()) {
                slot.force_fail(PromiseError::Unresolved { request_id: id });
            }
        }
    }
}

/// The unique handle allowed to fulfill one promise.
pub struct Resolver<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
    resolved: bool,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn request_id(&self) -> RequestId {
        self.shared.id
    }

    /// Transfer resolution responsibility to another worker. Explicit: the
    /// runtime never reassigns ownership on its own.
    pub fn pass_to(&self, worker: &Worker) {
        let mut st = self.shared.registry.state.lock().unwrap();
        let id = self.shared.id;
        if let Some(prev) = st.owner_of.insert(id, worker.id) {
            if let Some(owned) = st.owned_by.get_mut(&prev) {
                owned.remove(&id);
            }
        }
        st.owned_by.entry(worker.id).or_default().insert(id);
    }

    /// Resolve the promise and wake every awaiter. `worker` must be the
    /// current responsible worker; resolving through a stale handle is a
    /// programming error and panics.
    pub fn resolve(mut self, worker: &Worker, value: T) {
        let id = self.shared.id;
        let owner_check = {
            let mut st = self.shared.registry.state.lock().unwrap();
            match st.owner_of.get(&id) {
                Some(owner) if *owner == worker.id => {
                    st.release(id);
                    Ok(())
                }
                Some(owner) => Err(format!(
                    "request {} resolved by worker {:?} but owned by {:?}",
                    id, worker.id, owner
                )),
                None => Err(format!("request {} already released", id)),
            }
        };
        if let Err(msg) = owner_check {
            self.resolved = true; // suppress the drop failsafe while unwinding
            panic!("{}", msg);
        }
        self.resolved = true;
        let mut state = self.shared.state.lock().unwrap();
        if state.is_none() {
            *state = Some(Ok(value));
            drop(state);
            self.shared.notify.notify_waiters();
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let id = self.shared.id;
        let was_pending = {
            let mut st = self.shared.registry.state.lock().unwrap();
            st.owner_of.contains_key(&id) && {
                st.release(id);
                true
            }
        };
        if was_pending {
            warn!(request = %id, "resolver dropped without resolving");
        }
        self.shared
            .force_fail(PromiseError::Unresolved { request_id: id });
    }
}

/// The receiving end of a request. Cloneable; every awaiter observes the same
/// resolution exactly once it lands.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn request_id(&self) -> RequestId {
        self.shared.id
    }

    /// Block `worker` until the promise resolves.
    ///
    /// Fails fast with `SelfDependency` when the registry can see that the
    /// promise transitively waits on `worker` itself, and with `Unresolved`
    /// when the responsible worker disappears without resolving.
    pub async fn wait(&self, worker: &Worker) -> Result<T, PromiseError> {
        let shared = &self.shared;
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if let Some(result) = shared.state.lock().unwrap().as_ref() {
                return result.clone();
            }
            shared.registry.begin_await(worker.id, shared.id)?;
            {
                let _guard = AwaitGuard {
                    registry: shared.registry.as_ref(),
                    worker: worker.id,
                    request: shared.id,
                };
                notified.as_mut().await;
            }
            notified.set(shared.notify.notified());
        }
    }
}

// ── Internals ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    next_worker: AtomicU64,
    next_request: AtomicU64,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    /// Responsible worker per unresolved promise.
    owner_of: HashMap<RequestId, WorkerId>,
    /// Promises each worker is currently blocked on.
    awaiting: HashMap<WorkerId, HashSet<RequestId>>,
    /// Unresolved promises per owning worker.
    owned_by: HashMap<WorkerId, HashSet<RequestId>>,
    /// Force-fail handles, kept weak so resolved promises can be freed.
    slots: HashMap<RequestId, Weak<dyn Failable + Send + Sync>>,
}

impl RegistryState {
    /// Forget a promise that is no longer unresolved.
    fn release(&mut self, id: RequestId) {
        if let Some(owner) = self.owner_of.remove(&id) {
            if let Some(owned) = self.owned_by.get_mut(&owner) {
                owned.remove(&id);
            }
        }
        self.slots.remove(&id);
    }

    /// Walk from `target`'s owner through everything that owner (and the
    /// owners beyond it) is blocked on. Reaching `caller` means awaiting
    /// `target` would complete a cycle.
    fn find_cycle(&self, caller: WorkerId, target: RequestId) -> Option<Vec<RequestId>> {
        let mut visited = HashSet::new();
        let mut stack = vec![(target, vec![target])];
        while let Some((request, path)) = stack.pop() {
            if !visited.insert(request) {
                continue;
            }
            let Some(owner) = self.owner_of.get(&request) else {
                continue; // already resolved; cannot block anyone
            };
            if *owner == caller {
                return Some(path);
            }
            if let Some(awaits) = self.awaiting.get(owner) {
                for next in awaits {
                    let mut next_path = path.clone();
                    next_path.push(*next);
                    stack.push((*next, next_path));
                }
            }
        }
        None
    }
}

impl Registry {
    fn begin_await(&self, worker: WorkerId, request: RequestId) -> Result<(), PromiseError> {
        let mut st = self.state.lock().unwrap();
        if let Some(request_ids) = st.find_cycle(worker, request) {
            return Err(PromiseError::SelfDependency { request_ids });
        }
        st.awaiting.entry(worker).or_default().insert(request);
        Ok(())
    }

    fn end_await(&self, worker: WorkerId, request: RequestId) {
        let mut st = self.state.lock().unwrap();
        if let Some(awaits) = st.awaiting.get_mut(&worker) {
            awaits.remove(&request);
        }
    }
}

struct AwaitGuard<'a> {
    registry: &'a Registry,
    worker: WorkerId,
    request: RequestId,
}

impl Drop for AwaitGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_await(self.worker, self.request);
    }
}

struct Shared<T> {
    id: RequestId,
    registry: Arc<Registry>,
    state: Mutex<Option<Result<T, PromiseError>>>,
    notify: Notify,
}

trait Failable {
    fn force_fail(&self, err: PromiseError);
}

impl<T: Clone + Send + 'static> Failable for Shared<T> {
    fn force_fail(&self, err: PromiseError) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(Err(err));
            drop(state);
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_wakes_all_waiters() {
        let rt = PromiseRuntime::new();
        let owner = rt.new_worker();
        let (resolver, promise) = rt.new_request::<u32>(&owner);

        let rt2 = rt.clone();
        let p2 = promise.clone();
        let waiter = tokio::spawn(async move {
            let w = rt2.new_worker();
            p2.wait(&w).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.resolve(&owner, 42);

        let w = rt.new_worker();
        assert_eq!(promise.wait(&w).await.unwrap(), 42);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn wait_after_resolution_returns_immediately() {
        let rt = PromiseRuntime::new();
        let owner = rt.new_worker();
        let (resolver, promise) = rt.new_request::<&'static str>(&owner);
        resolver.resolve(&owner, "done");
        let w = rt.new_worker();
        assert_eq!(promise.wait(&w).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dropping_resolver_fails_waiters() {
        let rt = PromiseRuntime::new();
        let owner = rt.new_worker();
        let (resolver, promise) = rt.new_request::<u32>(&owner);
        let id = resolver.request_id();
        drop(resolver);

        let w = rt.new_worker();
        assert_eq!(
            promise.wait(&w).await,
            Err(PromiseError::Unresolved { request_id: id })
        );
    }

    #[tokio::test]
    async fn dropping_owner_worker_fails_owned_promises() {
        let rt = PromiseRuntime::new();
        let owner = rt.new_worker();
        let (resolver, promise) = rt.new_request::<u32>(&owner);
        let id = promise.request_id();
        drop(owner);
        // keep the resolver alive: the worker alone must fail the promise
        let w = rt.new_worker();
        assert_eq!(
            promise.wait(&w).await,
            Err(PromiseError::Unresolved { request_id: id })
        );
        drop(resolver);
    }

    #[tokio::test]
    async fn responsibility_transfer_allows_new_owner_to_resolve() {
        let rt = PromiseRuntime::new();
        let first = rt.new_worker();
        let (resolver, promise) = rt.new_request::<u32>(&first);

        let second = rt.new_worker();
        resolver.pass_to(&second);
        drop(first); // no longer responsible, must not force-fail
        resolver.resolve(&second, 7);

        let w = rt.new_worker();
        assert_eq!(promise.wait(&w).await.unwrap(), 7);
    }

    #[tokio::test]
    #[should_panic(expected = "owned by")]
    async fn resolving_through_stale_owner_panics() {
        let rt = PromiseRuntime::new();
        let first = rt.new_worker();
        let second = rt.new_worker();
        let (resolver, _promise) = rt.new_request::<u32>(&first);
        resolver.pass_to(&second);
        resolver.resolve(&first, 1);
    }

    #[tokio::test]
    async fn self_dependency_is_detected() {
        let rt = PromiseRuntime::new();
        let worker_a = rt.new_worker();
        let worker_b = rt.new_worker();
        let (resolver_a, promise_a) = rt.new_request::<u32>(&worker_a);
        let (resolver_b, promise_b) = rt.new_request::<u32>(&worker_b);
        let (id_a, id_b) = (promise_a.request_id(), promise_b.request_id());

        // worker A blocks on B's promise first
        let pb = promise_b.clone();
        let blocked = tokio::spawn(async move {
            let result = pb.wait(&worker_a).await;
            drop(resolver_a);
            result
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // so worker B awaiting A's promise closes the loop

        let err = promise_a.wait(&worker_b).await.unwrap_err();
        match err {
            PromiseError::SelfDependency { request_ids } => {
                assert!(request_ids.contains(&id_a), "cycle should name {}", id_a);
                assert!(request_ids.contains(&id_b), "cycle should name {}", id_b);
            }
            other => panic!("expected SelfDependency, got {:?}", other),
        }

        // unblock worker A so the spawned task finishes
        drop(resolver_b);
        assert!(blocked.await.unwrap().is_err());
    }
}
