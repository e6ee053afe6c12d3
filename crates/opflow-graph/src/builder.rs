use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use opflow_domain::{DynValue, ProviderInstanceAddr, ResourceInstanceAddr};

use crate::graph::Graph;
use crate::ops::{OpCode, Operation};
use crate::refs::{kind, RawRef, Ref, ResultType};

/// Incrementally accumulates an execution graph.
///
/// The builder is thread-safe so that independent subgraphs can be
/// constructed concurrently; the resulting operation order is whatever order
/// the appends landed in, which carries no scheduling meaning. Misuse
/// (references from another builder, double sink registration, any use after
/// [`finish`](GraphBuilder::finish)) is a programming error and panics.
pub struct GraphBuilder {
    inner: Arc<Mutex<BuilderInner>>,
}

#[derive(Default)]
struct BuilderInner {
    finished: bool,
    values: Vec<DynValue>,
    resource_addrs: Vec<ResourceInstanceAddr>,
    resource_addr_index: HashMap<ResourceInstanceAddr, usize>,
    provider_addrs: Vec<ProviderInstanceAddr>,
    provider_addr_index: HashMap<ProviderInstanceAddr, usize>,
    operations: Vec<Operation>,
    waiters: Vec<Vec<RawRef>>,
    sinks: BTreeMap<ResourceInstanceAddr, RawRef>,
    provider_instances: HashMap<ProviderInstanceAddr, ProviderInstanceEntry>,
}

struct ProviderInstanceEntry {
    client: RawRef,
    config_gate: usize,
    close_gate: usize,
}

/// Error reported when an operand reference does not fit the opcode's
/// signature. Surfaced as a panic from the typed builder methods (only
/// possible with references from another builder) and as a parse error from
/// the unmarshaller.
#[derive(Debug)]
pub(crate) enum OperandError {
    WrongCount { got: usize, want: usize },
    TypeMismatch { index: usize, got: ResultType, want: ResultType },
    DanglingRef { index: usize },
}

impl GraphBuilder {
    pub fn new() -> Self {
        let mut inner = BuilderInner::default();
        inner.waiters.push(Vec::new()); // shared empty waiter
        GraphBuilder {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BuilderInner> {
        let inner = self.inner.lock().unwrap();
        assert!(!inner.finished, "graph builder used after finish");
        inner
    }

    /// Record a constant value. Equal values are deliberately not
    /// deduplicated: each call site gets its own slot.
    pub fn const_value(&self, value: DynValue) -> Ref<kind::Value> {
        let mut inner = self.lock();
        let index = inner.values.len();
        inner.values.push(value);
        Ref::from_raw(RawRef::ConstValue(index))
    }

    /// Record a resource instance address, deduplicated by equality.
    pub fn const_resource_addr(&self, addr: ResourceInstanceAddr) -> Ref<kind::ResourceAddr> {
        let mut inner = self.lock();
        let index = match inner.resource_addr_index.get(&addr) {
            Some(index) => *index,
            None => {
                let index = inner.resource_addrs.len();
                inner.resource_addrs.push(addr.clone());
                inner.resource_addr_index.insert(addr, index);
                index
            }
        };
        Ref::from_raw(RawRef::ConstResourceAddr(index))
    }

    /// Record a provider instance address, deduplicated by equality.
    pub fn const_provider_addr(&self, addr: ProviderInstanceAddr) -> Ref<kind::ProviderAddr> {
        let mut inner = self.lock();
        let index = match inner.provider_addr_index.get(&addr) {
            Some(index) => *index,
            None => {
                let index = inner.provider_addrs.len();
                inner.provider_addrs.push(addr.clone());
                inner.provider_addr_index.insert(addr, index);
                index
            }
        };
        Ref::from_raw(RawRef::ConstProviderAddr(index))
    }

    /// Compose a waiter over the given references: a unit-typed handle that
    /// completes only once every component has. An empty waiter is a shared
    /// singleton.
    pub fn wait_for(&self, refs: impl IntoIterator<Item = RawRef>) -> Ref<kind::Unit> {
        let refs: Vec<RawRef> = refs.into_iter().collect();
        let mut inner = self.lock();
        if refs.is_empty() {
            return Ref::from_raw(RawRef::Waiter(0));
        }
        for r in &refs {
            inner.check_ref(r).expect("waiter component from another graph");
        }
        let index = inner.waiters.len();
        inner.waiters.push(refs);
        Ref::from_raw(RawRef::Waiter(index))
    }

    /// A waiter whose dependency set grows after creation. The returned
    /// [`CloseBlocker`] registers new dependencies; this lets a close
    /// operation be appended up front while the users it must wait for are
    /// discovered later.
    pub fn close_blocker(&self) -> (Ref<kind::Unit>, CloseBlocker) {
        let mut inner = self.lock();
        let index = inner.waiters.len();
        inner.waiters.push(Vec::new());
        (
            Ref::from_raw(RawRef::Waiter(index)),
            CloseBlocker {
                inner: Arc::clone(&self.inner),
                waiter: index,
            },
        )
    }

    /// The config/open/close triple for a provider instance, created once per
    /// distinct address. Every call site for the same address shares the same
    /// client reference and close blocker; later call sites contribute their
    /// `ready` gate to the shared config gate instead of creating a new
    /// plugin.
    pub fn provider_instance(
        &self,
        addr: ProviderInstanceAddr,
        ready: Ref<kind::Unit>,
    ) -> (Ref<kind::ProviderClient>, CloseBlocker) {
        let addr_ref = self.const_provider_addr(addr.clone());
        let mut inner = self.lock();
        if let Some(entry) = inner.provider_instances.get(&addr) {
            let (client, config_gate, close_gate) =
                (entry.client, entry.config_gate, entry.close_gate);
            inner.waiters[config_gate].push(ready.erase());
            return (
                Ref::from_raw(client),
                CloseBlocker {
                    inner: Arc::clone(&self.inner),
                    waiter: close_gate,
                },
            );
        }

        let config_gate = inner.waiters.len();
        inner.waiters.push(vec![ready.erase()]);
        let config = inner.push_op(
            OpCode::ProviderInstanceConfig,
            vec![addr_ref.erase(), RawRef::Waiter(config_gate)],
        );
        let client = inner.push_op(OpCode::ProviderInstanceOpen, vec![config]);
        let close_gate = inner.waiters.len();
        inner.waiters.push(Vec::new());
        inner.push_op(
            OpCode::ProviderInstanceClose,
            vec![client, RawRef::Waiter(close_gate)],
        );
        inner.provider_instances.insert(
            addr,
            ProviderInstanceEntry {
                client,
                config_gate,
                close_gate,
            },
        );
        (
            Ref::from_raw(client),
            CloseBlocker {
                inner: Arc::clone(&self.inner),
                waiter: close_gate,
            },
        )
    }

    // ── Typed operation appends ───────────────────────────────────────────────

    pub fn provider_instance_config(
        &self,
        addr: Ref<kind::ProviderAddr>,
        ready: Ref<kind::Unit>,
    ) -> Ref<kind::ProviderConfig> {
        self.push_typed(OpCode::ProviderInstanceConfig, vec![addr.erase(), ready.erase()])
    }

    pub fn provider_instance_open(
        &self,
        config: Ref<kind::ProviderConfig>,
    ) -> Ref<kind::ProviderClient> {
        self.push_typed(OpCode::ProviderInstanceOpen, vec![config.erase()])
    }

    pub fn provider_instance_close(
        &self,
        client: Ref<kind::ProviderClient>,
        users_done: Ref<kind::Unit>,
    ) -> Ref<kind::Unit> {
        self.push_typed(
            OpCode::ProviderInstanceClose,
            vec![client.erase(), users_done.erase()],
        )
    }

    pub fn resource_instance_desired(
        &self,
        addr: Ref<kind::ResourceAddr>,
        ready: Ref<kind::Unit>,
    ) -> Ref<kind::Desired> {
        self.push_typed(
            OpCode::ResourceInstanceDesired,
            vec![addr.erase(), ready.erase()],
        )
    }

    pub fn resource_instance_prior(&self, addr: Ref<kind::ResourceAddr>) -> Ref<kind::Object> {
        self.push_typed(OpCode::ResourceInstancePrior, vec![addr.erase()])
    }

    pub fn managed_final_plan(
        &self,
        desired: Ref<kind::Desired>,
        prior: Ref<kind::Object>,
        planned: Ref<kind::Value>,
        client: Ref<kind::ProviderClient>,
    ) -> Ref<kind::FinalPlan> {
        self.push_typed(
            OpCode::ManagedFinalPlan,
            vec![desired.erase(), prior.erase(), planned.erase(), client.erase()],
        )
    }

    pub fn managed_apply(
        &self,
        plan: Ref<kind::FinalPlan>,
        fallback: Ref<kind::Object>,
        client: Ref<kind::ProviderClient>,
    ) -> Ref<kind::Object> {
        self.push_typed(
            OpCode::ManagedApply,
            vec![plan.erase(), fallback.erase(), client.erase()],
        )
    }

    pub fn managed_depose(&self, prior: Ref<kind::Object>) -> Ref<kind::Object> {
        self.push_typed(OpCode::ManagedDepose, vec![prior.erase()])
    }

    pub fn managed_already_deposed(
        &self,
        addr: Ref<kind::ResourceAddr>,
        deposed_key: Ref<kind::Value>,
    ) -> Ref<kind::Object> {
        self.push_typed(
            OpCode::ManagedAlreadyDeposed,
            vec![addr.erase(), deposed_key.erase()],
        )
    }

    pub fn managed_change_addr(
        &self,
        current: Ref<kind::Object>,
        new_addr: Ref<kind::ResourceAddr>,
    ) -> Ref<kind::Object> {
        self.push_typed(
            OpCode::ManagedChangeAddr,
            vec![current.erase(), new_addr.erase()],
        )
    }

    pub fn data_read(
        &self,
        desired: Ref<kind::Desired>,
        planned: Ref<kind::Value>,
        client: Ref<kind::ProviderClient>,
    ) -> Ref<kind::Object> {
        self.push_typed(
            OpCode::DataRead,
            vec![desired.erase(), planned.erase(), client.erase()],
        )
    }

    pub fn ephemeral_open(
        &self,
        desired: Ref<kind::Desired>,
        client: Ref<kind::ProviderClient>,
    ) -> Ref<kind::Ephemeral> {
        self.push_typed(OpCode::EphemeralOpen, vec![desired.erase(), client.erase()])
    }

    pub fn ephemeral_state(&self, handle: Ref<kind::Ephemeral>) -> Ref<kind::Object> {
        self.push_typed(OpCode::EphemeralState, vec![handle.erase()])
    }

    pub fn ephemeral_close(
        &self,
        handle: Ref<kind::Ephemeral>,
        users_done: Ref<kind::Unit>,
    ) -> Ref<kind::Unit> {
        self.push_typed(
            OpCode::EphemeralClose,
            vec![handle.erase(), users_done.erase()],
        )
    }

    // ── Sinks and finalization ────────────────────────────────────────────────

    /// Mark `source` as producing the final object for `addr`, to be exported
    /// to the expression evaluator. At most one sink per address.
    pub fn set_sink(&self, addr: ResourceInstanceAddr, source: Ref<kind::Object>) {
        let mut inner = self.lock();
        inner
            .check_ref(&source.erase())
            .expect("sink source from another graph");
        if inner.sinks.insert(addr.clone(), source.erase()).is_some() {
            panic!("sink already registered for {}", addr);
        }
    }

    /// Freeze the accumulated tables into an immutable [`Graph`]. The builder
    /// and any outstanding [`CloseBlocker`]s are invalidated.
    pub fn finish(self) -> Graph {
        let mut inner = self.lock();
        inner.finished = true;
        Graph {
            values: std::mem::take(&mut inner.values),
            resource_addrs: std::mem::take(&mut inner.resource_addrs),
            provider_addrs: std::mem::take(&mut inner.provider_addrs),
            operations: std::mem::take(&mut inner.operations),
            waiters: std::mem::take(&mut inner.waiters),
            sinks: std::mem::take(&mut inner.sinks),
        }
    }

    // ── Internal appends (typed layer and unmarshal replay) ──────────────────

    fn push_typed<K: crate::refs::RefKind>(
        &self,
        opcode: OpCode,
        operands: Vec<RawRef>,
    ) -> Ref<K> {
        let raw = self
            .try_push_op(opcode, operands)
            .unwrap_or_else(|err| panic!("bad operands for {}: {:?}", opcode, err));
        Ref::from_raw(raw)
    }

    pub(crate) fn try_push_op(
        &self,
        opcode: OpCode,
        operands: Vec<RawRef>,
    ) -> Result<RawRef, OperandError> {
        let mut inner = self.lock();
        let expected = opcode.operand_types();
        if operands.len() != expected.len() {
            return Err(OperandError::WrongCount {
                got: operands.len(),
                want: expected.len(),
            });
        }
        for (index, (operand, want)) in operands.iter().zip(expected).enumerate() {
            if inner.check_ref(operand).is_err() {
                return Err(OperandError::DanglingRef { index });
            }
            if operand.result_type() != *want {
                return Err(OperandError::TypeMismatch {
                    index,
                    got: operand.result_type(),
                    want: *want,
                });
            }
        }
        Ok(inner.push_op(opcode, operands))
    }

    /// Append a waiter that is never the shared empty singleton, so the
    /// unmarshaller can safely grow it afterwards.
    pub(crate) fn new_growable_waiter(&self, refs: Vec<RawRef>) -> RawRef {
        let mut inner = self.lock();
        let index = inner.waiters.len();
        inner.waiters.push(refs);
        RawRef::Waiter(index)
    }

    pub(crate) fn append_to_waiter(&self, waiter: usize, refs: Vec<RawRef>) {
        let mut inner = self.lock();
        inner.waiters[waiter].extend(refs);
    }

    pub(crate) fn try_set_sink(
        &self,
        addr: ResourceInstanceAddr,
        source: RawRef,
    ) -> Result<(), ResourceInstanceAddr> {
        let mut inner = self.lock();
        if inner.sinks.contains_key(&addr) {
            return Err(addr);
        }
        inner.sinks.insert(addr, source);
        Ok(())
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        GraphBuilder::new()
    }
}

impl BuilderInner {
    fn push_op(&mut self, opcode: OpCode, operands: Vec<RawRef>) -> RawRef {
        let index = self.operations.len();
        self.operations.push(Operation { opcode, operands });
        RawRef::OpResult(index, opcode.result_type())
    }

    /// Check that a reference points into this builder's tables. Catches
    /// references smuggled in from another graph, which the index-based
    /// representation cannot otherwise distinguish.
    fn check_ref(&self, r: &RawRef) -> Result<(), ()> {
        let ok = match r {
            RawRef::ConstValue(i) => *i < self.values.len(),
            RawRef::ConstResourceAddr(i) => *i < self.resource_addrs.len(),
            RawRef::ConstProviderAddr(i) => *i < self.provider_addrs.len(),
            RawRef::OpResult(i, ty) => self
                .operations
                .get(*i)
                .map(|op| op.opcode.result_type() == *ty)
                .unwrap_or(false),
            RawRef::Waiter(i) => *i < self.waiters.len(),
            RawRef::Nil(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }
}

/// Registration handle for a growable waiter; see
/// [`GraphBuilder::close_blocker`].
#[derive(Clone)]
pub struct CloseBlocker {
    inner: Arc<Mutex<BuilderInner>>,
    waiter: usize,
}

impl CloseBlocker {
    /// Add one more dependency that must complete before the blocked close
    /// runs. Panics after the graph has been finished.
    pub fn add(&self, r: impl Into<RawRef>) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            !inner.finished,
            "close blocker used after the graph was finished"
        );
        let r = r.into();
        inner.check_ref(&r).expect("dependency from another graph");
        let waiter = self.waiter;
        inner.waiters[waiter].push(r);
    }
}
