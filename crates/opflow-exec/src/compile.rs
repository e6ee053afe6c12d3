use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use opflow_domain::{Diagnostic, Diagnostics, DynValue, ProviderInstanceAddr, ResourceInstanceAddr};
use opflow_graph::{Graph, OpCode, RawRef, ResultType};
use opflow_promising::{Promise, PromiseError, PromiseRuntime, RequestId, Resolver, Worker};

use crate::context::ExecContext;
use crate::contract::Operations;
use crate::objects::{
    DesiredResourceInstance, EphemeralHandle, FinalPlan, ProviderClient, ProviderConfig,
    ResourceObject,
};

/// What flows through a step's promise: a tagged value instead of the
/// source's untyped `any`, so operand consumers downcast against the
/// opcode-dictated variant and a mismatch is a reportable bug rather than a
/// panic.
#[derive(Debug, Clone)]
pub(crate) enum StepValue {
    Unit,
    Value(DynValue),
    ResourceAddr(ResourceInstanceAddr),
    ProviderAddr(ProviderInstanceAddr),
    ProviderConfig(Option<ProviderConfig>),
    ProviderClient(Option<ProviderClient>),
    Desired(Option<DesiredResourceInstance>),
    Object(Option<ResourceObject>),
    FinalPlan(Option<FinalPlan>),
    Ephemeral(Option<EphemeralHandle>),
}

impl StepValue {
    pub(crate) fn nil_of(ty: ResultType) -> StepValue {
        match ty {
            ResultType::Value => StepValue::Value(DynValue::Null),
            ResultType::ProviderConfig => StepValue::ProviderConfig(None),
            ResultType::ProviderClient => StepValue::ProviderClient(None),
            ResultType::Desired => StepValue::Desired(None),
            ResultType::Object => StepValue::Object(None),
            ResultType::FinalPlan => StepValue::FinalPlan(None),
            ResultType::Ephemeral => StepValue::Ephemeral(None),
            // addresses have no meaningful zero value; the consuming
            // operation reports the mismatch
            ResultType::ResourceAddr | ResultType::ProviderAddr | ResultType::Unit => {
                StepValue::Unit
            }
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            StepValue::Unit => "unit",
            StepValue::Value(_) => "a value",
            StepValue::ResourceAddr(_) => "a resource instance address",
            StepValue::ProviderAddr(_) => "a provider instance address",
            StepValue::ProviderConfig(_) => "a provider instance config",
            StepValue::ProviderClient(None) => "a nil provider client",
            StepValue::ProviderClient(_) => "a provider client",
            StepValue::Desired(_) => "a desired resource instance",
            StepValue::Object(_) => "a resource object",
            StepValue::FinalPlan(_) => "a final plan",
            StepValue::Ephemeral(None) => "a nil ephemeral handle",
            StepValue::Ephemeral(_) => "an ephemeral handle",
        }
    }

    /// The evaluator-facing value, for sinks.
    pub(crate) fn as_dyn_value(&self) -> DynValue {
        match self {
            StepValue::Unit => DynValue::Null,
            StepValue::Value(v) => v.clone(),
            StepValue::ResourceAddr(addr) => DynValue::string(addr.to_string()),
            StepValue::ProviderAddr(addr) => DynValue::string(addr.to_string()),
            StepValue::ProviderConfig(config) => config
                .as_ref()
                .map(|c| c.value.clone())
                .unwrap_or(DynValue::Null),
            StepValue::ProviderClient(_) | StepValue::Ephemeral(_) => DynValue::Null,
            StepValue::Desired(desired) => desired
                .as_ref()
                .map(|d| d.config.clone())
                .unwrap_or(DynValue::Null),
            StepValue::Object(object) => object
                .as_ref()
                .map(|o| o.value.clone())
                .unwrap_or(DynValue::Null),
            StepValue::FinalPlan(plan) => plan
                .as_ref()
                .map(|p| p.planned_value.clone())
                .unwrap_or(DynValue::Null),
        }
    }

    pub(crate) fn into_value(self) -> Result<DynValue, &'static str> {
        match self {
            StepValue::Value(v) => Ok(v),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_resource_addr(self) -> Result<ResourceInstanceAddr, &'static str> {
        match self {
            StepValue::ResourceAddr(addr) => Ok(addr),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_provider_addr(self) -> Result<ProviderInstanceAddr, &'static str> {
        match self {
            StepValue::ProviderAddr(addr) => Ok(addr),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_config(self) -> Result<ProviderConfig, &'static str> {
        match self {
            StepValue::ProviderConfig(Some(config)) => Ok(config),
            StepValue::ProviderConfig(None) => Err("a nil provider instance config"),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_client(self) -> Result<ProviderClient, &'static str> {
        match self {
            StepValue::ProviderClient(Some(client)) => Ok(client),
            StepValue::ProviderClient(None) => Err("a nil provider client"),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_desired(self) -> Result<Option<DesiredResourceInstance>, &'static str> {
        match self {
            StepValue::Desired(desired) => Ok(desired),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_object(self) -> Result<Option<ResourceObject>, &'static str> {
        match self {
            StepValue::Object(object) => Ok(object),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_plan(self) -> Result<Option<FinalPlan>, &'static str> {
        match self {
            StepValue::FinalPlan(plan) => Ok(plan),
            other => Err(other.type_name()),
        }
    }

    pub(crate) fn into_ephemeral(self) -> Result<EphemeralHandle, &'static str> {
        match self {
            StepValue::Ephemeral(Some(handle)) => Ok(handle),
            StepValue::Ephemeral(None) => Err("a nil ephemeral handle"),
            other => Err(other.type_name()),
        }
    }
}

/// A step's resolution: its output plus whether dependents may proceed.
/// Diagnostics travel straight to the executor's accumulator so each failure
/// is reported exactly once.
#[derive(Debug, Clone)]
pub(crate) struct StepResult {
    pub value: StepValue,
    pub can_continue: bool,
}

impl StepResult {
    pub(crate) fn failed(ty: ResultType) -> StepResult {
        StepResult {
            value: StepValue::nil_of(ty),
            can_continue: false,
        }
    }
}

pub(crate) enum FetchError {
    Promise(PromiseError),
    Cancelled,
}

/// Where a step operand comes from at runtime. Constants resolve
/// immediately; operation results await the producing step's promise;
/// waiters await every component in turn and AND their continue bits.
pub(crate) enum OperandSource {
    Value(DynValue),
    ResourceAddr(ResourceInstanceAddr),
    ProviderAddr(ProviderInstanceAddr),
    Op(Promise<StepResult>),
    Waiter(Vec<OperandSource>),
    Nil(ResultType),
}

impl OperandSource {
    /// Resolve this operand. With `cancel` set, a pending await races the
    /// cancellation signal; close steps pass `None` because they must keep
    /// waiting for their users and then release the resource regardless.
    pub(crate) fn fetch<'a>(
        &'a self,
        cancel: Option<&'a ExecContext>,
        worker: &'a Worker,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                OperandSource::Value(v) => Ok(StepResult {
                    value: StepValue::Value(v.clone()),
                    can_continue: true,
                }),
                OperandSource::ResourceAddr(addr) => Ok(StepResult {
                    value: StepValue::ResourceAddr(addr.clone()),
                    can_continue: true,
                }),
                OperandSource::ProviderAddr(addr) => Ok(StepResult {
                    value: StepValue::ProviderAddr(addr.clone()),
                    can_continue: true,
                }),
                OperandSource::Op(promise) => {
                    let result = match cancel {
                        Some(ctx) => tokio::select! {
                            result = promise.wait(worker) => result,
                            _ = ctx.cancelled() => return Err(FetchError::Cancelled),
                        },
                        None => promise.wait(worker).await,
                    };
                    result.map_err(FetchError::Promise)
                }
                OperandSource::Waiter(components) => {
                    let mut can_continue = true;
                    for component in components {
                        let result = component.fetch(cancel, worker).await?;
                        can_continue &= result.can_continue;
                    }
                    Ok(StepResult {
                        value: StepValue::Unit,
                        can_continue,
                    })
                }
                OperandSource::Nil(ty) => Ok(StepResult {
                    value: StepValue::nil_of(*ty),
                    can_continue: true,
                }),
            }
        })
    }
}

pub(crate) struct Step {
    pub opcode: OpCode,
    pub operands: Vec<OperandSource>,
    pub resolver: Resolver<StepResult>,
    pub summary: String,
    pub postcondition_addr: Option<ResourceInstanceAddr>,
    pub check_postconditions: bool,
    pub shared: Arc<StepShared>,
}

/// Compile-wide context every step can reach: operation summaries keyed by
/// promise request id, for reporting self-dependency and abandonment.
pub(crate) struct StepShared {
    pub summaries: HashMap<RequestId, String>,
}

/// The executable form of a graph: one step per operation plus the sink
/// fetchers the evaluator reads through. Must outlive any use of its sinks;
/// the `Operations` implementation may call back into
/// [`resource_instance_value`](CompiledGraph::resource_instance_value) while
/// [`execute`](CompiledGraph::execute) is running.
pub struct CompiledGraph {
    pub(crate) runtime: PromiseRuntime,
    pub(crate) steps: Mutex<Option<Vec<Step>>>,
    pub(crate) cleanup: Mutex<Option<Worker>>,
    pub(crate) sinks: HashMap<ResourceInstanceAddr, OperandSource>,
    pub(crate) ops: Arc<dyn Operations>,
}

/// Lower an immutable graph into executable steps wired through promises.
///
/// Every operand reference is re-checked against its opcode's signature;
/// violations (only possible with a hand-assembled graph) reject the whole
/// graph with "bug in the engine" diagnostics rather than compiling something
/// that would fail strangely at runtime.
pub fn compile(graph: &Graph, ops: Arc<dyn Operations>) -> Result<CompiledGraph, Diagnostics> {
    let mut diags = Diagnostics::new();
    let runtime = PromiseRuntime::new();
    let cleanup = runtime.new_worker();

    let mut resolvers = Vec::with_capacity(graph.operations().len());
    let mut promises = Vec::with_capacity(graph.operations().len());
    for _ in graph.operations() {
        let (resolver, promise) = runtime.new_request::<StepResult>(&cleanup);
        resolvers.push(resolver);
        promises.push(promise);
    }

    let shared = Arc::new(StepShared {
        summaries: promises
            .iter()
            .enumerate()
            .map(|(i, p)| (p.request_id(), graph.operation_summary(i)))
            .collect(),
    });

    let mut steps = Vec::with_capacity(graph.operations().len());
    for ((index, op), resolver) in graph.operations().iter().enumerate().zip(resolvers) {
        let summary = graph.operation_summary(index);
        let expected = op.opcode.operand_types();
        if op.operands.len() != expected.len() {
            diags.push(Diagnostic::bug(
                "wrong number of operands",
                format!(
                    "{} has {} operands but {} requires {}.",
                    summary,
                    op.operands.len(),
                    op.opcode,
                    expected.len()
                ),
            ));
            continue;
        }
        let operands = op
            .operands
            .iter()
            .zip(expected)
            .enumerate()
            .map(|(n, (r, want))| {
                let what = format!("{} operand {}", summary, n);
                lower_operand(graph, *r, Some(*want), &promises, &what, &mut diags)
            })
            .collect();
        let check_postconditions = matches!(
            op.opcode,
            OpCode::ManagedApply | OpCode::DataRead | OpCode::EphemeralState
        );
        steps.push(Step {
            opcode: op.opcode,
            operands,
            resolver,
            postcondition_addr: check_postconditions
                .then(|| graph.operation_resource_addr(index).cloned())
                .flatten(),
            check_postconditions,
            summary,
            shared: Arc::clone(&shared),
        });
    }

    let mut sinks = HashMap::new();
    for (addr, r) in graph.sinks() {
        let what = format!("sink for {}", addr);
        let source = lower_operand(graph, *r, None, &promises, &what, &mut diags);
        sinks.insert(addr.clone(), source);
    }

    if diags.has_errors() {
        return Err(diags);
    }
    Ok(CompiledGraph {
        runtime,
        steps: Mutex::new(Some(steps)),
        cleanup: Mutex::new(Some(cleanup)),
        sinks,
        ops,
    })
}

fn lower_operand(
    graph: &Graph,
    r: RawRef,
    want: Option<ResultType>,
    promises: &[Promise<StepResult>],
    what: &str,
    diags: &mut Diagnostics,
) -> OperandSource {
    if let Some(want) = want {
        if r.result_type() != want {
            diags.push(Diagnostic::bug(
                "operand type mismatch",
                format!(
                    "{} has type {}, but {} is required.",
                    what,
                    r.result_type(),
                    want
                ),
            ));
            return OperandSource::Nil(want);
        }
    }
    let mut visiting = HashSet::new();
    lower_checked(graph, r, promises, what, diags, &mut visiting)
}

fn lower_checked(
    graph: &Graph,
    r: RawRef,
    promises: &[Promise<StepResult>],
    what: &str,
    diags: &mut Diagnostics,
    visiting: &mut HashSet<usize>,
) -> OperandSource {
    let dangling = |diags: &mut Diagnostics| {
        diags.push(Diagnostic::bug(
            "dangling reference",
            format!("{} refers outside the graph's tables.", what),
        ));
        OperandSource::Nil(r.result_type())
    };
    match r {
        RawRef::ConstValue(i) => match graph.values().get(i) {
            Some(v) => OperandSource::Value(v.clone()),
            None => dangling(diags),
        },
        RawRef::ConstResourceAddr(i) => match graph.resource_addr(i) {
            Some(addr) => OperandSource::ResourceAddr(addr.clone()),
            None => dangling(diags),
        },
        RawRef::ConstProviderAddr(i) => match graph.provider_addr(i) {
            Some(addr) => OperandSource::ProviderAddr(addr.clone()),
            None => dangling(diags),
        },
        RawRef::OpResult(i, _) => match promises.get(i) {
            Some(promise) => OperandSource::Op(promise.clone()),
            None => dangling(diags),
        },
        RawRef::Waiter(w) => {
            if !visiting.insert(w) {
                diags.push(Diagnostic::bug(
                    "waiter cycle",
                    format!("{} awaits a waiter that contains itself.", what),
                ));
                return OperandSource::Nil(ResultType::Unit);
            }
            let components = match graph.waiter(w) {
                Some(components) => components
                    .iter()
                    .map(|c| lower_checked(graph, *c, promises, what, diags, visiting))
                    .collect(),
                None => return dangling(diags),
            };
            visiting.remove(&w);
            OperandSource::Waiter(components)
        }
        RawRef::Nil(ty) => OperandSource::Nil(ty),
    }
}
