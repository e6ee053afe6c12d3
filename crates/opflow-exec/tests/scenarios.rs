//! End-to-end scenarios driving compiled graphs against a call-logging mock
//! of the `Operations` seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use opflow_domain::{
    DeposedKey, Diagnostic, Diagnostics, DynValue, ProviderInstanceAddr, ResourceInstanceAddr,
};
use opflow_exec::{
    compile, DesiredResourceInstance, EphemeralHandle, ExecContext, ExecOptions, FinalPlan,
    Operations, ProviderClient, ProviderConfig, ResourceObject,
};
use opflow_graph::{Graph, GraphBuilder, OpCode, Operation, RawRef, Ref};

fn raddr(s: &str) -> ResourceInstanceAddr {
    s.parse().unwrap()
}

fn paddr(s: &str) -> ProviderInstanceAddr {
    s.parse().unwrap()
}

fn planned_thingy() -> DynValue {
    DynValue::from(json!({ "name": "thingy" }))
}

/// Scriptable `Operations` implementation. Records every call; failure and
/// panic knobs drive the unhappy-path scenarios.
#[derive(Default)]
struct MockOps {
    calls: Mutex<Vec<String>>,
    desired: HashMap<ResourceInstanceAddr, DynValue>,
    fail_apply: bool,
    panic_on_apply: bool,
    block_reads_until_cancel: bool,
}

impl MockOps {
    fn log(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count_of(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn position_of(&self, entry: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == entry)
    }
}

struct TestClient {
    source: String,
}

#[async_trait]
impl Operations for MockOps {
    async fn provider_instance_config(
        &self,
        _ctx: &ExecContext,
        addr: &ProviderInstanceAddr,
    ) -> (Option<ProviderConfig>, Diagnostics) {
        self.log(format!("ProviderInstanceConfig {}", addr));
        (
            Some(ProviderConfig {
                addr: addr.clone(),
                value: DynValue::Null,
            }),
            Diagnostics::new(),
        )
    }

    async fn provider_instance_open(
        &self,
        _ctx: &ExecContext,
        config: &ProviderConfig,
    ) -> (Option<ProviderClient>, Diagnostics) {
        self.log(format!("ProviderInstanceOpen {}", config.addr));
        (
            Some(ProviderClient::new(TestClient {
                source: config.addr.source.clone(),
            })),
            Diagnostics::new(),
        )
    }

    async fn provider_instance_close(
        &self,
        _ctx: &ExecContext,
        client: &ProviderClient,
    ) -> Diagnostics {
        let source = client
            .downcast::<TestClient>()
            .map(|c| c.source.clone())
            .unwrap_or_default();
        self.log(format!("ProviderInstanceClose {}", source));
        Diagnostics::new()
    }

    async fn resource_instance_desired(
        &self,
        _ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
    ) -> (Option<DesiredResourceInstance>, Diagnostics) {
        self.log(format!("ResourceInstanceDesired {}", addr));
        (
            Some(DesiredResourceInstance {
                addr: addr.clone(),
                config: self.desired.get(addr).cloned().unwrap_or(DynValue::Null),
            }),
            Diagnostics::new(),
        )
    }

    async fn resource_instance_prior(
        &self,
        _ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
    ) -> (Option<ResourceObject>, Diagnostics) {
        self.log(format!("ResourceInstancePrior {}", addr));
        (None, Diagnostics::new())
    }

    async fn managed_final_plan(
        &self,
        _ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        _prior: Option<&ResourceObject>,
        planned: &DynValue,
        _client: &ProviderClient,
    ) -> (Option<FinalPlan>, Diagnostics) {
        let addr = desired
            .map(|d| d.addr.clone())
            .unwrap_or_else(|| raddr("test_thing.unknown"));
        self.log(format!("ManagedFinalPlan {}", addr));
        (
            Some(FinalPlan {
                addr,
                action: opflow_domain::ChangeAction::Create,
                planned_value: planned.clone(),
            }),
            Diagnostics::new(),
        )
    }

    async fn managed_apply(
        &self,
        _ctx: &ExecContext,
        plan: Option<&FinalPlan>,
        _fallback: Option<&ResourceObject>,
        _client: &ProviderClient,
    ) -> (Option<ResourceObject>, Diagnostics) {
        let addr = plan
            .map(|p| p.addr.to_string())
            .unwrap_or_else(|| "test_thing.unknown".to_string());
        self.log(format!("ManagedApply {}", addr));
        if self.panic_on_apply {
            panic!("apply exploded");
        }
        if self.fail_apply {
            return (
                None,
                Diagnostic::error("apply failed")
                    .with_detail("The provider refused to create the object.")
                    .into(),
            );
        }
        // echo the planned value back as the new object
        let value = plan.map(|p| p.planned_value.clone()).unwrap_or(DynValue::Null);
        (Some(ResourceObject::ready(value)), Diagnostics::new())
    }

    async fn managed_depose(
        &self,
        _ctx: &ExecContext,
        prior: Option<&ResourceObject>,
    ) -> (Option<ResourceObject>, Diagnostics) {
        self.log("ManagedDepose");
        (prior.cloned(), Diagnostics::new())
    }

    async fn managed_already_deposed(
        &self,
        _ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
        key: &DeposedKey,
    ) -> (Option<ResourceObject>, Diagnostics) {
        self.log(format!("ManagedAlreadyDeposed {} {}", addr, key));
        (Some(ResourceObject::tainted(DynValue::Null)), Diagnostics::new())
    }

    async fn managed_change_addr(
        &self,
        _ctx: &ExecContext,
        current: Option<&ResourceObject>,
        new_addr: &ResourceInstanceAddr,
    ) -> (Option<ResourceObject>, Diagnostics) {
        self.log(format!("ManagedChangeAddr {}", new_addr));
        (current.cloned(), Diagnostics::new())
    }

    async fn data_read(
        &self,
        ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        _planned: &DynValue,
        _client: &ProviderClient,
    ) -> (Option<ResourceObject>, Diagnostics) {
        let addr = desired
            .map(|d| d.addr.to_string())
            .unwrap_or_else(|| "data.test_thing.unknown".to_string());
        self.log(format!("DataRead {} start", addr));
        if self.block_reads_until_cancel {
            ctx.cancelled().await;
            self.log(format!("DataRead {} interrupted", addr));
            return (
                None,
                Diagnostic::error("data read interrupted")
                    .with_detail("The read was abandoned because the run was cancelled.")
                    .into(),
            );
        }
        self.log(format!("DataRead {} done", addr));
        let value = desired.map(|d| d.config.clone()).unwrap_or(DynValue::Null);
        (Some(ResourceObject::ready(value)), Diagnostics::new())
    }

    async fn ephemeral_open(
        &self,
        _ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        _client: &ProviderClient,
    ) -> (Option<EphemeralHandle>, Diagnostics) {
        let addr = desired
            .map(|d| d.addr.to_string())
            .unwrap_or_default();
        self.log(format!("EphemeralOpen {}", addr));
        (Some(EphemeralHandle::new(addr)), Diagnostics::new())
    }

    async fn ephemeral_state(
        &self,
        _ctx: &ExecContext,
        handle: &EphemeralHandle,
    ) -> (Option<ResourceObject>, Diagnostics) {
        let addr = handle
            .downcast::<String>()
            .map(|s| (*s).clone())
            .unwrap_or_default();
        self.log(format!("EphemeralState {}", addr));
        (
            Some(ResourceObject::ready(DynValue::string("ephemeral"))),
            Diagnostics::new(),
        )
    }

    async fn ephemeral_close(&self, _ctx: &ExecContext, handle: &EphemeralHandle) -> Diagnostics {
        let addr = handle
            .downcast::<String>()
            .map(|s| (*s).clone())
            .unwrap_or_default();
        self.log(format!("EphemeralClose {}", addr));
        Diagnostics::new()
    }

    async fn resource_instance_postconditions(
        &self,
        _ctx: &ExecContext,
        addr: Option<&ResourceInstanceAddr>,
        _object: &ResourceObject,
    ) -> Diagnostics {
        let addr = addr.map(|a| a.to_string()).unwrap_or_default();
        self.log(format!("ResourceInstancePostconditions {}", addr));
        Diagnostics::new()
    }
}

/// One managed instance, created through a single provider instance whose
/// close waits for the apply.
fn single_create_graph() -> Graph {
    let b = GraphBuilder::new();
    let provider = paddr("provider[\"terraform.io/builtin/test\"]");
    let resource = raddr("test.example");

    let (client, close) = b.provider_instance(provider, b.wait_for([]));
    let addr_ref = b.const_resource_addr(resource.clone());
    let desired = b.resource_instance_desired(addr_ref, b.wait_for([]));
    let prior = b.resource_instance_prior(addr_ref);
    let planned = b.const_value(planned_thingy());
    let plan = b.managed_final_plan(desired, prior, planned, client);
    let applied = b.managed_apply(plan, Ref::nil(), client);
    close.add(applied);
    b.set_sink(resource, applied);
    b.finish()
}

fn mock_with_thingy_desired() -> Arc<MockOps> {
    Arc::new(MockOps {
        desired: HashMap::from([(raddr("test.example"), planned_thingy())]),
        ..MockOps::default()
    })
}

#[tokio::test]
async fn single_managed_resource_create() {
    let graph = single_create_graph();
    let ops = mock_with_thingy_desired();
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");

    let ctx = ExecContext::new();
    let diags = compiled.execute(&ctx).await;
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);

    let value = compiled
        .resource_instance_value(&ctx, &raddr("test.example"))
        .await;
    assert_eq!(value, planned_thingy());

    for call in [
        "ProviderInstanceConfig",
        "ProviderInstanceOpen",
        "ResourceInstancePrior",
        "ResourceInstanceDesired",
        "ManagedFinalPlan",
        "ManagedApply",
        "ProviderInstanceClose",
    ] {
        assert_eq!(
            ops.count_of(call),
            1,
            "expected exactly one {} in {:?}",
            call,
            ops.calls()
        );
    }
}

#[tokio::test]
async fn data_read_waits_for_its_dependency() {
    let b = GraphBuilder::new();
    let provider = paddr("provider[\"terraform.io/builtin/test\"]");
    let (client, close) = b.provider_instance(provider, b.wait_for([]));

    let addr1 = b.const_resource_addr(raddr("data.test.example1"));
    let desired1 = b.resource_instance_desired(addr1, b.wait_for([]));
    let read1 = b.data_read(desired1, b.const_value(DynValue::Unknown), client);

    // example2's desired state only resolves after example1's read completes
    let gate = b.wait_for([read1.erase()]);
    let addr2 = b.const_resource_addr(raddr("data.test.example2"));
    let desired2 = b.resource_instance_desired(addr2, gate);
    let read2 = b.data_read(desired2, b.const_value(DynValue::Unknown), client);

    close.add(read1);
    close.add(read2);
    b.set_sink(raddr("data.test.example1"), read1);
    b.set_sink(raddr("data.test.example2"), read2);
    let graph = b.finish();

    let ops = Arc::new(MockOps::default());
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");
    let diags = compiled.execute(&ExecContext::new()).await;
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);

    let first_done = ops
        .position_of("DataRead data.test.example1 done")
        .expect("first read should complete");
    let second_start = ops
        .position_of("DataRead data.test.example2 start")
        .expect("second read should run");
    assert!(
        first_done < second_start,
        "second read started before the first completed: {:?}",
        ops.calls()
    );
}

#[tokio::test]
async fn apply_failure_still_closes_the_provider() {
    let graph = single_create_graph();
    let ops = Arc::new(MockOps {
        desired: HashMap::from([(raddr("test.example"), planned_thingy())]),
        fail_apply: true,
        ..MockOps::default()
    });
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");

    let ctx = ExecContext::new();
    let diags = compiled.execute(&ctx).await;
    assert!(diags.has_errors());
    assert!(
        diags.iter().any(|d| d.summary == "apply failed"),
        "diagnostics should carry the apply error: {}",
        diags
    );

    assert_eq!(ops.count_of("ProviderInstanceClose"), 1);
    let value = compiled
        .resource_instance_value(&ctx, &raddr("test.example"))
        .await;
    assert_eq!(value, DynValue::Unknown, "failed sink must read as unknown");
}

#[tokio::test]
async fn self_dependency_is_reported_with_both_operations() {
    let b = GraphBuilder::new();
    let addr_a = b.const_resource_addr(raddr("test.a"));
    let addr_b = b.const_resource_addr(raddr("test.b"));

    // op B waits on a growable gate; op A consumes B's result; the gate is
    // then pointed at A, closing the loop
    let (gate, blocker) = b.close_blocker();
    let desired_b = b.resource_instance_desired(addr_b, gate);
    let desired_a = b.resource_instance_desired(addr_a, b.wait_for([desired_b.erase()]));
    blocker.add(desired_a);
    let graph = b.finish();

    let ops = Arc::new(MockOps::default());
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");
    let diags = compiled.execute(&ExecContext::new()).await;

    let cycle = diags
        .iter()
        .find(|d| d.summary == "self-dependency between operations")
        .unwrap_or_else(|| panic!("expected a self-dependency diagnostic, got: {}", diags));
    assert!(
        cycle.detail.contains("test.a") && cycle.detail.contains("test.b"),
        "cycle report should name both operations: {}",
        cycle.detail
    );
}

#[tokio::test]
async fn round_tripped_graph_behaves_identically() {
    let graph = single_create_graph();
    let restored = Graph::unmarshal(&graph.marshal().unwrap()).unwrap();
    assert_eq!(restored.to_string(), graph.to_string());

    let ops = mock_with_thingy_desired();
    let compiled = compile(&restored, ops.clone()).expect("restored graph should compile");
    let ctx = ExecContext::new();
    let diags = compiled.execute(&ctx).await;
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);
    assert_eq!(
        compiled
            .resource_instance_value(&ctx, &raddr("test.example"))
            .await,
        planned_thingy()
    );
}

#[tokio::test]
async fn panicking_step_fails_dependents_instead_of_blocking() {
    let graph = single_create_graph();
    let ops = Arc::new(MockOps {
        desired: HashMap::from([(raddr("test.example"), planned_thingy())]),
        panic_on_apply: true,
        ..MockOps::default()
    });
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");

    let ctx = ExecContext::new();
    // must terminate: the panicked step's promise is force-failed, the close
    // still runs, and the executor reports the panic
    let diags = tokio::time::timeout(Duration::from_secs(5), compiled.execute(&ctx))
        .await
        .expect("execution must not hang on a panicked step");
    assert!(diags.has_errors());
    assert!(
        diags.iter().any(|d| d.summary == "graph step panicked"),
        "diagnostics: {}",
        diags
    );
    assert_eq!(ops.count_of("ProviderInstanceClose"), 1);
    assert_eq!(
        compiled
            .resource_instance_value(&ctx, &raddr("test.example"))
            .await,
        DynValue::Unknown
    );
}

#[tokio::test]
async fn cancellation_interrupts_reads_but_still_closes() {
    let b = GraphBuilder::new();
    let provider = paddr("provider[\"terraform.io/builtin/test\"]");
    let (client, close) = b.provider_instance(provider, b.wait_for([]));
    let addr = b.const_resource_addr(raddr("data.test.slow"));
    let desired = b.resource_instance_desired(addr, b.wait_for([]));
    let read = b.data_read(desired, b.const_value(DynValue::Unknown), client);
    close.add(read);
    b.set_sink(raddr("data.test.slow"), read);
    let graph = b.finish();

    let ops = Arc::new(MockOps {
        block_reads_until_cancel: true,
        ..MockOps::default()
    });
    let compiled = Arc::new(compile(&graph, ops.clone()).expect("graph should compile"));

    let ctx = ExecContext::new();
    let task = tokio::spawn({
        let compiled = Arc::clone(&compiled);
        let ctx = ctx.clone();
        async move { compiled.execute(&ctx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();
    let diags = task.await.unwrap();

    assert!(diags.has_errors());
    assert_eq!(
        diags
            .iter()
            .filter(|d| d.summary == "execution cancelled")
            .count(),
        1,
        "cancellation must be surfaced exactly once: {}",
        diags
    );
    assert_eq!(ops.count_of("ProviderInstanceClose"), 1);
}

#[tokio::test]
async fn every_opcode_compiles_and_executes() {
    let b = GraphBuilder::new();
    let provider_addr = b.const_provider_addr(paddr("provider[\"terraform.io/builtin/test\"]"));
    let managed_addr = b.const_resource_addr(raddr("test.a"));
    let moved_addr = b.const_resource_addr(raddr("test.b"));
    let data_addr = b.const_resource_addr(raddr("data.test.c"));
    let eph_addr = b.const_resource_addr(raddr("ephemeral.test.d"));

    let config = b.provider_instance_config(provider_addr, b.wait_for([]));
    let client = b.provider_instance_open(config);

    let desired = b.resource_instance_desired(managed_addr, b.wait_for([]));
    let prior = b.resource_instance_prior(managed_addr);
    let planned = b.const_value(planned_thingy());
    let plan = b.managed_final_plan(desired, prior, planned, client);
    let deposed = b.managed_depose(prior);
    let key = b.const_value(DynValue::string("deadbeef"));
    let already = b.managed_already_deposed(managed_addr, key);
    let applied = b.managed_apply(plan, deposed, client);
    let moved = b.managed_change_addr(applied, moved_addr);

    let data_desired = b.resource_instance_desired(data_addr, b.wait_for([]));
    let read = b.data_read(data_desired, b.const_value(DynValue::Unknown), client);

    let eph_desired = b.resource_instance_desired(eph_addr, b.wait_for([]));
    let handle = b.ephemeral_open(eph_desired, client);
    let eph_obj = b.ephemeral_state(handle);
    b.ephemeral_close(handle, b.wait_for([eph_obj.erase()]));

    b.provider_instance_close(
        client,
        b.wait_for([moved.erase(), read.erase(), already.erase()]),
    );
    b.set_sink(raddr("test.b"), moved);
    let graph = b.finish();

    let seen: std::collections::HashSet<OpCode> =
        graph.operations().iter().map(|op| op.opcode).collect();
    for opcode in OpCode::ALL {
        assert!(seen.contains(&opcode), "graph is missing {}", opcode);
    }

    let ops = Arc::new(MockOps::default());
    let compiled = compile(&graph, ops.clone()).expect("every opcode should compile");
    let diags = compiled.execute(&ExecContext::new()).await;
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);

    for call in [
        "ProviderInstanceConfig",
        "ProviderInstanceOpen",
        "ProviderInstanceClose",
        "ResourceInstanceDesired",
        "ResourceInstancePrior",
        "ManagedFinalPlan",
        "ManagedApply",
        "ManagedDepose",
        "ManagedAlreadyDeposed",
        "ManagedChangeAddr",
        "DataRead",
        "EphemeralOpen",
        "EphemeralState",
        "EphemeralClose",
    ] {
        assert!(
            ops.count_of(call) >= 1,
            "expected at least one {} call in {:?}",
            call,
            ops.calls()
        );
    }
}

#[tokio::test]
async fn postconditions_run_for_resource_producing_operations() {
    let graph = single_create_graph();
    let ops = mock_with_thingy_desired();
    let compiled = compile(&graph, ops.clone()).expect("graph should compile");
    let diags = compiled.execute(&ExecContext::new()).await;
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);
    assert_eq!(
        ops.count_of("ResourceInstancePostconditions test.example"),
        1,
        "apply result should be postcondition-checked once: {:?}",
        ops.calls()
    );
}

#[tokio::test]
async fn compiler_rejects_mistyped_and_misarity_operations() {
    // ResourceInstancePrior handed a constant value instead of an address
    let mistyped = Graph::from_raw_parts(
        vec![DynValue::Null],
        vec![],
        vec![],
        vec![Operation {
            opcode: OpCode::ResourceInstancePrior,
            operands: vec![RawRef::ConstValue(0)],
        }],
        vec![vec![]],
        Default::default(),
    );
    let err = compile(&mistyped, Arc::new(MockOps::default()))
        .err()
        .expect("mistyped operand must reject the graph");
    assert!(
        err.iter().any(|d| d.summary == "operand type mismatch"),
        "diagnostics: {}",
        err
    );

    // same opcode with a missing operand
    let missing = Graph::from_raw_parts(
        vec![],
        vec![],
        vec![],
        vec![Operation {
            opcode: OpCode::ResourceInstancePrior,
            operands: vec![],
        }],
        vec![vec![]],
        Default::default(),
    );
    let err = compile(&missing, Arc::new(MockOps::default()))
        .err()
        .expect("missing operand must reject the graph");
    assert!(
        err.iter().any(|d| d.summary == "wrong number of operands"),
        "diagnostics: {}",
        err
    );
}

#[tokio::test]
async fn unregistered_sink_reads_as_unknown_without_blocking() {
    let graph = single_create_graph();
    let ops = mock_with_thingy_desired();
    let compiled = compile(&graph, ops).expect("graph should compile");
    let ctx = ExecContext::new();
    // before execution even starts, an excluded instance must answer
    let value = tokio::time::timeout(
        Duration::from_secs(1),
        compiled.resource_instance_value(&ctx, &raddr("test.excluded")),
    )
    .await
    .expect("excluded instances must not block");
    assert_eq!(value, DynValue::Unknown);
}

#[tokio::test]
async fn concurrency_cap_does_not_deadlock_dependent_steps() {
    let graph = single_create_graph();
    let ops = mock_with_thingy_desired();
    let compiled = compile(&graph, ops).expect("graph should compile");
    let ctx = ExecContext::new();
    let diags = tokio::time::timeout(
        Duration::from_secs(5),
        compiled.execute_opts(
            &ctx,
            ExecOptions {
                max_concurrent_ops: Some(1),
            },
        ),
    )
    .await
    .expect("a cap of one must not deadlock the chain");
    assert!(diags.is_empty(), "unexpected diagnostics: {}", diags);
}
