use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use opflow_domain::{DeposedKey, Diagnostic, Diagnostics, DynValue, ResourceInstanceAddr};
use opflow_graph::{OpCode, ResultType};
use opflow_promising::{PromiseError, PromiseRuntime, RequestId};

use crate::compile::{CompiledGraph, FetchError, Step, StepResult, StepShared, StepValue};
use crate::context::ExecContext;
use crate::contract::Operations;

/// Execution tuning. The engine spawns one task per operation; the optional
/// cap bounds how many `Operations` calls run at once (the permit is held
/// only around the call itself, so steps blocked on each other's promises can
/// never deadlock against the cap).
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub max_concurrent_ops: Option<usize>,
}

impl CompiledGraph {
    /// Run every step to completion, concurrently, and return the aggregated
    /// diagnostics. Execution is complete only when every step has returned,
    /// close steps and waiters included.
    pub async fn execute(&self, ctx: &ExecContext) -> Diagnostics {
        self.execute_opts(ctx, ExecOptions::default()).await
    }

    pub async fn execute_opts(&self, ctx: &ExecContext, opts: ExecOptions) -> Diagnostics {
        let steps = self.steps.lock().unwrap().take();
        let Some(steps) = steps else {
            return Diagnostic::bug(
                "graph executed twice",
                "A compiled graph's steps can only be driven once.",
            )
            .into()
        };
        debug!(steps = steps.len(), "starting graph execution");

        let accumulator = Arc::new(Mutex::new(Diagnostics::new()));
        let semaphore = opts.max_concurrent_ops.map(|n| Arc::new(Semaphore::new(n)));
        let mut tasks = JoinSet::new();
        let mut task_summaries: HashMap<tokio::task::Id, String> = HashMap::new();
        for step in steps {
            let summary = step.summary.clone();
            let handle = tasks.spawn(run_step(
                step,
                ctx.clone(),
                self.runtime.clone(),
                Arc::clone(&self.ops),
                Arc::clone(&accumulator),
                semaphore.clone(),
            ));
            task_summaries.insert(handle.id(), summary);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            if let Err(err) = joined {
                // The step panicked. Its resolver was dropped during unwind,
                // so dependents have already been failed with `Unresolved`.
                let summary = task_summaries
                    .get(&err.id())
                    .map(String::as_str)
                    .unwrap_or("unknown operation");
                warn!(step = summary, "graph step panicked");
                accumulator.lock().unwrap().push(Diagnostic::bug(
                    "graph step panicked",
                    format!("{} terminated abnormally: {}.", summary, err),
                ));
            }
        }

        // Anything still owned by the sentinel cleanup worker was never taken
        // over by a step; dropping the worker force-fails it rather than
        // leaving awaiters blocked.
        *self.cleanup.lock().unwrap() = None;

        if ctx.is_cancelled() {
            accumulator.lock().unwrap().push(
                Diagnostic::error("execution cancelled")
                    .with_detail("The run was interrupted before all operations completed."),
            );
        }

        let diags = std::mem::take(&mut *accumulator.lock().unwrap());
        debug!(diagnostics = diags.len(), "graph execution finished");
        diags
    }

    /// The evaluator-facing value of a resource instance's final object.
    /// Blocks until the producing step resolves. An address with no
    /// registered sink (excluded during planning) yields an unknown
    /// placeholder immediately rather than blocking forever, as does any sink
    /// whose producing chain failed.
    pub async fn resource_instance_value(
        &self,
        ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
    ) -> DynValue {
        let Some(source) = self.sinks.get(addr) else {
            return DynValue::Unknown;
        };
        let worker = self.runtime.new_worker();
        match source.fetch(Some(ctx), &worker).await {
            Ok(result) if result.can_continue => result.value.as_dyn_value(),
            _ => DynValue::Unknown,
        }
    }
}

async fn run_step(
    step: Step,
    ctx: ExecContext,
    runtime: PromiseRuntime,
    ops: Arc<dyn Operations>,
    accumulator: Arc<Mutex<Diagnostics>>,
    semaphore: Option<Arc<Semaphore>>,
) {
    let Step {
        opcode,
        operands,
        resolver,
        summary,
        postcondition_addr,
        check_postconditions,
        shared,
    } = step;

    let worker = runtime.new_worker();
    resolver.pass_to(&worker);

    let is_close = opcode.is_close();
    let cancel = if is_close { None } else { Some(&ctx) };
    let expected = opcode.operand_types();

    let mut ok = true;
    let mut values = Vec::with_capacity(operands.len());
    let mut diags = Diagnostics::new();
    for (n, source) in operands.iter().enumerate() {
        // a close step's user gate is awaited but its failure bit ignored:
        // the resource must be released no matter how its users fared
        let user_gate = is_close && expected[n] == ResultType::Unit;
        match source.fetch(cancel, &worker).await {
            Ok(result) => {
                if !user_gate {
                    ok &= result.can_continue;
                }
                values.push(result.value);
            }
            Err(FetchError::Cancelled) => {
                ok = false;
                break;
            }
            Err(FetchError::Promise(err)) => {
                let failure = promise_failure(&err, &summary, &shared);
                if user_gate {
                    diags.append(failure);
                    values.push(StepValue::Unit);
                } else {
                    diags.append(failure);
                    ok = false;
                    break;
                }
            }
        }
    }

    let result = if !ok || (!is_close && ctx.is_cancelled()) {
        // short-circuit: the failure (or the cancellation) was reported where
        // it happened, so dependents unwind without repeating it
        StepResult::failed(opcode.result_type())
    } else {
        match invoke_op(opcode, values, &ctx, ops.as_ref(), semaphore.as_deref()).await {
            Ok((value, op_diags)) => {
                let mut result = StepResult {
                    can_continue: !op_diags.has_errors(),
                    value,
                };
                diags.append(op_diags);
                if check_postconditions && result.can_continue {
                    if let StepValue::Object(Some(object)) = &result.value {
                        let post = with_permit(
                            semaphore.as_deref(),
                            ops.resource_instance_postconditions(
                                &ctx,
                                postcondition_addr.as_ref(),
                                object,
                            ),
                        )
                        .await;
                        if post.has_errors() {
                            result.can_continue = false;
                        }
                        diags.append(post);
                    }
                }
                result
            }
            Err(bug) => {
                diags.push(bug);
                StepResult::failed(opcode.result_type())
            }
        }
    };

    if !diags.is_empty() {
        debug!(step = %summary, count = diags.len(), "step reported diagnostics");
    }
    accumulator.lock().unwrap().append(diags);
    resolver.resolve(&worker, result);
}

/// Invoke the `Operations` method matching the opcode, downcasting each
/// already-awaited operand to the type the opcode dictates.
async fn invoke_op(
    opcode: OpCode,
    values: Vec<StepValue>,
    ctx: &ExecContext,
    ops: &dyn Operations,
    semaphore: Option<&Semaphore>,
) -> Result<(StepValue, Diagnostics), Diagnostic> {
    let mut values = values.into_iter();
    let mut next = |want: &'static str| -> Result<StepValue, Diagnostic> {
        values.next().ok_or_else(|| {
            Diagnostic::bug(
                "missing operand",
                format!("{} needs {} but ran out of operands.", opcode, want),
            )
        })
    };
    let mismatch = |index: usize, want: &str, got: &str| {
        Diagnostic::bug(
            "operand type mismatch",
            format!("{} operand {} is {}, not {}.", opcode, index, got, want),
        )
    };

    match opcode {
        OpCode::ProviderInstanceConfig => {
            let addr = next("a provider address")?
                .into_provider_addr()
                .map_err(|got| mismatch(0, "a provider instance address", got))?;
            let (config, diags) =
                with_permit(semaphore, ops.provider_instance_config(ctx, &addr)).await;
            Ok((StepValue::ProviderConfig(config), diags))
        }
        OpCode::ProviderInstanceOpen => {
            let config = next("a provider config")?
                .into_config()
                .map_err(|got| mismatch(0, "a provider instance config", got))?;
            let (client, diags) =
                with_permit(semaphore, ops.provider_instance_open(ctx, &config)).await;
            Ok((StepValue::ProviderClient(client), diags))
        }
        OpCode::ProviderInstanceClose => {
            let client = next("a provider client")?
                .into_client()
                .map_err(|got| mismatch(0, "a provider client", got))?;
            let diags = with_permit(semaphore, ops.provider_instance_close(ctx, &client)).await;
            Ok((StepValue::Unit, diags))
        }
        OpCode::ResourceInstanceDesired => {
            let addr = next("a resource address")?
                .into_resource_addr()
                .map_err(|got| mismatch(0, "a resource instance address", got))?;
            let (desired, diags) =
                with_permit(semaphore, ops.resource_instance_desired(ctx, &addr)).await;
            Ok((StepValue::Desired(desired), diags))
        }
        OpCode::ResourceInstancePrior => {
            let addr = next("a resource address")?
                .into_resource_addr()
                .map_err(|got| mismatch(0, "a resource instance address", got))?;
            let (prior, diags) =
                with_permit(semaphore, ops.resource_instance_prior(ctx, &addr)).await;
            Ok((StepValue::Object(prior), diags))
        }
        OpCode::ManagedFinalPlan => {
            let desired = next("a desired instance")?
                .into_desired()
                .map_err(|got| mismatch(0, "a desired resource instance", got))?;
            let prior = next("a prior object")?
                .into_object()
                .map_err(|got| mismatch(1, "a resource object", got))?;
            let planned = next("a planned value")?
                .into_value()
                .map_err(|got| mismatch(2, "a value", got))?;
            let client = next("a provider client")?
                .into_client()
                .map_err(|got| mismatch(3, "a provider client", got))?;
            let (plan, diags) = with_permit(
                semaphore,
                ops.managed_final_plan(ctx, desired.as_ref(), prior.as_ref(), &planned, &client),
            )
            .await;
            Ok((StepValue::FinalPlan(plan), diags))
        }
        OpCode::ManagedApply => {
            let plan = next("a final plan")?
                .into_plan()
                .map_err(|got| mismatch(0, "a final plan", got))?;
            let fallback = next("a fallback object")?
                .into_object()
                .map_err(|got| mismatch(1, "a resource object", got))?;
            let client = next("a provider client")?
                .into_client()
                .map_err(|got| mismatch(2, "a provider client", got))?;
            let (object, diags) = with_permit(
                semaphore,
                ops.managed_apply(ctx, plan.as_ref(), fallback.as_ref(), &client),
            )
            .await;
            Ok((StepValue::Object(object), diags))
        }
        OpCode::ManagedDepose => {
            let prior = next("a prior object")?
                .into_object()
                .map_err(|got| mismatch(0, "a resource object", got))?;
            let (deposed, diags) =
                with_permit(semaphore, ops.managed_depose(ctx, prior.as_ref())).await;
            Ok((StepValue::Object(deposed), diags))
        }
        OpCode::ManagedAlreadyDeposed => {
            let addr = next("a resource address")?
                .into_resource_addr()
                .map_err(|got| mismatch(0, "a resource instance address", got))?;
            let key_value = next("a deposed key")?
                .into_value()
                .map_err(|got| mismatch(1, "a value", got))?;
            let key = match key_value.as_str().map(DeposedKey::new) {
                Some(Ok(key)) => key,
                _ => {
                    return Err(Diagnostic::bug(
                        "invalid deposed key",
                        format!("{} operand 1 is not a deposed key string.", opcode),
                    ))
                }
            };
            let (object, diags) =
                with_permit(semaphore, ops.managed_already_deposed(ctx, &addr, &key)).await;
            Ok((StepValue::Object(object), diags))
        }
        OpCode::ManagedChangeAddr => {
            let current = next("a current object")?
                .into_object()
                .map_err(|got| mismatch(0, "a resource object", got))?;
            let new_addr = next("a resource address")?
                .into_resource_addr()
                .map_err(|got| mismatch(1, "a resource instance address", got))?;
            let (moved, diags) = with_permit(
                semaphore,
                ops.managed_change_addr(ctx, current.as_ref(), &new_addr),
            )
            .await;
            Ok((StepValue::Object(moved), diags))
        }
        OpCode::DataRead => {
            let desired = next("a desired instance")?
                .into_desired()
                .map_err(|got| mismatch(0, "a desired resource instance", got))?;
            let planned = next("a planned value")?
                .into_value()
                .map_err(|got| mismatch(1, "a value", got))?;
            let client = next("a provider client")?
                .into_client()
                .map_err(|got| mismatch(2, "a provider client", got))?;
            let (object, diags) = with_permit(
                semaphore,
                ops.data_read(ctx, desired.as_ref(), &planned, &client),
            )
            .await;
            Ok((StepValue::Object(object), diags))
        }
        OpCode::EphemeralOpen => {
            let desired = next("a desired instance")?
                .into_desired()
                .map_err(|got| mismatch(0, "a desired resource instance", got))?;
            let client = next("a provider client")?
                .into_client()
                .map_err(|got| mismatch(1, "a provider client", got))?;
            let (handle, diags) = with_permit(
                semaphore,
                ops.ephemeral_open(ctx, desired.as_ref(), &client),
            )
            .await;
            Ok((StepValue::Ephemeral(handle), diags))
        }
        OpCode::EphemeralState => {
            let handle = next("an ephemeral handle")?
                .into_ephemeral()
                .map_err(|got| mismatch(0, "an ephemeral handle", got))?;
            let (object, diags) = with_permit(semaphore, ops.ephemeral_state(ctx, &handle)).await;
            Ok((StepValue::Object(object), diags))
        }
        OpCode::EphemeralClose => {
            let handle = next("an ephemeral handle")?
                .into_ephemeral()
                .map_err(|got| mismatch(0, "an ephemeral handle", got))?;
            let diags = with_permit(semaphore, ops.ephemeral_close(ctx, &handle)).await;
            Ok((StepValue::Unit, diags))
        }
    }
}

async fn with_permit<T>(semaphore: Option<&Semaphore>, operation: impl Future<Output = T>) -> T {
    let _permit = match semaphore {
        Some(semaphore) => semaphore.acquire().await.ok(),
        None => None,
    };
    operation.await
}

fn promise_failure(err: &PromiseError, summary: &str, shared: &StepShared) -> Diagnostics {
    let name = |id: &RequestId| {
        shared
            .summaries
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("request {}", id))
    };
    match err {
        PromiseError::SelfDependency { request_ids } => {
            let involved: Vec<String> = request_ids.iter().map(name).collect();
            Diagnostic::bug(
                "self-dependency between operations",
                format!(
                    "{} cannot run because it transitively depends on its own result. Involved operations: {}.",
                    summary,
                    involved.join(", ")
                ),
            )
            .into()
        }
        PromiseError::Unresolved { request_id } => Diagnostic::bug(
            "operation result abandoned",
            format!(
                "{} was waiting for {}, which terminated without producing a result.",
                summary,
                name(request_id)
            ),
        )
        .into(),
    }
}
