use async_trait::async_trait;

use opflow_domain::{DeposedKey, Diagnostics, DynValue, ProviderInstanceAddr, ResourceInstanceAddr};

use crate::context::ExecContext;
use crate::objects::{
    DesiredResourceInstance, EphemeralHandle, FinalPlan, ProviderClient, ProviderConfig,
    ResourceObject,
};

/// Everything the engine needs from its collaborators (the evaluator, the
/// state tracker, and the provider plugins), expressed as one method per
/// opcode. This is the primary seam between the engine and the rest of the
/// tool.
///
/// Methods may block for as long as they need; the executor runs every step
/// on its own task. Any method may report failure through its diagnostics,
/// which resolves the step's promise with "cannot continue" and unwinds the
/// dependents. Implementations must not carry results between calls behind
/// the engine's back: everything a later operation needs arrives explicitly
/// through its operands.
///
/// `resource_instance_postconditions` is invoked by the executor after each
/// resource-producing operation; implementations must never call it from
/// their other methods.
#[async_trait]
pub trait Operations: Send + Sync + 'static {
    /// Resolve the configuration for a provider instance. When the instance
    /// is not declared, return a config with a null value rather than
    /// failing.
    async fn provider_instance_config(
        &self,
        ctx: &ExecContext,
        addr: &ProviderInstanceAddr,
    ) -> (Option<ProviderConfig>, Diagnostics);

    /// Launch and configure a provider plugin.
    async fn provider_instance_open(
        &self,
        ctx: &ExecContext,
        config: &ProviderConfig,
    ) -> (Option<ProviderClient>, Diagnostics);

    /// Shut a plugin down once every user has finished with it. Runs even
    /// when upstream operations failed or the run was cancelled.
    async fn provider_instance_close(
        &self,
        ctx: &ExecContext,
        client: &ProviderClient,
    ) -> Diagnostics;

    /// Obtain the desired state for a resource instance from the evaluator.
    async fn resource_instance_desired(
        &self,
        ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
    ) -> (Option<DesiredResourceInstance>, Diagnostics);

    /// Obtain the prior-state snapshot for a resource instance.
    async fn resource_instance_prior(
        &self,
        ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Have the provider confirm the final plan for one managed object.
    async fn managed_final_plan(
        &self,
        ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        prior: Option<&ResourceObject>,
        planned: &DynValue,
        client: &ProviderClient,
    ) -> (Option<FinalPlan>, Diagnostics);

    /// Apply the planned change and return the resulting object.
    async fn managed_apply(
        &self,
        ctx: &ExecContext,
        plan: Option<&FinalPlan>,
        fallback: Option<&ResourceObject>,
        client: &ProviderClient,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Promote the current object to deposed ahead of a replacement.
    async fn managed_depose(
        &self,
        ctx: &ExecContext,
        prior: Option<&ResourceObject>,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Look up a deposed object that already existed before this run.
    async fn managed_already_deposed(
        &self,
        ctx: &ExecContext,
        addr: &ResourceInstanceAddr,
        key: &DeposedKey,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Rebind an object to a new address atomically.
    async fn managed_change_addr(
        &self,
        ctx: &ExecContext,
        current: Option<&ResourceObject>,
        new_addr: &ResourceInstanceAddr,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Read a data source.
    async fn data_read(
        &self,
        ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        planned: &DynValue,
        client: &ProviderClient,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Open an ephemeral resource for the duration of the run.
    async fn ephemeral_open(
        &self,
        ctx: &ExecContext,
        desired: Option<&DesiredResourceInstance>,
        client: &ProviderClient,
    ) -> (Option<EphemeralHandle>, Diagnostics);

    /// Derive the object value from an open ephemeral.
    async fn ephemeral_state(
        &self,
        ctx: &ExecContext,
        handle: &EphemeralHandle,
    ) -> (Option<ResourceObject>, Diagnostics);

    /// Close an ephemeral once every user has finished with it. Runs even
    /// when upstream operations failed or the run was cancelled.
    async fn ephemeral_close(&self, ctx: &ExecContext, handle: &EphemeralHandle) -> Diagnostics;

    /// Check user-declared postconditions against a freshly-produced object.
    /// Called only by the executor, after `managed_apply`, `data_read`, and
    /// `ephemeral_state` results.
    async fn resource_instance_postconditions(
        &self,
        ctx: &ExecContext,
        addr: Option<&ResourceInstanceAddr>,
        object: &ResourceObject,
    ) -> Diagnostics;
}
