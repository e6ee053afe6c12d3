use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use opflow_domain::{ChangeAction, DynValue, ProviderInstanceAddr, ResourceInstanceAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Ready,
    Tainted,
}

/// One remote object as tracked in state: its value plus whether its last
/// apply completed cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub value: DynValue,
    pub status: ObjectStatus,
}

impl ResourceObject {
    pub fn ready(value: DynValue) -> Self {
        ResourceObject {
            value,
            status: ObjectStatus::Ready,
        }
    }

    pub fn tainted(value: DynValue) -> Self {
        ResourceObject {
            value,
            status: ObjectStatus::Tainted,
        }
    }
}

/// The evaluator's answer for what a resource instance is configured to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResourceInstance {
    pub addr: ResourceInstanceAddr,
    pub config: DynValue,
}

/// Resolved configuration for one provider instance. A `Null` value means the
/// instance is not declared in configuration; opening it is still legal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub addr: ProviderInstanceAddr,
    pub value: DynValue,
}

/// Provider-confirmed, apply-ready description of a single change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPlan {
    pub addr: ResourceInstanceAddr,
    pub action: ChangeAction,
    pub planned_value: DynValue,
}

/// Handle to a launched provider plugin. Opaque to the engine: it is created
/// by the [`Operations`](crate::Operations) implementation, threaded through
/// operands, and handed back for the calls that need it. Shared freely across
/// concurrent steps, so implementations must be `Sync` or serialize
/// internally.
#[derive(Clone)]
pub struct ProviderClient(Arc<dyn Any + Send + Sync>);

impl ProviderClient {
    pub fn new<T: Send + Sync + 'static>(client: T) -> Self {
        ProviderClient(Arc::new(client))
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast().ok()
    }
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderClient(..)")
    }
}

/// Handle to an open ephemeral resource, opaque like [`ProviderClient`].
#[derive(Clone)]
pub struct EphemeralHandle(Arc<dyn Any + Send + Sync>);

impl EphemeralHandle {
    pub fn new<T: Send + Sync + 'static>(handle: T) -> Self {
        EphemeralHandle(Arc::new(handle))
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast().ok()
    }
}

impl fmt::Debug for EphemeralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralHandle(..)")
    }
}
