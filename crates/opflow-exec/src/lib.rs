mod compile;
mod context;
mod contract;
mod execute;
mod objects;

pub use compile::{compile, CompiledGraph};
pub use context::ExecContext;
pub use contract::Operations;
pub use execute::ExecOptions;
pub use objects::{
    DesiredResourceInstance, EphemeralHandle, FinalPlan, ObjectStatus, ProviderClient,
    ProviderConfig, ResourceObject,
};
