mod action;
mod addrs;
mod diag;
mod error;
mod value;

pub use action::{combine, combine_all, ChangeAction};
pub use addrs::{
    DeposedKey, InstanceKey, ModuleInstanceStep, ProviderInstanceAddr, ResourceInstanceAddr,
    ResourceMode,
};
pub use diag::{Diagnostic, Diagnostics, Severity, SourcePos, SourceRange};
pub use error::AddrError;
pub use value::DynValue;
