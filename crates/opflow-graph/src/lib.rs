mod builder;
mod dot;
mod graph;
mod marshal;
mod ops;
mod refs;

pub use builder::{CloseBlocker, GraphBuilder};
pub use graph::Graph;
pub use marshal::MarshalError;
pub use ops::{OpCode, Operation};
pub use refs::{kind, RawRef, Ref, RefKind, ResultType};
