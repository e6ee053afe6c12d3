mod promise;
mod tracker;

pub use promise::{Promise, PromiseError, PromiseRuntime, RequestId, Resolver, Worker, WorkerId};
pub use tracker::{CompletionSignal, CompletionTracker};
