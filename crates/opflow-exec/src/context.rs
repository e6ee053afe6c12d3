use tokio_util::sync::CancellationToken;

/// Cancellable execution context threaded through every operation call and
/// promise await. Wraps a [`CancellationToken`] so the surrounding tooling
/// can wire the engine into whatever signal handling it already has.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        ExecContext::default()
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        ExecContext { cancel }
    }

    /// Derive a context that is cancelled when this one is, but can also be
    /// cancelled independently.
    pub fn child(&self) -> ExecContext {
        ExecContext {
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Suspend until cancellation. Safe to race in `select!` arms.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
