use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// Lets a caller block until a chosen set of items has each been marked
/// complete. Used on the planning side to coordinate partial completions;
/// the executor itself synchronizes through promises instead.
pub struct CompletionTracker<T> {
    inner: Mutex<TrackerInner<T>>,
}

struct TrackerInner<T> {
    complete: HashSet<T>,
    waiters: Vec<TrackerWaiter<T>>,
}

struct TrackerWaiter<T> {
    pending: HashSet<T>,
    tx: oneshot::Sender<()>,
}

impl<T: Eq + Hash + Clone> CompletionTracker<T> {
    pub fn new() -> Self {
        CompletionTracker {
            inner: Mutex::new(TrackerInner {
                complete: HashSet::new(),
                waiters: Vec::new(),
            }),
        }
    }

    /// Mark an item done. Idempotent. Every waiter whose pending set becomes
    /// empty fires and is removed.
    pub fn report_completion(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.complete.insert(item.clone()) {
            return;
        }
        let waiters = std::mem::take(&mut inner.waiters);
        for mut waiter in waiters {
            waiter.pending.remove(&item);
            if waiter.pending.is_empty() {
                let _ = waiter.tx.send(());
            } else {
                inner.waiters.push(waiter);
            }
        }
    }

    /// Register a one-shot signal that fires once every item in `items` is
    /// complete. Items already complete count immediately; an empty residual
    /// set fires the signal before this call returns.
    pub fn new_waiter_for(&self, items: impl IntoIterator<Item = T>) -> CompletionSignal {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        let pending: HashSet<T> = items
            .into_iter()
            .filter(|item| !inner.complete.contains(item))
            .collect();
        if pending.is_empty() {
            let _ = tx.send(());
        } else {
            inner.waiters.push(TrackerWaiter { pending, tx });
        }
        CompletionSignal { rx }
    }

    /// Union of all registered waiters' pending sets; reported when work
    /// appears to have leaked.
    pub fn pending_items(&self) -> HashSet<T> {
        let inner = self.inner.lock().unwrap();
        let mut union = HashSet::new();
        for waiter in &inner.waiters {
            union.extend(waiter.pending.iter().cloned());
        }
        union
    }
}

impl<T: Eq + Hash + Clone> Default for CompletionTracker<T> {
    fn default() -> Self {
        CompletionTracker::new()
    }
}

/// One-shot completion signal returned by
/// [`CompletionTracker::new_waiter_for`].
pub struct CompletionSignal {
    rx: oneshot::Receiver<()>,
}

impl CompletionSignal {
    /// Wait until the tracked set is complete. Also returns if the tracker
    /// itself is dropped, so callers can never hang on abandoned trackers.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }

    /// Non-blocking probe, mostly for tests.
    pub fn is_complete(&mut self) -> bool {
        !matches!(
            self.rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}
