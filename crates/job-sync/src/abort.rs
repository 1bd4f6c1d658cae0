//! Keyed cancellation scopes.
//!
//! Registering work under a key cancels whatever was registered under that
//! key before. The registry is the only owner of the live tokens; tasks get an
//! [`AbortSignal`] they can observe but not trigger.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Read-only view of a cancellation scope handed to registered tasks.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the owning registry entry is superseded or aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A signal that never fires unless `cancel` on the returned token is
    /// called. Used by components driven outside a registry, mostly tests.
    pub fn detached() -> (CancellationToken, AbortSignal) {
        let token = CancellationToken::new();
        let signal = AbortSignal {
            token: token.child_token(),
        };
        (token, signal)
    }
}

struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct AbortRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` as the current holder of `key`, cancelling the previous holder.
    ///
    /// Returns `None` when the task was cancelled before it finished. The
    /// entry is only removed if no newer task has claimed the key meanwhile.
    pub async fn run<F, Fut, T>(&self, key: &str, task: F) -> Option<T>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = T>,
    {
        let (generation, token) = self.register(key);
        let _holder = Holder {
            registry: self.clone(),
            key: key.to_string(),
            generation,
        };
        let signal = AbortSignal {
            token: token.child_token(),
        };
        guarded(token, task(signal)).await
    }

    /// Same contract as [`run`](Self::run), but claims the key immediately and
    /// drives the task on the runtime.
    pub fn spawn<F, Fut, T>(&self, key: &str, task: F) -> JoinHandle<Option<T>>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (generation, token) = self.register(key);
        let signal = AbortSignal {
            token: token.child_token(),
        };
        let fut = task(signal);
        let holder = Holder {
            registry: self.clone(),
            key: key.to_string(),
            generation,
        };
        tokio::spawn(async move {
            let _holder = holder;
            guarded(token, fut).await
        })
    }

    /// Cancels and forgets the holder of `key`. Returns whether one existed.
    pub fn abort(&self, key: &str) -> bool {
        let removed = self.inner.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                debug!(target = "job_sync::abort", key, "aborted");
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        let drained: Vec<(String, Entry)> = self.inner.lock().entries.drain().collect();
        for (key, entry) in drained {
            entry.token.cancel();
            debug!(target = "job_sync::abort", key = %key, "aborted");
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, key: &str) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let previous = inner.entries.insert(
            key.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        drop(inner);
        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(
                target = "job_sync::abort",
                key,
                superseded = previous.generation,
                generation,
                "superseded previous holder"
            );
        }
        (generation, token)
    }

    fn release(&self, key: &str, generation: u64) {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get(key)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false);
        if current {
            inner.entries.remove(key);
            trace!(target = "job_sync::abort", key, generation, "released");
        }
    }
}

/// Gives the key back when the holder finishes, including when its future is
/// dropped before completing.
struct Holder {
    registry: AbortRegistry,
    key: String,
    generation: u64,
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.generation);
    }
}

async fn guarded<Fut, T>(token: CancellationToken, fut: Fut) -> Option<T>
where
    Fut: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        value = fut => Some(value),
    }
}
