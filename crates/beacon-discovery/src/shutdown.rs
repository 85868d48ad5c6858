//! Shutdown registry
//!
//! Collects teardown actions and runs them exactly once at orderly process
//! termination, in reverse registration order. The client factory
//! registers one action per handle; the host process decides when
//! `execute` runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

type TeardownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TeardownAction = Box<dyn FnOnce() -> TeardownFuture + Send>;

/// A registry of async teardown actions.
#[derive(Clone)]
pub struct ShutdownRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    actions: Mutex<Vec<TeardownAction>>,
    executed: AtomicBool,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        ShutdownRegistry {
            inner: Arc::new(Inner {
                actions: Mutex::new(Vec::new()),
                executed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a teardown action. Actions registered after `execute` has
    /// run are dropped with a warning.
    pub fn register<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.executed.load(Ordering::SeqCst) {
            warn!("shutdown already executed, dropping late teardown action");
            return;
        }
        self.inner
            .actions
            .lock()
            .push(Box::new(move || Box::pin(action())));
    }

    /// Run all registered actions once, most recently registered first.
    /// Subsequent calls are no-ops.
    pub async fn execute(&self) {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return;
        }
        let actions = std::mem::take(&mut *self.inner.actions.lock());
        debug!("executing {} shutdown actions", actions.len());
        for action in actions.into_iter().rev() {
            action().await;
        }
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_actions_run_once_in_reverse_order() {
        let registry = ShutdownRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            registry.register(move || async move {
                order.lock().push(i);
            });
        }

        registry.execute().await;
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(registry.is_executed());

        // second execute is a no-op
        registry.execute().await;
        assert_eq!(order.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_late_registration_dropped() {
        let registry = ShutdownRegistry::new();
        registry.execute().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_action = ran.clone();
        registry.register(move || async move {
            ran_in_action.fetch_add(1, Ordering::SeqCst);
        });

        registry.execute().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
