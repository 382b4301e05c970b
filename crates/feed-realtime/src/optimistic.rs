//! Optimistic local mutations with snapshot rollback.
//!
//! A mutation is applied to the store synchronously and its request runs in
//! the background. If the request fails the entity is set back to the exact
//! value it had before this mutation, even when a later mutation of the same
//! entity has landed in between. Overlapping mutations are not serialized.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use feed_api::ApiResult;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::MutationError;

const FAILURE_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEntry<V> {
    pub value: V,
    /// Requests issued for this entity that have not completed yet.
    pub pending: usize,
}

/// Background request of one optimistic mutation.
pub struct PendingRequest {
    entity: String,
    task: JoinHandle<Result<(), MutationError>>,
}

impl PendingRequest {
    pub async fn wait(self) -> Result<(), MutationError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(MutationError {
                entity: self.entity,
                reason: format!("request task ended early: {err}"),
                unauthorized: false,
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ControllerInner<K, V> {
    entries: watch::Sender<HashMap<K, MutationEntry<V>>>,
    failures: broadcast::Sender<MutationError>,
    /// Held across every write to `entries` so an apply's read and write
    /// see no other write in between.
    writer: Mutex<()>,
}

pub struct OptimisticMutationController<K, V> {
    inner: Arc<ControllerInner<K, V>>,
}

impl<K, V> Clone for OptimisticMutationController<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for OptimisticMutationController<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OptimisticMutationController<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (entries, _) = watch::channel(HashMap::new());
        let (failures, _) = broadcast::channel(FAILURE_BUFFER);
        Self {
            inner: Arc::new(ControllerInner {
                entries,
                failures,
                writer: Mutex::new(()),
            }),
        }
    }

    /// Applies `mutation` to the current value (default when unknown) and
    /// spawns the request it returns. Must be called from within a Tokio
    /// runtime, and `mutation` must not call back into the controller.
    pub fn apply_optimistic<F, Fut>(&self, entity: K, mutation: F) -> PendingRequest
    where
        F: FnOnce(&V) -> (V, Fut),
        Fut: Future<Output = ApiResult<()>> + Send + 'static,
    {
        let (snapshot, request) = {
            let _writer = self.inner.writer.lock();
            let snapshot = self
                .inner
                .entries
                .borrow()
                .get(&entity)
                .map(|entry| entry.value.clone())
                .unwrap_or_default();
            let (next, request) = mutation(&snapshot);
            self.inner.entries.send_modify(|entries| {
                let entry = entries.entry(entity.clone()).or_insert_with(|| MutationEntry {
                    value: V::default(),
                    pending: 0,
                });
                entry.value = next;
                entry.pending += 1;
            });
            (snapshot, request)
        };

        let label = entity.to_string();
        debug!(target: "realtime.mutation", entity = %label, "optimistic value applied");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = request.await;
            let rollback = result.as_ref().err().map(|_| snapshot);
            {
                let _writer = inner.writer.lock();
                inner.entries.send_modify(|entries| {
                    if let Some(entry) = entries.get_mut(&entity) {
                        entry.pending = entry.pending.saturating_sub(1);
                        if let Some(snapshot) = rollback {
                            entry.value = snapshot;
                        }
                    }
                });
            }
            match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    let failure = MutationError::from_api(entity.to_string(), &err);
                    warn!(
                        target: "realtime.mutation",
                        entity = %entity,
                        error = %err,
                        "request failed; restored previous value"
                    );
                    let _ = inner.failures.send(failure.clone());
                    Err(failure)
                }
            }
        });
        PendingRequest {
            entity: label,
            task,
        }
    }

    pub fn get(&self, entity: &K) -> Option<MutationEntry<V>> {
        self.inner.entries.borrow().get(entity).cloned()
    }

    /// Stores an authoritative value. Skipped (returns false) while requests
    /// for the entity are still pending.
    pub fn set(&self, entity: K, value: V) -> bool {
        let _writer = self.inner.writer.lock();
        self.inner.entries.send_if_modified(|entries| {
            let entry = entries.entry(entity).or_insert_with(|| MutationEntry {
                value: V::default(),
                pending: 0,
            });
            if entry.pending > 0 {
                return false;
            }
            entry.value = value;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<HashMap<K, MutationEntry<V>>> {
        self.inner.entries.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<MutationError> {
        self.inner.failures.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_api::ApiError;
    use tokio::sync::oneshot;

    type Controller = OptimisticMutationController<String, i64>;

    fn gated() -> (oneshot::Sender<ApiResult<()>>, impl Future<Output = ApiResult<()>> + Send) {
        let (tx, rx) = oneshot::channel();
        let request = async move {
            rx.await
                .unwrap_or_else(|_| Err(ApiError::Unavailable("gate dropped".into())))
        };
        (tx, request)
    }

    #[tokio::test]
    async fn success_keeps_the_optimistic_value() {
        let controller = Controller::new();
        let (tx, request) = gated();
        let pending = controller.apply_optimistic("a".to_string(), |v| (v + 5, request));

        let entry = controller.get(&"a".to_string()).expect("entry");
        assert_eq!(entry, MutationEntry { value: 5, pending: 1 });

        tx.send(Ok(())).expect("gate");
        pending.wait().await.expect("request");
        let entry = controller.get(&"a".to_string()).expect("entry");
        assert_eq!(entry, MutationEntry { value: 5, pending: 0 });
    }

    #[tokio::test]
    async fn applies_from_many_threads_never_lose_an_update() {
        let controller = Controller::new();
        let runtime = tokio::runtime::Handle::current();
        let requests: Vec<PendingRequest> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let controller = controller.clone();
                    let runtime = runtime.clone();
                    scope.spawn(move || {
                        let _entered = runtime.enter();
                        (0..50)
                            .map(|_| {
                                controller
                                    .apply_optimistic("a".to_string(), |v| (v + 1, async { Ok(()) }))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().expect("worker"))
                .collect()
        });
        for request in requests {
            request.wait().await.expect("request");
        }
        let entry = controller.get(&"a".to_string()).expect("entry");
        assert_eq!(entry, MutationEntry { value: 200, pending: 0 });
    }

    #[tokio::test]
    async fn failure_restores_the_literal_snapshot() {
        let controller = Controller::new();
        controller.set("a".to_string(), 10);
        let mut failures = controller.subscribe_failures();

        let (first_tx, first) = gated();
        let first_pending = controller.apply_optimistic("a".to_string(), |v| (v + 1, first));
        let (second_tx, second) = gated();
        let second_pending = controller.apply_optimistic("a".to_string(), |v| (v * 2, second));
        assert_eq!(controller.get(&"a".to_string()).map(|e| e.value), Some(22));

        second_tx.send(Ok(())).expect("gate");
        second_pending.wait().await.expect("second");
        first_tx
            .send(Err(ApiError::Unavailable("boom".into())))
            .expect("gate");
        let err = first_pending.wait().await.expect_err("first fails");
        assert_eq!(err.entity, "a");

        // The first snapshot wins, clobbering the second mutation.
        let entry = controller.get(&"a".to_string()).expect("entry");
        assert_eq!(entry, MutationEntry { value: 10, pending: 0 });
        assert_eq!(failures.recv().await.expect("failure").entity, "a");
    }

    #[tokio::test]
    async fn authoritative_values_wait_for_pending_requests() {
        let controller = Controller::new();
        let (tx, request) = gated();
        let pending = controller.apply_optimistic("a".to_string(), |v| (v + 1, request));
        assert!(!controller.set("a".to_string(), 40));
        tx.send(Ok(())).expect("gate");
        pending.wait().await.expect("request");
        assert!(controller.set("a".to_string(), 40));
        assert_eq!(controller.get(&"a".to_string()).map(|e| e.value), Some(40));
    }

    #[tokio::test]
    async fn observers_see_every_change() {
        let controller = Controller::new();
        let mut changes = controller.subscribe();
        let (tx, request) = gated();
        let pending = controller.apply_optimistic("a".to_string(), |v| (v - 1, request));
        changes.changed().await.expect("changed");
        assert_eq!(changes.borrow_and_update().get("a").map(|e| e.pending), Some(1));
        tx.send(Err(ApiError::Unauthorized { body: "expired".into() }))
            .expect("gate");
        let err = pending.wait().await.expect_err("fails");
        assert!(err.unauthorized);
        changes.changed().await.expect("changed");
        assert_eq!(changes.borrow().get("a").map(|e| e.value), Some(0));
    }
}
