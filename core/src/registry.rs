//! Bookkeeping for in-flight calls.
//!
//! # Design
//! Each call registers a `CancellationToken` under an id and an optional
//! logical context and receives a `TaskGuard`. The guard unregisters on drop,
//! so cleanup follows scope exit instead of matching register/unregister calls.
//!
//! Every registration carries a generation number. Removal is keyed on
//! `(id, generation)`, which keeps it exactly-once when a task completes,
//! is cancelled, and is superseded in any order: a late drop of a superseded
//! guard never removes its successor.
//!
//! The registry never interrupts execution. Cancelling only fires the token
//! and forgets the entry; the transport observes the token and aborts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;

#[derive(Debug)]
struct PendingTask {
    generation: u64,
    context: Option<String>,
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

pub struct RequestRegistry {
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<String, PendingTask>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl RequestRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, PendingTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `token` under `id`. A task already holding `id` is cancelled
    /// first; the newest registration wins.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        context: Option<String>,
        token: CancellationToken,
    ) -> TaskGuard {
        let id = id.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = PendingTask {
            generation,
            context,
            token: token.clone(),
            started_at: self.clock.now(),
        };

        let superseded = self.tasks().insert(id.clone(), task);
        if let Some(previous) = superseded {
            debug!(request_id = %id, "superseding in-flight request");
            previous.token.cancel();
        }

        TaskGuard {
            registry: Arc::clone(self),
            id,
            generation,
            token,
        }
    }

    /// Cancel the task registered under `id`. Returns whether one existed.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.tasks().remove(id);
        match removed {
            Some(task) => {
                debug!(request_id = %id, "cancelling request");
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task registered under `context`.
    pub fn cancel_by_context(&self, context: &str) -> usize {
        let removed = self.drain_where(|task| task.context.as_deref() == Some(context));
        if !removed.is_empty() {
            debug!(context, count = removed.len(), "cancelling requests by context");
        }
        cancel_each(removed)
    }

    pub fn cancel_all(&self) -> usize {
        let removed: Vec<_> = self.tasks().drain().collect();
        cancel_each(removed)
    }

    /// Cancel and forget tasks older than `max_age`. A backstop for
    /// registrations whose completion never arrived, not a request timeout.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let removed = self.drain_where(|task| now - task.started_at > max_age);
        for (id, _) in &removed {
            warn!(request_id = %id, "sweeping stale request registration");
        }
        cancel_each(removed)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain_where(&self, mut pred: impl FnMut(&PendingTask) -> bool) -> Vec<(String, PendingTask)> {
        let mut tasks = self.tasks();
        let ids: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| pred(task))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| tasks.remove(&id).map(|task| (id, task)))
            .collect()
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.tasks()
            .get(id)
            .is_some_and(|task| task.generation == generation)
    }

    fn unregister(&self, id: &str, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(id).is_some_and(|task| task.generation == generation) {
            tasks.remove(id);
        }
    }
}

fn cancel_each(removed: Vec<(String, PendingTask)>) -> usize {
    let count = removed.len();
    for (_, task) in removed {
        task.token.cancel();
    }
    count
}

/// Registration handle for one call, held until the call returns. Unregisters on drop.
pub struct TaskGuard {
    registry: Arc<RequestRegistry>,
    id: String,
    generation: u64,
    token: CancellationToken,
}

impl TaskGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this call may still touch caller-visible state: not
    /// cancelled, and not superseded or swept from the registry.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.registry.is_current(&self.id, self.generation)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id, self.generation);
    }
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
