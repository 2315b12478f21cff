//! Instrumentation for long-running tasks (service loops, the diagnostic
//! endpoint). Every live task is listed on `/threadz`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use prometheus::IntCounter;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: u64,
    pub category: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

pub struct ThreadRegistry {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, TaskInfo>>,
    created: IntCounter,
}

impl ThreadRegistry {
    pub fn new(metrics: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(BTreeMap::new()),
            created: metrics.counter(
                "thread-manager.total-threads-created",
                "Instrumented tasks started since process start",
            )?,
        })
    }

    /// Record a task as live until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, category: &str, name: &str) -> TaskGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = TaskInfo {
            id,
            category: category.to_string(),
            name: name.to_string(),
            started_at: Utc::now(),
        };
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);
        self.created.inc();

        TaskGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Spawn `fut` on the runtime, listed under `category/name` while it runs.
    pub fn spawn<F>(self: &Arc<Self>, category: &str, name: &str, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.register(category, name);
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Unregisters its task on drop.
pub struct TaskGuard {
    registry: Arc<ThreadRegistry>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
