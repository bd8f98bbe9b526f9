//! Detached task execution.
//!
//! Verification and delivery run in the background, detached from the request
//! that caused them. They are still spawned through [`TaskExecutor`] so that
//! tests and shutdown can observe completion: each spawn yields a
//! [`TaskHandle`], and [`TaskExecutor::wait_idle`] resolves once nothing is in
//! flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {task_id} ({kind}) panicked")]
    Panicked { task_id: Uuid, kind: &'static str },
    #[error("task {task_id} ({kind}) was cancelled")]
    Cancelled { task_id: Uuid, kind: &'static str },
}

#[derive(Clone, Default)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

#[derive(Default)]
struct ExecutorInner {
    in_flight: AtomicUsize,
    spawned_total: AtomicU64,
    idle: Notify,
}

struct InFlightGuard {
    inner: Arc<ExecutorInner>,
}

impl InFlightGuard {
    fn enter(inner: Arc<ExecutorInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        inner.spawned_total.fetch_add(1, Ordering::Relaxed);
        Self { inner }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Completion signal for one detached task. Dropping it does not cancel the task.
pub struct TaskHandle<T> {
    task_id: Uuid,
    kind: &'static str,
    join: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> Uuid {
        self.task_id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn wait(self) -> Result<T, TaskError> {
        let Self {
            task_id,
            kind,
            join,
        } = self;
        join.await.map_err(|error| {
            if error.is_panic() {
                TaskError::Panicked { task_id, kind }
            } else {
                TaskError::Cancelled { task_id, kind }
            }
        })
    }
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, kind: &'static str, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = InFlightGuard::enter(Arc::clone(&self.inner));
        let task_id = Uuid::now_v7();
        let span = tracing::debug_span!("hub_task", %task_id, kind);
        let join = tokio::spawn(
            async move {
                let _guard = guard;
                future.await
            }
            .instrument(span),
        );
        TaskHandle {
            task_id,
            kind,
            join,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn spawned_total(&self) -> u64 {
        self.inner.spawned_total.load(Ordering::Relaxed)
    }

    /// Resolves once no spawned task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
