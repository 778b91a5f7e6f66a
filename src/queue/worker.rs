//! Background worker that pulls due tasks from the store and runs them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::queue::handler::{HandlerRegistry, TaskError};
use crate::store::{RetryDisposition, Store, Task};

/// A single polling worker. Several may share one store; dequeue
/// atomicity keeps them from claiming the same task.
pub struct Worker {
    store: Arc<dyn Store>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            clock,
            wake,
            shutdown,
            poll_interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop: drain everything due, then sleep until woken by a new
    /// enqueue, the poll interval, or shutdown.
    pub async fn run(self) {
        info!(poll_interval = ?self.poll_interval, "Worker started");
        loop {
            self.drain().await;

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Worker shutting down");
                    return;
                }
                _ = self.wake.notified() => {
                    debug!("Worker woken by enqueue");
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Run every task that is due right now. Returns once the queue has
    /// no more eligible work. Checks for shutdown between tasks, never
    /// mid-task, so an in-flight task always reaches a terminal or
    /// pending state.
    pub async fn drain(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let task = match self.store.dequeue_next(self.clock.now()).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Dequeue failed");
                    return;
                }
            };

            self.run_task(task).await;
        }
    }

    async fn run_task(&self, task: Task) {
        let task_id = task.id;
        let task_type = task.task_type.clone();

        let Some(handler) = self.handlers.get(&task_type) else {
            // No handler can ever appear for this type at runtime, so
            // retrying would spin forever.
            warn!(task_id = %task_id, task_type = %task_type, "No handler registered");
            if let Err(e) = self
                .store
                .mark_failed(task_id, &format!("no handler registered for {task_type:?}"))
                .await
            {
                error!(task_id = %task_id, error = %e, "Failed to mark task failed");
            }
            return;
        };

        debug!(task_id = %task_id, task_type = %task_type, attempt = task.attempts + 1, "Running task");
        match handler.run(&task).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_succeeded(task_id).await {
                    error!(task_id = %task_id, error = %e, "Failed to mark task succeeded");
                } else {
                    debug!(task_id = %task_id, "Task succeeded");
                }
            }
            Err(TaskError::Recoverable(err)) => {
                let message = format!("{err:#}");
                match self.store.reschedule_for_retry(task_id, &message).await {
                    Ok(RetryDisposition::Rescheduled(at)) => {
                        warn!(task_id = %task_id, error = %message, retry_at = %at, "Task failed, will retry");
                    }
                    Ok(RetryDisposition::Exhausted) => {
                        error!(task_id = %task_id, error = %message, "Task failed, attempts exhausted");
                    }
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Failed to reschedule task");
                    }
                }
            }
            Err(TaskError::Fatal(err)) => {
                let message = format!("{err:#}");
                error!(task_id = %task_id, error = %message, "Task failed fatally");
                if let Err(e) = self.store.mark_failed(task_id, &message).await {
                    error!(task_id = %task_id, error = %e, "Failed to mark task failed");
                }
            }
        }
    }
}
