//! Bounded task queue
//!
//! Fixed-concurrency scheduler every background generation goes through.
//! Tasks start in submission order; at most `max_concurrent` run at once.
//! A task that fails or panics only affects its own handle.

use crate::concurrency::ConcurrencyPlan;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::trace;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Error type for queued task results
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The dispatcher is gone; the task was never queued
    #[error("Task queue is shut down")]
    Closed,

    /// The task was dropped or panicked before producing a result
    #[error("Queued task aborted before producing a result")]
    Aborted,
}

/// Eventual result of a submitted task
///
/// The task is queued when [`TaskQueue::submit`] returns, whether or not the
/// handle is ever awaited.
#[must_use = "dropping the handle discards the task's result"]
pub struct TaskHandle<T> {
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.as_mut() {
            None => Poll::Ready(Err(QueueError::Closed)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| QueueError::Aborted)),
        }
    }
}

/// Fixed-concurrency FIFO scheduler
///
/// Must be created inside a tokio runtime; the dispatcher runs as a task and
/// exits once the queue is dropped and the backlog has drained.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<BoxedTask>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    pending: Arc<AtomicUsize>,
}

impl TaskQueue {
    /// Create a queue running at most `max_concurrent` tasks (0 is coerced to 1)
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let pending = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch(rx, semaphore.clone(), pending.clone()));

        Self {
            tx,
            semaphore,
            max_concurrent,
            pending,
        }
    }

    /// Create a queue sized by a concurrency plan
    pub fn from_plan(plan: &ConcurrencyPlan) -> Self {
        Self::new(plan.max_concurrent_tasks as usize)
    }

    /// Queue a task and return a handle to its eventual result
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: BoxedTask = Box::pin(async move {
            // Receiver may be gone; the task still ran to completion
            let _ = result_tx.send(task.await);
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(wrapped).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return TaskHandle { rx: None };
        }

        TaskHandle {
            rx: Some(result_rx),
        }
    }

    /// Configured concurrency limit
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Tasks currently executing
    pub fn running(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Tasks submitted but not yet started
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Get the number of free execution slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<BoxedTask>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(task) = rx.recv().await {
        // Waiting here, not in the spawned task, is what keeps start order FIFO
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        trace!("dispatching queued task");

        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
    }
}
