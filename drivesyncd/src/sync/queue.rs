use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum QueueError<E> {
    #[error("transfer failed: {0}")]
    Item(E),
    #[error("transfer worker panicked: {0}")]
    Panicked(String),
    #[error("transfer queue is stopped")]
    Stopped,
}

enum Message<T> {
    Item(T),
    Stop,
}

struct Shared<T, E> {
    receiver: Mutex<mpsc::UnboundedReceiver<Message<T>>>,
    pending: AtomicUsize,
    idle: Notify,
    failed: AtomicBool,
    failure: std::sync::Mutex<Option<QueueError<E>>>,
}

impl<T, E: Display> Shared<T, E> {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn fail(&self, err: QueueError<E>) {
        let mut slot = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            error!(error = %err, "transfer queue item failed, discarding remaining work");
            *slot = Some(err);
        } else {
            debug!(error = %err, "additional transfer failure ignored");
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Option<QueueError<E>> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Fixed pool of tokio workers draining an unbounded channel.
///
/// The first failing item (error or panic) poisons the run: later items are
/// dequeued and dropped without processing, and [`wait`](Self::wait) hands
/// the failure back after shutting the workers down.
pub struct TransferQueue<T, E> {
    sender: mpsc::UnboundedSender<Message<T>>,
    shared: Arc<Shared<T, E>>,
    workers: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl<T, E> TransferQueue<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    pub fn start<F, Fut>(worker_fn: F, workers: usize) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            failed: AtomicBool::new(false),
            failure: std::sync::Mutex::new(None),
        });
        let worker_fn = Arc::new(worker_fn);
        let workers = (0..workers.max(1))
            .map(|index| tokio::spawn(run_worker(index, shared.clone(), worker_fn.clone())))
            .collect();
        Self {
            sender,
            shared,
            workers,
            stopped: false,
        }
    }

    pub fn put(&self, item: T) -> Result<(), QueueError<E>> {
        if self.stopped {
            return Err(QueueError::Stopped);
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Message::Item(item)).is_err() {
            self.shared.finish_one();
            return Err(QueueError::Stopped);
        }
        Ok(())
    }

    /// Waits until every item put so far has finished processing. With
    /// `stop`, or after a failure, the workers are then shut down and joined.
    pub async fn wait(&mut self, stop: bool) -> Result<(), QueueError<E>> {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let failure = self.shared.take_failure();
        if stop || failure.is_some() {
            self.shutdown().await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(Message::Stop);
        }
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "transfer worker terminated abnormally");
            }
        }
    }
}

async fn run_worker<T, E, F, Fut>(index: usize, shared: Arc<Shared<T, E>>, worker_fn: Arc<F>)
where
    E: Display,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    loop {
        let message = shared.receiver.lock().await.recv().await;
        let item = match message {
            Some(Message::Item(item)) => item,
            Some(Message::Stop) | None => break,
        };

        if shared.failed.load(Ordering::SeqCst) {
            debug!(worker = index, "discarding queued item after failure");
        } else {
            let outcome = AssertUnwindSafe(async { worker_fn(item).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => shared.fail(QueueError::Item(err)),
                Err(payload) => shared.fail(QueueError::Panicked(panic_message(payload))),
            }
        }
        shared.finish_one();
    }
    debug!(worker = index, "transfer worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
