//! Serial executor that owns the client state.
//!
//! Every operation that touches sync state is a closure receiving `&mut S`.
//! Closures run one at a time in FIFO order, either on a detached worker task
//! ([`AsyncQueue::new_live`]) or on demand from a [`ManualDriver`]
//! ([`AsyncQueue::manual`]), which tests use to step the engine and fire
//! timers without waiting on a clock.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;
use crate::util::{BackoffSettings, ExponentialBackoff};

pub type QueueOp<S> = Box<dyn FnOnce(&mut S) + Send>;
type RetryableOp<S> = Box<dyn FnMut(&mut S) -> FirestoreResult<()> + Send>;

const TERMINATED_MESSAGE: &str = "The client has already been terminated.";

/// Identifies a kind of delayed operation so that tests can fire it early.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    AsyncQueueRetry,
    StorageProbe,
}

/// Handle to a scheduled operation.
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not run yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct DelayedEntry<S> {
    id: u64,
    timer_id: TimerId,
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    // Only populated in manual mode; live entries own their op in a sleeper task.
    op: Option<QueueOp<S>>,
}

struct RetryQueue<S> {
    ops: VecDeque<RetryableOp<S>>,
    backoff: ExponentialBackoff,
    scheduled: bool,
}

enum Mode<S> {
    Live,
    Manual(Mutex<Vec<BoxFuture<'static, QueueOp<S>>>>),
}

struct Shared<S> {
    sender: Sender<QueueOp<S>>,
    receiver: Receiver<QueueOp<S>>,
    terminated: AtomicBool,
    next_delayed_id: AtomicU64,
    delayed: Mutex<Vec<DelayedEntry<S>>>,
    retry: Mutex<RetryQueue<S>>,
    mode: Mode<S>,
}

pub struct AsyncQueue<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Starts the worker of a live queue once the state exists.
pub struct QueueRunner<S> {
    receiver: Receiver<QueueOp<S>>,
}

impl<S: Send + 'static> QueueRunner<S> {
    pub fn spawn(self, mut state: S) {
        let receiver = self.receiver;
        runtime::spawn_detached(async move {
            while let Ok(op) = receiver.recv().await {
                op(&mut state);
            }
            log::debug!(target: "firestore::async_queue", "queue worker stopped");
        });
    }
}

/// Runs queued work on the caller's thread.
pub struct ManualDriver<S> {
    queue: AsyncQueue<S>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: Send + 'static> AsyncQueue<S> {
    pub fn new_live(retry: BackoffSettings) -> (Self, QueueRunner<S>) {
        let queue = Self::with_mode(Mode::Live, retry);
        let runner = QueueRunner {
            receiver: queue.shared.receiver.clone(),
        };
        (queue, runner)
    }

    pub fn manual(retry: BackoffSettings) -> (Self, ManualDriver<S>) {
        let queue = Self::with_mode(Mode::Manual(Mutex::new(Vec::new())), retry);
        let driver = ManualDriver {
            queue: queue.clone(),
        };
        (queue, driver)
    }

    fn with_mode(mode: Mode<S>, retry: BackoffSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver,
                terminated: AtomicBool::new(false),
                next_delayed_id: AtomicU64::new(0),
                delayed: Mutex::new(Vec::new()),
                retry: Mutex::new(RetryQueue {
                    ops: VecDeque::new(),
                    backoff: ExponentialBackoff::new(retry),
                    scheduled: false,
                }),
                mode,
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    fn submit(&self, op: QueueOp<S>) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(cancelled(TERMINATED_MESSAGE));
        }
        self.shared
            .sender
            .try_send(op)
            .map_err(|_| cancelled(TERMINATED_MESSAGE))
    }

    /// Queues `op` and resolves with its result once it has run.
    pub fn enqueue<R, F>(&self, op: F) -> impl Future<Output = FirestoreResult<R>> + Send + 'static
    where
        F: FnOnce(&mut S) -> FirestoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (deferred, pending) = deferred();
        let submitted = self.submit(Box::new(move |state: &mut S| deferred.settle(op(state))));
        async move {
            submitted?;
            pending.wait().await
        }
    }

    /// Queues `op` without waiting for it. Dropped silently after termination.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.submit(Box::new(op)).is_err() {
            log::debug!(target: "firestore::async_queue", "dropping operation after termination");
        }
    }

    /// Marks the queue terminated, then queues `op` as the final operation.
    /// Operations queued earlier still run before it.
    pub fn enqueue_and_initiate_shutdown<F>(&self, op: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in lock(&self.shared.delayed).drain(..) {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
        lock(&self.shared.retry).ops.clear();
        if self.shared.sender.try_send(Box::new(op)).is_err() {
            log::debug!(target: "firestore::async_queue", "shutdown operation could not be queued");
        }
        self.shared.sender.close();
    }

    /// Runs `op` on the queue after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(self.is_terminated()));
        let handle = DelayedOperation {
            timer_id,
            cancelled: Arc::clone(&cancelled),
        };
        if self.is_terminated() {
            return handle;
        }

        let id = self.shared.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let op: QueueOp<S> = Box::new(op);
        match &self.shared.mode {
            Mode::Live => {
                lock(&self.shared.delayed).push(DelayedEntry {
                    id,
                    timer_id,
                    delay,
                    cancelled: Arc::clone(&cancelled),
                    op: None,
                });
                let queue = self.clone();
                runtime::spawn_detached(async move {
                    runtime::sleep(delay).await;
                    queue.remove_delayed(id);
                    if !cancelled.load(Ordering::SeqCst) {
                        queue.enqueue_and_forget(op);
                    }
                });
            }
            Mode::Manual(_) => {
                lock(&self.shared.delayed).push(DelayedEntry {
                    id,
                    timer_id,
                    delay,
                    cancelled,
                    op: Some(op),
                });
            }
        }
        handle
    }

    /// Awaits `future` off the queue, then runs `continuation` on it with the
    /// output.
    pub fn spawn_and_enqueue<T, Fut, F>(&self, future: Fut, continuation: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(&mut S, T) + Send + 'static,
    {
        if self.is_terminated() {
            return;
        }
        let wrapped = async move {
            let value = future.await;
            let op: QueueOp<S> = Box::new(move |state: &mut S| continuation(state, value));
            op
        };
        match &self.shared.mode {
            Mode::Live => {
                let queue = self.clone();
                runtime::spawn_detached(async move {
                    let op = wrapped.await;
                    queue.enqueue_and_forget(op);
                });
            }
            Mode::Manual(pending) => lock(pending).push(wrapped.boxed()),
        }
    }

    /// Queues an operation that is retried with backoff for as long as it
    /// fails with a retryable storage error. Later retryable operations wait
    /// until it has succeeded or failed for good.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        let start = {
            let mut retry = lock(&self.shared.retry);
            retry.ops.push_back(Box::new(op));
            !std::mem::replace(&mut retry.scheduled, true)
        };
        if start {
            let queue = self.clone();
            self.enqueue_and_forget(move |state| queue.run_next_retryable(state));
        }
    }

    fn run_next_retryable(&self, state: &mut S) {
        let next = lock(&self.shared.retry).ops.pop_front();
        let Some(mut op) = next else {
            lock(&self.shared.retry).scheduled = false;
            return;
        };

        match op(state) {
            Err(err) if err.is_retryable_storage_error() => {
                let delay = {
                    let mut retry = lock(&self.shared.retry);
                    retry.ops.push_front(op);
                    retry.backoff.next_delay()
                };
                log::debug!(
                    target: "firestore::async_queue",
                    "retryable operation failed, retrying in {delay:?}: {err}"
                );
                let queue = self.clone();
                self.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move |state| {
                    queue.run_next_retryable(state)
                });
            }
            outcome => {
                if let Err(err) = outcome {
                    log::warn!(
                        target: "firestore::async_queue",
                        "retryable operation failed: {err}"
                    );
                }
                let more = {
                    let mut retry = lock(&self.shared.retry);
                    retry.backoff.reset();
                    retry.scheduled = !retry.ops.is_empty();
                    retry.scheduled
                };
                if more {
                    let queue = self.clone();
                    self.enqueue_and_forget(move |state| queue.run_next_retryable(state));
                }
            }
        }
    }

    fn remove_delayed(&self, id: u64) {
        lock(&self.shared.delayed).retain(|entry| entry.id != id);
    }

    pub fn has_delayed(&self, timer_id: TimerId) -> bool {
        lock(&self.shared.delayed)
            .iter()
            .any(|entry| entry.timer_id == timer_id && !entry.cancelled.load(Ordering::SeqCst))
    }
}

impl<S: Send + 'static> ManualDriver<S> {
    pub fn queue(&self) -> &AsyncQueue<S> {
        &self.queue
    }

    /// Runs queued operations, and any spawned futures they are waiting on,
    /// until nothing is left.
    pub fn run_pending(&self, state: &mut S) {
        loop {
            let mut ran = false;
            while let Ok(op) = self.queue.shared.receiver.try_recv() {
                op(state);
                ran = true;
            }

            let futures = match &self.queue.shared.mode {
                Mode::Manual(pending) => std::mem::take(&mut *lock(pending)),
                Mode::Live => Vec::new(),
            };
            for future in futures {
                let op = runtime::block_on(future);
                op(state);
                ran = true;
            }

            if !ran {
                break;
            }
        }
    }

    pub fn has_delayed(&self, timer_id: TimerId) -> bool {
        self.queue.has_delayed(timer_id)
    }

    /// Fires every pending operation scheduled under `timer_id`.
    pub fn run_delayed(&self, state: &mut S, timer_id: TimerId) -> bool {
        let entries = self.take_delayed(|entry| entry.timer_id == timer_id);
        self.run_entries(state, entries)
    }

    /// Fires delayed operations in schedule order up to and including the
    /// first one registered under `timer_id`.
    pub fn run_delayed_until(&self, state: &mut S, timer_id: TimerId) {
        let mut entries = self.take_delayed(|_| true);
        let cut = entries
            .iter()
            .position(|entry| entry.timer_id == timer_id)
            .map(|index| index + 1)
            .unwrap_or(entries.len());
        let rest = entries.split_off(cut);
        lock(&self.queue.shared.delayed).extend(rest);
        self.run_entries(state, entries);
    }

    /// Fires every delayed operation currently scheduled.
    pub fn run_all_delayed(&self, state: &mut S) {
        let entries = self.take_delayed(|_| true);
        self.run_entries(state, entries);
    }

    fn take_delayed(&self, matches: impl Fn(&DelayedEntry<S>) -> bool) -> Vec<DelayedEntry<S>> {
        let mut delayed = lock(&self.queue.shared.delayed);
        let (mut taken, kept): (Vec<_>, Vec<_>) =
            delayed.drain(..).partition(|entry| matches(entry));
        *delayed = kept;
        taken.sort_by_key(|entry| (entry.delay, entry.id));
        taken
    }

    fn run_entries(&self, state: &mut S, entries: Vec<DelayedEntry<S>>) -> bool {
        self.run_pending(state);
        let mut fired = false;
        for entry in entries {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(op) = entry.op {
                self.queue.enqueue_and_forget(op);
                fired = true;
            }
        }
        self.run_pending(state);
        fired
    }
}

/// Sending half of a one-shot result.
pub struct Deferred<T> {
    sender: Sender<FirestoreResult<T>>,
}

/// Receiving half of a one-shot result.
pub struct Pending<T> {
    receiver: Receiver<FirestoreResult<T>>,
}

pub fn deferred<T>() -> (Deferred<T>, Pending<T>) {
    let (sender, receiver) = async_channel::bounded(1);
    (Deferred { sender }, Pending { receiver })
}

impl<T> Deferred<T> {
    pub fn settle(self, result: FirestoreResult<T>) {
        // The waiter may have gone away; nothing to do then.
        let _ = self.sender.try_send(result);
    }

    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: crate::firestore::error::FirestoreError) {
        self.settle(Err(error));
    }
}

impl<T> Pending<T> {
    pub async fn wait(self) -> FirestoreResult<T> {
        self.receiver
            .recv()
            .await
            .map_err(|_| cancelled("The operation was abandoned before completing."))?
    }

    /// Result if already settled.
    pub fn try_take(&self) -> Option<FirestoreResult<T>> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, FirestoreError};
    use std::sync::atomic::AtomicUsize;

    fn manual() -> (AsyncQueue<Vec<u32>>, ManualDriver<Vec<u32>>) {
        AsyncQueue::manual(BackoffSettings::default())
    }

    #[test]
    fn runs_operations_in_order() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.enqueue_and_forget(|s| s.push(1));
        let result = queue.enqueue(|s| {
            s.push(2);
            Ok(s.len())
        });
        queue.enqueue_and_forget(|s| s.push(3));
        driver.run_pending(&mut state);
        assert_eq!(state, vec![1, 2, 3]);
        assert_eq!(runtime::block_on(result).unwrap(), 2);
    }

    #[test]
    fn delayed_operations_fire_on_demand_and_respect_cancel() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, Duration::from_secs(60), |s| s.push(1));
        let cancelled =
            queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(1), |s| {
                s.push(2)
            });
        assert!(driver.has_delayed(TimerId::ListenStreamIdle));
        cancelled.cancel();
        assert!(!driver.has_delayed(TimerId::ListenStreamIdle));
        driver.run_all_delayed(&mut state);
        assert_eq!(state, vec![1]);
    }

    #[test]
    fn run_delayed_until_stops_at_timer() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(10), |s| {
            s.push(10)
        });
        queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(1), |s| s.push(1));
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, Duration::from_secs(5), |s| s.push(5));
        driver.run_delayed_until(&mut state, TimerId::WriteStreamIdle);
        assert_eq!(state, vec![1, 5]);
        assert!(driver.has_delayed(TimerId::OnlineStateTimeout));
    }

    #[test]
    fn spawned_futures_resume_on_queue() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.spawn_and_enqueue(async { 7u32 }, |s: &mut Vec<u32>, value| s.push(value));
        driver.run_pending(&mut state);
        assert_eq!(state, vec![7]);
    }

    #[test]
    fn retryable_operations_back_off_on_storage_errors() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move |s: &mut Vec<u32>| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(FirestoreError::storage_unavailable("disk busy"));
            }
            s.push(1);
            Ok(())
        });
        queue.enqueue_retryable(|s: &mut Vec<u32>| {
            s.push(2);
            Ok(())
        });

        driver.run_pending(&mut state);
        assert!(state.is_empty());
        assert!(driver.run_delayed(&mut state, TimerId::AsyncQueueRetry));
        assert!(state.is_empty());
        assert!(driver.run_delayed(&mut state, TimerId::AsyncQueueRetry));
        assert_eq!(state, vec![1, 2]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_errors_are_not_retried() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.enqueue_retryable(|_: &mut Vec<u32>| Err(internal_error("boom")));
        driver.run_pending(&mut state);
        assert!(!driver.has_delayed(TimerId::AsyncQueueRetry));
    }

    #[test]
    fn terminated_queue_rejects_work() {
        let (queue, driver) = manual();
        let mut state = Vec::new();
        queue.enqueue_and_forget(|s| s.push(1));
        queue.enqueue_after_delay(TimerId::StorageProbe, Duration::from_secs(5), |s| s.push(9));
        queue.enqueue_and_initiate_shutdown(|s| s.push(2));
        let rejected = queue.enqueue(|s| {
            s.push(3);
            Ok(())
        });
        driver.run_pending(&mut state);
        driver.run_all_delayed(&mut state);
        assert_eq!(state, vec![1, 2]);
        let err = runtime::block_on(rejected).unwrap_err();
        assert_eq!(err.message(), TERMINATED_MESSAGE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_queue_runs_on_worker() {
        let (queue, runner) = AsyncQueue::<Vec<u32>>::new_live(BackoffSettings::default());
        runner.spawn(Vec::new());
        queue.enqueue_and_forget(|s| s.push(4));
        let len = queue.enqueue(|s| Ok(s.len())).await.unwrap();
        assert_eq!(len, 1);

        let (tx, rx) = async_channel::bounded(1);
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_millis(5), move |s| {
            let _ = tx.try_send(s.len());
        });
        assert_eq!(rx.recv().await.unwrap(), 1);
    }
}
