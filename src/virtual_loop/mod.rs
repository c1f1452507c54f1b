//! A deterministic, thread-safe, time-controllable event loop, used to drive
//! asynchronous networking code in tests and simulations.
//!
//! Time never progresses on its own: only [`VirtualLoop::run`],
//! [`VirtualLoop::advance_time_by`], and [`VirtualLoop::advance_time_to`]
//! execute scheduled work, and only up to the point the caller asks for.

mod promise;
mod reentrancy;
mod task;
mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::error::LoopError;
use promise::PromiseRegistry;
use task::{TaskBody, TaskBodyImpl};
use worker::{Command, SharedQueue};

/// A single-threaded-by-queue, time-controllable executor.
///
/// Cloning a `VirtualLoop` is cheap and yields a handle to the same
/// underlying loop (the serial executor task and its state are shared via
/// `Arc`); callers may submit work from any thread.
#[derive(Clone)]
pub struct VirtualLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    now: Arc<AtomicU64>,
    id_counter: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    queue: SharedQueue,
    promises: Arc<PromiseRegistry>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        // Leak detection is a debug aid; release builds pay the (tiny)
        // bookkeeping cost but never panic over it.
        #[cfg(debug_assertions)]
        {
            let outstanding = self.promises.outstanding();
            if !outstanding.is_empty() {
                panic!(
                    "VirtualLoop dropped with {} outstanding promise(s), created at: {:?}",
                    outstanding.len(),
                    outstanding
                );
            }
        }
    }
}

impl Default for VirtualLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualLoop {
    /// Creates a fresh loop with `now = 0` and an empty queue.
    pub fn new() -> Self {
        let now = Arc::new(AtomicU64::new(0));
        let promises = Arc::new(PromiseRegistry::default());
        let (cmd_tx, queue) = worker::spawn(now.clone(), promises.clone());
        Self {
            inner: Arc::new(LoopInner {
                now,
                id_counter: AtomicU64::new(0),
                cmd_tx,
                queue,
                promises,
            }),
        }
    }

    /// The current virtual time, in nanoseconds since loop creation.
    pub fn now(&self) -> u64 {
        self.inner.now.load(Ordering::Acquire)
    }

    /// Equivalent to `schedule_task_at(self.now(), work)`.
    pub fn execute<F>(&self, work: F) -> Scheduled<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task_at(self.now(), work)
    }

    /// Sugar for `schedule_task_at(self.now() + delay_nanos, work)`. `now` is
    /// read at call time, not when the task is eventually considered.
    pub fn schedule_task_after<T, F>(&self, delay_nanos: u64, work: F) -> Scheduled<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.schedule_task_at(self.now().saturating_add(delay_nanos), work)
    }

    /// Enqueues `work` to run once virtual time reaches `ready_time`.
    pub fn schedule_task_at<T, F>(&self, ready_time: u64, work: F) -> Scheduled<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.id_counter.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let body: Box<dyn TaskBody> = Box::new(TaskBodyImpl { work, result_tx });

        if let Err(mpsc::error::SendError(command)) =
            self.inner.cmd_tx.send(Command::Schedule { id, ready_time, body })
        {
            if let Command::Schedule { body, .. } = command {
                body.fail(LoopError::Shutdown);
            }
        }

        Scheduled {
            id,
            cmd_tx: self.inner.cmd_tx.clone(),
            queue: self.inner.queue.clone(),
            result_rx,
        }
    }

    /// Advances time to the current `now`, running every task that became
    /// due since the last advancement (there shouldn't be any that weren't
    /// already run, but a task may have scheduled more work for "now").
    #[instrument(skip(self))]
    pub async fn run(&self) -> u64 {
        self.advance_time_to(self.now()).await
    }

    /// Advances `now` by `delta_nanos`, running due tasks in order. A
    /// negative delta is a no-op.
    pub async fn advance_time_by(&self, delta_nanos: i64) -> u64 {
        if delta_nanos < 0 {
            return self.now();
        }
        self.advance_time_to(self.now().saturating_add(delta_nanos as u64)).await
    }

    /// Advances to `target` if `target > now`; otherwise `now` is left
    /// unchanged, though tasks already due at the current `now` still run.
    #[instrument(skip(self))]
    pub async fn advance_time_to(&self, target: u64) -> u64 {
        #[cfg(debug_assertions)]
        assert_safe_to_wait("advance_time_to");

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::AdvanceTo { target, reply: reply_tx }).is_err() {
            return self.now();
        }
        reply_rx.await.unwrap_or_else(|_| self.now())
    }

    /// Submits `work` to the serial executor and awaits its result,
    /// guaranteeing no other loop-confined mutation interleaves with it.
    pub async fn execute_in_context<T, F>(&self, work: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        #[cfg(debug_assertions)]
        assert_safe_to_wait("execute_in_context");

        let (result_tx, result_rx) = oneshot::channel();
        let boxed: Box<dyn FnOnce() + Send> = Box::new(move || {
            let _ = result_tx.send(work());
        });
        if self
            .inner
            .cmd_tx
            .send(Command::ExecuteInContext { work: boxed })
            .is_err()
        {
            panic!("cannot execute_in_context on a shut down VirtualLoop");
        }
        result_rx.await.expect("serial executor dropped without replying")
    }

    /// Resolves a future created on this loop from outside the loop.
    ///
    /// Because futures bound to a `VirtualLoop` only complete when the loop
    /// advances, and advancement has to be driven by some caller, naively
    /// awaiting `future` from outside would deadlock. Instead three
    /// concurrent pieces of work race: forwarding `future`'s result,
    /// repeatedly calling [`Self::run`] to keep the loop progressing, and a
    /// timeout. Whichever resolves first wins; the others are cancelled.
    pub async fn await_future<T, Fut>(&self, future: Fut, timeout: Duration) -> Result<T, LoopError>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        #[cfg(debug_assertions)]
        assert_safe_to_wait("await_future");

        let (done_tx, done_rx) = oneshot::channel::<T>();
        let forward = tokio::spawn(async move {
            let _ = done_tx.send(future.await);
        });

        let spinner_loop = self.clone();
        let spin = tokio::spawn(async move {
            loop {
                spinner_loop.run().await;
                tokio::task::yield_now().await;
            }
        });

        let outcome = tokio::select! {
            biased;
            value = done_rx => value.map_err(|_| LoopError::Shutdown),
            _ = tokio::time::sleep(timeout) => {
                // Load-bearing: without this final `run()`, group
                // cancellation below can race ahead of the spinner and the
                // timeout is observed as a hang instead of this error.
                self.run().await;
                Err(LoopError::TimeoutAwaitingFuture)
            }
        };

        spin.abort();
        forward.abort();
        outcome
    }

    /// Drains all currently-scheduled tasks (running them to completion in
    /// deadline order, advancing `now` as needed), then fails any task
    /// enqueued during the drain with [`LoopError::Shutdown`]. Idempotent.
    pub async fn shutdown_gracefully(&self) {
        #[cfg(debug_assertions)]
        assert_safe_to_wait("shutdown_gracefully");

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        // If the send failed, the loop was already shut down — idempotent no-op.
    }

    /// Creates a promise/future pair bound to this loop. In debug builds,
    /// registers the call site so a leaked (never-completed) promise causes
    /// the loop's `Drop` impl to panic instead of silently vanishing.
    #[track_caller]
    pub fn make_promise<T: Send + 'static, E: Send + 'static>(&self) -> (LoopPromise<T, E>, LoopFuture<T, E>) {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.promises.register(std::panic::Location::caller());
        let promise = LoopPromise {
            tx: Some(tx),
            id,
            registry: self.inner.promises.clone(),
        };
        (promise, rx)
    }
}

#[cfg(debug_assertions)]
#[track_caller]
fn assert_safe_to_wait(what: &'static str) {
    if reentrancy::in_task_body() {
        panic!(
            "VirtualLoop::{what} called from within a task body running on this same loop; \
             this would deadlock the serial executor"
        );
    }
}

/// A future bound to a [`VirtualLoop`], completed by the matching [`LoopPromise`].
pub type LoopFuture<T, E> = oneshot::Receiver<Result<T, E>>;

/// The writable half of a [`LoopFuture`].
pub struct LoopPromise<T, E> {
    tx: Option<oneshot::Sender<Result<T, E>>>,
    id: u64,
    registry: Arc<PromiseRegistry>,
}

impl<T, E> LoopPromise<T, E> {
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, err: E) {
        self.complete(Err(err));
    }

    fn complete(mut self, result: Result<T, E>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
        self.registry.complete(self.id);
    }
}

/// A handle to a task submitted via [`VirtualLoop::schedule_task_at`] (or its
/// `execute`/`schedule_task_after` sugar).
pub struct Scheduled<T> {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    queue: SharedQueue,
    result_rx: oneshot::Receiver<Result<T, LoopError>>,
}

impl<T> Scheduled<T> {
    /// The task's loop-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes the task from the priority queue by id. A no-op if the task
    /// already ran or does not exist. Does *not* fail the task's result —
    /// [`Self::result`] simply never resolves unless the caller also fails
    /// it some other way.
    ///
    /// Called from within a task body running on this same loop, the
    /// removal happens synchronously, in place, so a task can cancel work
    /// scheduled later in the same batch before it's popped. Called from
    /// outside the loop, it's posted to the serial queue like any other
    /// mutation.
    pub fn cancel(&self) {
        if reentrancy::in_task_body() {
            worker::remove_by_id(&mut self.queue.lock().unwrap(), self.id);
        } else {
            let _ = self.cmd_tx.send(Command::Cancel { id: self.id });
        }
    }

    /// Awaits the task's outcome.
    pub async fn result(self) -> Result<T, LoopError> {
        self.result_rx.await.unwrap_or(Err(LoopError::Shutdown))
    }
}
