//! The serial executor: a single background task that owns `queue`,
//! `task_counter`, and the promise registry, driven by `tokio::spawn` and an
//! unbounded `mpsc` channel. Every mutation of loop-confined state funnels
//! through here, one `Command` at a time.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::promise::PromiseRegistry;
use super::reentrancy;
use super::task::{TaskBody, TaskEntry};
use crate::error::LoopError;

/// The priority queue, shared between the serial executor and every
/// [`super::Scheduled`] handle so a reentrant [`super::Scheduled::cancel`]
/// can mutate it directly instead of going through `Command::Cancel`.
///
/// Only ever locked for the brief span of a push/pop/removal — never while a
/// task body runs — so a handle locking it from inside a task body (the
/// reentrant case) can't deadlock against the executor.
pub(super) type SharedQueue = Arc<Mutex<BinaryHeap<TaskEntry>>>;

pub(super) enum Command {
    Schedule {
        id: u64,
        ready_time: u64,
        body: Box<dyn TaskBody>,
    },
    Cancel {
        id: u64,
    },
    AdvanceTo {
        target: u64,
        reply: oneshot::Sender<u64>,
    },
    ExecuteInContext {
        work: Box<dyn FnOnce() + Send>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Spawns the serial executor and returns the command channel driving it
/// plus the shared queue handle backing it.
///
/// `now` is shared with [`super::VirtualLoop`] so reads of the current
/// virtual time never need to round-trip through the executor.
pub(super) fn spawn(
    now: Arc<AtomicU64>,
    promises: Arc<PromiseRegistry>,
) -> (mpsc::UnboundedSender<Command>, SharedQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue: SharedQueue = Arc::new(Mutex::new(BinaryHeap::new()));
    tokio::spawn(run(rx, now, promises, queue.clone()));
    (tx, queue)
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    now: Arc<AtomicU64>,
    promises: Arc<PromiseRegistry>,
    queue: SharedQueue,
) {
    let mut task_counter: u64 = 0;

    while let Some(command) = rx.recv().await {
        if handle(command, &queue, &mut task_counter, &now) {
            break;
        }
    }

    // Draining finished (or the channel was never asked to drain but the
    // sender side was dropped). Either way, fail any command already queued
    // behind the one that triggered the break, and reject everything sent
    // afterwards by leaving the channel closed.
    rx.close();
    while let Ok(command) = rx.try_recv() {
        fail_stray_command(command);
    }

    drop(promises);
}

/// Removes the task with `id` from `queue`, if present. Shared by
/// `Command::Cancel` handling and [`super::Scheduled::cancel`]'s reentrant
/// fast path.
pub(super) fn remove_by_id(queue: &mut BinaryHeap<TaskEntry>, id: u64) {
    if queue.iter().any(|task| task.id == id) {
        let remaining: Vec<TaskEntry> = queue.drain().filter(|task| task.id != id).collect();
        queue.extend(remaining);
    }
}

/// Returns `true` once shutdown has fully drained and the executor should stop.
fn handle(command: Command, queue: &SharedQueue, task_counter: &mut u64, now: &Arc<AtomicU64>) -> bool {
    match command {
        Command::Schedule { id, ready_time, body } => {
            *task_counter += 1;
            queue.lock().unwrap().push(TaskEntry {
                id,
                ready_time,
                insert_order: *task_counter,
                body,
            });
            false
        }
        Command::Cancel { id } => {
            remove_by_id(&mut queue.lock().unwrap(), id);
            false
        }
        Command::AdvanceTo { target, reply } => {
            let new_time = target.max(now.load(Ordering::Acquire));
            advance_to(queue, now, new_time);
            now.store(new_time, Ordering::Release);
            let _ = reply.send(new_time);
            false
        }
        Command::ExecuteInContext { work } => {
            work();
            false
        }
        Command::Shutdown { reply } => {
            // Drain every currently-enqueued task, in deadline order,
            // advancing `now` as we go. Tasks a submitter sends *after* this
            // command was dequeued arrive on the channel behind it and
            // never make it into `queue`; they're failed with `Shutdown`
            // once this task returns to `run`'s straggler-draining pass.
            drain_all(queue, now);
            let _ = reply.send(());
            true
        }
    }
}

/// Pops the next same-deadline batch off `queue`, if its deadline is `<=
/// limit`. Locks only long enough to pop; the lock is released before any
/// task body runs.
fn pop_batch(queue: &SharedQueue, limit: u64) -> Option<(u64, Vec<TaskEntry>)> {
    let mut guard = queue.lock().unwrap();
    let head_ready = guard.peek()?.ready_time;
    if head_ready > limit {
        return None;
    }
    let mut batch = Vec::new();
    while let Some(top) = guard.peek() {
        if top.ready_time == head_ready {
            batch.push(guard.pop().unwrap());
        } else {
            break;
        }
    }
    Some((head_ready, batch))
}

/// Advances the queue up to `new_time`, batching same-deadline tasks
/// before executing any of them so "simultaneous" deadlines observe each
/// other's side effects as a single step rather than interleaved.
fn advance_to(queue: &SharedQueue, now: &Arc<AtomicU64>, new_time: u64) {
    while let Some((head_ready, batch)) = pop_batch(queue, new_time) {
        now.store(head_ready, Ordering::Release);
        trace!(ready_time = head_ready, batch_size = batch.len(), "running batch");
        for task in batch {
            reentrancy::guarded(|| task.body.run());
        }
    }
}

/// Runs every batch currently in `queue` to completion, regardless of
/// deadline, advancing `now` to each batch's `ready_time` in turn.
fn drain_all(queue: &SharedQueue, now: &Arc<AtomicU64>) {
    while let Some((head_ready, batch)) = pop_batch(queue, u64::MAX) {
        let advanced = head_ready.max(now.load(Ordering::Acquire));
        now.store(advanced, Ordering::Release);
        for task in batch {
            reentrancy::guarded(|| task.body.run());
        }
    }
}

fn fail_stray_command(command: Command) {
    match command {
        Command::Schedule { body, .. } => body.fail(LoopError::Shutdown),
        Command::Cancel { .. } => {}
        Command::AdvanceTo { reply, .. } => {
            let _ = reply.send(0);
        }
        Command::ExecuteInContext { .. } => {}
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
