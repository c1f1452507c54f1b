//! Task bodies and their ordering inside the serial executor's queue.

use std::cmp::Ordering;

use tokio::sync::oneshot;

use crate::error::LoopError;

/// Type-erased task body: runs the work closure or fails it, delivering the
/// result through the oneshot channel backing the task's [`super::Scheduled`]
/// handle. Folding "run" and "fail" into one trait keeps the success/failure
/// path tied to a single channel instead of two independently-fallible
/// closures.
pub(super) trait TaskBody: Send {
    fn run(self: Box<Self>);
    fn fail(self: Box<Self>, err: LoopError);
}

pub(super) struct TaskBodyImpl<T, F> {
    pub(super) work: F,
    pub(super) result_tx: oneshot::Sender<Result<T, LoopError>>,
}

impl<T, F> TaskBody for TaskBodyImpl<T, F>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    fn run(self: Box<Self>) {
        let output = (self.work)();
        let _ = self.result_tx.send(Ok(output));
    }

    fn fail(self: Box<Self>, err: LoopError) {
        let _ = self.result_tx.send(Err(err));
    }
}

/// A task sitting in the serial executor's priority queue.
///
/// Ordered first by `ready_time` ascending, then by `insert_order`
/// ascending — equal deadlines run FIFO by submission order. `BinaryHeap`
/// is a max-heap, so `Ord` is implemented inverted to make the heap's peek
/// return the earliest-due, earliest-submitted task.
pub(super) struct TaskEntry {
    pub(super) id: u64,
    pub(super) ready_time: u64,
    pub(super) insert_order: u64,
    pub(super) body: Box<dyn TaskBody>,
}

impl PartialEq for TaskEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_time == other.ready_time && self.insert_order == other.insert_order
    }
}

impl Eq for TaskEntry {}

impl PartialOrd for TaskEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_time
            .cmp(&self.ready_time)
            .then_with(|| other.insert_order.cmp(&self.insert_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn entry(id: u64, ready_time: u64, insert_order: u64) -> TaskEntry {
        let (tx, _rx) = oneshot::channel::<Result<(), LoopError>>();
        TaskEntry {
            id,
            ready_time,
            insert_order,
            body: Box::new(TaskBodyImpl { work: || (), result_tx: tx }),
        }
    }

    #[test]
    fn heap_pops_earliest_deadline_then_earliest_insert_order() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, 10, 2));
        heap.push(entry(2, 5, 0));
        heap.push(entry(3, 5, 1));
        heap.push(entry(4, 20, 0));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec![2, 3, 1, 4]);
    }
}
