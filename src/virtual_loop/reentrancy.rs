//! Tracks whether the current thread is in the middle of running a task
//! body, so the loop's suspension points can refuse to be called
//! reentrantly from a task's own closure instead of deadlocking.

use std::cell::Cell;

thread_local! {
    static IN_TASK_BODY: Cell<bool> = const { Cell::new(false) };
}

pub(super) fn in_task_body() -> bool {
    IN_TASK_BODY.with(Cell::get)
}

/// Runs `f` with the reentrancy flag set for the duration of the call.
pub(super) fn guarded<R>(f: impl FnOnce() -> R) -> R {
    let previous = IN_TASK_BODY.with(|flag| flag.replace(true));
    let result = f();
    IN_TASK_BODY.with(|flag| flag.set(previous));
    result
}
