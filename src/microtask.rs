use std::{cell::Cell, cell::RefCell, collections::VecDeque};

// The host is expected to call `run_microtasks` between units of synchronous
// work, the way a JS host drains its microtask checkpoint between tasks.

thread_local! {
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn enqueue(f: impl FnOnce() + 'static) {
    QUEUE.with(|q| q.borrow_mut().push_back(Box::new(f)));
}

/// Number of callbacks waiting for the next [`run_microtasks`] call.
pub fn pending_microtasks() -> usize {
    QUEUE.with(|q| q.borrow().len())
}

/// Drain the microtask queue to empty.
///
/// Callbacks enqueued while draining are executed in the same drain, after
/// everything enqueued before them. A nested call from inside a callback is
/// a no-op; the outer drain picks the new work up.
pub fn run_microtasks() {
    if DRAINING.with(|d| d.replace(true)) {
        return;
    }
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            DRAINING.with(|d| d.set(false));
        }
    }
    let _reset = Reset;
    loop {
        let task = QUEUE.with(|q| q.borrow_mut().pop_front());
        match task {
            Some(task) => task(),
            None => break,
        }
    }
}
