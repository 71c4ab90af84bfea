//! Fine-grained reactive runtime.
//!
//! Reads performed inside an [`Effect`] are recorded as keyed dependency
//! edges; writes [`trigger`] the subscribed effects, which either run
//! directly or hand themselves to the flush scheduler for id-ordered,
//! microtask-batched execution.
//!
//! The runtime is single-threaded: all state lives in thread-locals and the
//! host drives the suspension point by calling [`run_microtasks`] between
//! units of synchronous work.
//!
//! ```
//! use std::rc::Rc;
//! use fluxion::{make_effect, queue_job, run_microtasks, EffectOptions, ReactiveCell};
//!
//! let count = ReactiveCell::new(1);
//! let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
//!
//! let effect = make_effect(
//!     {
//!         let count = count.clone();
//!         let seen = seen.clone();
//!         move || seen.borrow_mut().push(count.get())
//!     },
//!     EffectOptions {
//!         scheduler: Some(Rc::new(|e| queue_job(&e.job()))),
//!         ..EffectOptions::default()
//!     },
//! );
//!
//! count.set(2);
//! count.set(3);
//! run_microtasks();
//! // The two writes coalesced into one re-run.
//! assert_eq!(*seen.borrow(), [1, 3]);
//! drop(effect);
//! ```

mod effect;
mod errors;
mod graph;
mod microtask;
mod reactive;
mod scheduler;

pub use effect::{
    active_effect, enable_tracking, make_effect, make_effect_from, pause_tracking,
    reset_tracking, stop, untracked, Effect, EffectOptions, EffectRef,
};
pub use errors::{
    call_with_error_handling, clear_error_handler, rethrow_unhandled, set_error_handler,
    CapturedError, ErrorCode,
};
pub use graph::{
    track, trigger, PropKey, Target, TargetId, TargetKind, TrackEvent, TrackOp, TriggerEvent,
    TriggerOp,
};
pub use microtask::{pending_microtasks, run_microtasks};
pub use reactive::{ReactiveCell, ReactiveList, ReactiveMap};
pub use scheduler::{
    flush_post_flush_cbs, flush_pre_flush_cbs, invalidate_job, next_tick, next_tick_with,
    queue_job, queue_post_flush_cb, queue_post_flush_cbs, queue_pre_flush_cb, Job, JobId,
    JobOptions, NextTick, RECURSION_LIMIT,
};
