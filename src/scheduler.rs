use std::{
    any::Any,
    cell::{Cell, RefCell},
    future::Future,
    mem::take,
    panic::resume_unwind,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::{
    errors::{call_with_error_handling, ErrorCode},
    microtask,
};


/// How many times one job may be seen within a single drain before it is
/// skipped with a diagnostic. Enforced under `debug_assertions` only.
pub const RECURSION_LIMIT: u32 = 100;

pub type JobId = u64;

/// A schedulable unit of work.
///
/// Clones share one allocation; queue dedup and invalidation go by that
/// identity. A job whose active flag is `false` is silently skipped when the
/// main queue reaches it.
#[derive(Clone)]
pub struct Job(Rc<JobInner>);

struct JobInner {
    id: Option<JobId>,
    allow_recurse: Cell<bool>,
    active: Rc<Cell<bool>>,
    owner: Option<Rc<str>>,
    f: RefCell<Box<dyn FnMut()>>,
}

/// Creation options for [`Job::with_options`].
#[derive(Clone, Debug, Default)]
pub struct JobOptions {
    /// Queue priority; jobs without one run last.
    pub id: Option<JobId>,
    pub allow_recurse: bool,
    /// Name used by the recursion-limit diagnostic.
    pub owner: Option<Rc<str>>,
}

impl Job {
    pub fn new(f: impl FnMut() + 'static) -> Job {
        Job::with_options(f, JobOptions::default())
    }

    pub fn with_options(f: impl FnMut() + 'static, options: JobOptions) -> Job {
        Job(Rc::new(JobInner {
            id: options.id,
            allow_recurse: Cell::new(options.allow_recurse),
            active: Rc::new(Cell::new(true)),
            owner: options.owner,
            f: RefCell::new(Box::new(f)),
        }))
    }

    /// Job backing an effect: shares the effect's active flag so stopping
    /// the effect also deactivates a queued copy of the job.
    pub(crate) fn for_effect(
        id: JobId,
        allow_recurse: bool,
        active: Rc<Cell<bool>>,
        f: impl FnMut() + 'static,
    ) -> Job {
        Job(Rc::new(JobInner {
            id: Some(id),
            allow_recurse: Cell::new(allow_recurse),
            active,
            owner: None,
            f: RefCell::new(Box::new(f)),
        }))
    }

    pub fn id(&self) -> Option<JobId> {
        self.0.id
    }

    pub fn allow_recurse(&self) -> bool {
        self.0.allow_recurse.get()
    }

    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    pub fn set_active(&self, active: bool) {
        self.0.active.set(active);
    }

    pub(crate) fn owner(&self) -> Option<Rc<str>> {
        self.0.owner.clone()
    }

    fn same(&self, other: &Job) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Absent ids order as +∞.
    fn sort_id(&self) -> JobId {
        self.0.id.unwrap_or(JobId::MAX)
    }

    fn invoke(&self) {
        let mut f = self.0.f.borrow_mut();
        (*f)();
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.0.id)
            .field("active", &self.0.active.get())
            .field("owner", &self.0.owner)
            .finish()
    }
}

struct Scheduler {
    queue: Vec<Job>,
    /// Index of the main job currently executing; `-1` while idle and
    /// through the pre phase.
    flush_index: isize,
    is_flushing: bool,
    is_flush_pending: bool,
    pending_pre: Vec<Job>,
    active_pre: Option<Vec<Job>>,
    pre_flush_index: usize,
    pending_post: Vec<Job>,
    active_post: Option<Vec<Job>>,
    post_flush_index: usize,
    current_flush_promise: Option<FlushPromise>,
    /// Main-queue job whose pre callbacks are draining right now; queueing
    /// it again during that drain is rejected.
    pre_parent: Option<Job>,
}

impl Scheduler {
    fn with<T>(f: impl FnOnce(&mut Scheduler) -> T) -> T {
        SCHEDULER.with(|s| f(&mut s.borrow_mut()))
    }
}

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler {
        queue: Vec::new(),
        flush_index: -1,
        is_flushing: false,
        is_flush_pending: false,
        pending_pre: Vec::new(),
        active_pre: None,
        pre_flush_index: 0,
        pending_post: Vec::new(),
        active_post: None,
        post_flush_index: 0,
        current_flush_promise: None,
        pre_parent: None,
    });
}

/// Upper-bound binary search over the un-flushed window, so jobs with equal
/// ids keep their insertion order.
fn find_insertion_index(queue: &[Job], flush_index: isize, id: JobId) -> usize {
    let mut start = (flush_index + 1).max(0) as usize;
    let mut end = queue.len();
    while start < end {
        let middle = (start + end) / 2;
        if queue[middle].sort_id() <= id {
            start = middle + 1;
        } else {
            end = middle;
        }
    }
    start
}

/// Insert `job` into the main queue at its ordered position and arm a drain.
///
/// Rejected when an identical job is already queued within the search
/// window (the whole queue while idle; everything from the executing index
/// on while flushing; from one past it for a job that allows recursion),
/// or when `job` is the parent of the pre drain currently in progress.
pub fn queue_job(job: &Job) {
    let admitted = Scheduler::with(|s| {
        let from = if s.is_flushing && job.allow_recurse() {
            s.flush_index + 1
        } else {
            s.flush_index
        };
        let from = from.max(0) as usize;
        if s.queue.iter().skip(from).any(|queued| queued.same(job)) {
            return false;
        }
        if s.pre_parent.as_ref().is_some_and(|parent| parent.same(job)) {
            return false;
        }
        let pos = find_insertion_index(&s.queue, s.flush_index, job.sort_id());
        s.queue.insert(pos, job.clone());
        true
    });
    if admitted {
        queue_flush();
    }
}

/// Remove a not-yet-run copy of `job` from the main queue. Jobs at or before
/// the executing index are committed and stay; an absent job is a no-op.
pub fn invalidate_job(job: &Job) {
    Scheduler::with(|s| {
        if let Some(pos) = s.queue.iter().position(|queued| queued.same(job)) {
            if pos as isize > s.flush_index {
                s.queue.remove(pos);
            }
        }
    });
}

/// Append `cb` to the pre-callback backlog and arm a drain.
pub fn queue_pre_flush_cb(cb: &Job) {
    queue_cb(cb, FlankPhase::Pre);
}

/// Append `cb` to the post-callback backlog and arm a drain.
pub fn queue_post_flush_cb(cb: &Job) {
    queue_cb(cb, FlankPhase::Post);
}

/// Append a batch of post callbacks, bypassing dedup. The batch is assumed
/// to be deduplicated upstream.
pub fn queue_post_flush_cbs(cbs: &[Job]) {
    Scheduler::with(|s| s.pending_post.extend(cbs.iter().cloned()));
    queue_flush();
}

#[derive(Clone, Copy)]
enum FlankPhase {
    Pre,
    Post,
}

fn queue_cb(cb: &Job, phase: FlankPhase) {
    Scheduler::with(|s| {
        let (active, index) = match phase {
            FlankPhase::Pre => (&s.active_pre, s.pre_flush_index),
            FlankPhase::Post => (&s.active_post, s.post_flush_index),
        };
        // Dedup against the draining snapshot; duplicates in the backlog are
        // collapsed when the snapshot is taken.
        let admitted = match active {
            None => true,
            Some(active) => {
                let from = if cb.allow_recurse() { index + 1 } else { index };
                !active.iter().skip(from).any(|queued| queued.same(cb))
            }
        };
        if admitted {
            match phase {
                FlankPhase::Pre => s.pending_pre.push(cb.clone()),
                FlankPhase::Post => s.pending_post.push(cb.clone()),
            }
        }
    });
    queue_flush();
}

fn queue_flush() {
    let promise = Scheduler::with(|s| {
        if s.is_flushing || s.is_flush_pending {
            return None;
        }
        s.is_flush_pending = true;
        let promise = FlushPromise::new();
        s.current_flush_promise = Some(promise.clone());
        Some(promise)
    });
    if let Some(promise) = promise {
        microtask::enqueue(move || {
            let panic = flush_jobs();
            promise.resolve();
            if let Some(payload) = panic {
                resume_unwind(payload);
            }
        });
    }
}

fn dedup_jobs(jobs: Vec<Job>) -> Vec<Job> {
    let mut out: Vec<Job> = Vec::with_capacity(jobs.len());
    for job in jobs {
        if !out.iter().any(|seen| seen.same(&job)) {
            out.push(job);
        }
    }
    out
}

/// Per-drain invocation counters. Compiled out of release builds.
struct RecursionGuard {
    #[cfg(debug_assertions)]
    counts: std::collections::HashMap<usize, u32>,
}

impl RecursionGuard {
    fn new() -> Self {
        RecursionGuard {
            #[cfg(debug_assertions)]
            counts: std::collections::HashMap::new(),
        }
    }

    #[cfg(debug_assertions)]
    fn check(&mut self, job: &Job) -> bool {
        let count = self.counts.entry(job.addr()).or_insert(0);
        if *count > RECURSION_LIMIT {
            tracing::warn!(
                job_id = ?job.id(),
                owner = job.owner().as_deref().unwrap_or("<anonymous>"),
                "maximum recursive updates exceeded; a reactive effect is \
                 mutating a dependency of its own, skipping it for the rest \
                 of this flush",
            );
            true
        } else {
            *count += 1;
            false
        }
    }

    #[cfg(not(debug_assertions))]
    fn check(&mut self, _job: &Job) -> bool {
        false
    }
}

/// State threaded through the phases of one drain: the shared recursion
/// counters and the first captured panic awaiting re-raise.
struct DrainCtx {
    seen: RecursionGuard,
    panic: Option<Box<dyn Any + Send>>,
}

impl DrainCtx {
    fn new() -> Self {
        DrainCtx {
            seen: RecursionGuard::new(),
            panic: None,
        }
    }

    fn invoke(&mut self, job: &Job) {
        if self.seen.check(job) {
            return;
        }
        let payload = call_with_error_handling(|| job.invoke(), job.owner(), ErrorCode::Scheduler);
        if let Some(payload) = payload {
            self.panic.get_or_insert(payload);
        }
    }

    fn rethrow(mut self) {
        if let Some(payload) = self.panic.take() {
            resume_unwind(payload);
        }
    }
}

/// Drain the pre-callback backlog, repeating until callbacks stop enqueueing
/// more pre callbacks. `parent_job` is the main-queue job on whose behalf
/// the drain runs, if any.
pub fn flush_pre_flush_cbs(parent_job: Option<&Job>) {
    let mut ctx = DrainCtx::new();
    flush_pre_cbs_with(&mut ctx, parent_job);
    ctx.rethrow();
}

fn flush_pre_cbs_with(ctx: &mut DrainCtx, parent_job: Option<&Job>) {
    loop {
        let has_work = Scheduler::with(|s| {
            if s.pending_pre.is_empty() {
                return false;
            }
            s.pre_parent = parent_job.cloned();
            s.active_pre = Some(dedup_jobs(take(&mut s.pending_pre)));
            s.pre_flush_index = 0;
            true
        });
        if !has_work {
            return;
        }
        loop {
            let job = Scheduler::with(|s| {
                s.active_pre
                    .as_ref()
                    .and_then(|active| active.get(s.pre_flush_index))
                    .cloned()
            });
            let Some(job) = job else { break };
            ctx.invoke(&job);
            Scheduler::with(|s| s.pre_flush_index += 1);
        }
        Scheduler::with(|s| {
            s.active_pre = None;
            s.pre_flush_index = 0;
            s.pre_parent = None;
        });
    }
}

/// Drain the post-callback backlog: snapshot with dedup, sort by id, run.
/// A re-entrant call extends the snapshot already draining instead of
/// starting a second one.
pub fn flush_post_flush_cbs() {
    let mut ctx = DrainCtx::new();
    flush_post_cbs_with(&mut ctx);
    ctx.rethrow();
}

fn flush_post_cbs_with(ctx: &mut DrainCtx) {
    let snapshot = Scheduler::with(|s| {
        if s.pending_post.is_empty() {
            return None;
        }
        let deduped = dedup_jobs(take(&mut s.pending_post));
        if let Some(active) = &mut s.active_post {
            active.extend(deduped);
            return None;
        }
        Some(deduped)
    });
    let Some(mut snapshot) = snapshot else { return };
    snapshot.sort_by_key(|job| job.sort_id());
    Scheduler::with(|s| {
        s.active_post = Some(snapshot);
        s.post_flush_index = 0;
    });
    loop {
        // Fetched by index each pass: a re-entrant flush may have grown the
        // snapshot behind us.
        let job = Scheduler::with(|s| {
            s.active_post
                .as_ref()
                .and_then(|active| active.get(s.post_flush_index))
                .cloned()
        });
        let Some(job) = job else { break };
        ctx.invoke(&job);
        Scheduler::with(|s| s.post_flush_index += 1);
    }
    Scheduler::with(|s| {
        s.active_post = None;
        s.post_flush_index = 0;
    });
}

fn flush_jobs() -> Option<Box<dyn Any + Send>> {
    let mut ctx = DrainCtx::new();
    flush_jobs_with(&mut ctx);
    ctx.panic.take()
}

fn flush_jobs_with(ctx: &mut DrainCtx) {
    Scheduler::with(|s| {
        s.is_flush_pending = false;
        s.is_flushing = true;
    });

    flush_pre_cbs_with(ctx, None);

    // Sorting before the main pass keeps parent effects (created first,
    // lower ids) ahead of their children, so a child orphaned by its parent
    // can be deactivated before the queue reaches it.
    Scheduler::with(|s| {
        s.queue.sort_by_key(|job| job.sort_id());
        s.flush_index = 0;
    });
    loop {
        let job = Scheduler::with(|s| s.queue.get(s.flush_index as usize).cloned());
        let Some(job) = job else { break };
        if job.is_active() {
            ctx.invoke(&job);
        }
        Scheduler::with(|s| s.flush_index += 1);
    }

    Scheduler::with(|s| {
        s.flush_index = -1;
        s.queue.clear();
    });
    flush_post_cbs_with(ctx);
    let rerun = Scheduler::with(|s| {
        s.is_flushing = false;
        s.current_flush_promise = None;
        !s.queue.is_empty() || !s.pending_pre.is_empty() || !s.pending_post.is_empty()
    });
    // One user-visible microtask drains to a fixed point.
    if rerun {
        flush_jobs_with(ctx);
    }
}

#[derive(Clone)]
struct FlushPromise(Rc<RefCell<PromiseState>>);

struct PromiseState {
    resolved: bool,
    callbacks: Vec<Box<dyn FnOnce()>>,
}

impl FlushPromise {
    fn new() -> Self {
        FlushPromise(Rc::new(RefCell::new(PromiseState {
            resolved: false,
            callbacks: Vec::new(),
        })))
    }

    fn then(&self, f: Box<dyn FnOnce()>) {
        let mut state = self.0.borrow_mut();
        if state.resolved {
            microtask::enqueue(f);
        } else {
            state.callbacks.push(f);
        }
    }

    fn resolve(&self) {
        let callbacks = {
            let mut state = self.0.borrow_mut();
            state.resolved = true;
            take(&mut state.callbacks)
        };
        for callback in callbacks {
            microtask::enqueue(callback);
        }
    }
}

struct TickState {
    done: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Future returned by [`next_tick`]; resolves after the drain observed at
/// creation has completed.
pub struct NextTick(Rc<TickState>);

impl NextTick {
    pub fn is_resolved(&self) -> bool {
        self.0.done.get()
    }
}

impl Future for NextTick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.done.get() {
            Poll::Ready(())
        } else {
            *self.0.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A future resolving after the in-flight drain completes, or after the
/// next microtask checkpoint when no drain is pending.
pub fn next_tick() -> NextTick {
    next_tick_impl(None)
}

/// Like [`next_tick`], additionally running `f` at the resolution point,
/// after every job enqueued strictly before this call.
pub fn next_tick_with(f: impl FnOnce() + 'static) -> NextTick {
    next_tick_impl(Some(Box::new(f)))
}

fn next_tick_impl(f: Option<Box<dyn FnOnce()>>) -> NextTick {
    let state = Rc::new(TickState {
        done: Cell::new(false),
        waker: RefCell::new(None),
    });
    let tick = state.clone();
    let complete: Box<dyn FnOnce()> = Box::new(move || {
        if let Some(f) = f {
            f();
        }
        tick.done.set(true);
        if let Some(waker) = tick.waker.borrow_mut().take() {
            waker.wake();
        }
    });
    let promise = Scheduler::with(|s| s.current_flush_promise.clone());
    match promise {
        Some(promise) => promise.then(complete),
        None => microtask::enqueue(complete),
    }
    NextTick(state)
}
