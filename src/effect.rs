use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use derive_ex::derive_ex;

use crate::{
    graph::{Dep, DepKey, TrackEvent, TriggerEvent},
    scheduler::Job,
};


thread_local! {
    static OBSERVER: RefCell<Observer> = RefCell::new(Observer {
        stack: Vec::new(),
        should_track: true,
        track_stack: Vec::new(),
        next_id: 0,
    });
}

struct Observer {
    /// Effects currently executing, innermost last.
    stack: Vec<Rc<dyn AnyEffect>>,
    should_track: bool,
    track_stack: Vec<bool>,
    next_id: u64,
}

impl Observer {
    fn with<T>(f: impl FnOnce(&mut Observer) -> T) -> T {
        OBSERVER.with(|g| f(&mut g.borrow_mut()))
    }
}

/// Suspend dependency tracking until the matching [`reset_tracking`].
pub fn pause_tracking() {
    Observer::with(|o| {
        o.track_stack.push(o.should_track);
        o.should_track = false;
    });
}

/// Force-enable dependency tracking until the matching [`reset_tracking`].
pub fn enable_tracking() {
    Observer::with(|o| {
        o.track_stack.push(o.should_track);
        o.should_track = true;
    });
}

/// Restore the tracking state saved by the most recent
/// [`pause_tracking`]/[`enable_tracking`].
pub fn reset_tracking() {
    Observer::with(|o| {
        o.should_track = o.track_stack.pop().unwrap_or(true);
    });
}

/// Run `f` with tracking suspended, restoring the previous state on the way
/// out even if `f` panics.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    struct ResetGuard;
    impl Drop for ResetGuard {
        fn drop(&mut self) {
            reset_tracking();
        }
    }
    pause_tracking();
    let _guard = ResetGuard;
    f()
}

/// The effect the graph attributes reads to right now, if tracking is
/// enabled. Used by `track` as its precondition.
pub(crate) fn tracking_effect() -> Option<Rc<dyn AnyEffect>> {
    Observer::with(|o| {
        if o.should_track {
            o.stack.last().cloned()
        } else {
            None
        }
    })
}

/// Id of the innermost running effect, tracking state notwithstanding.
/// `trigger` compares candidates against this for the recursion gate.
pub(crate) fn active_effect_id() -> Option<u64> {
    Observer::with(|o| o.stack.last().map(|e| e.id()))
}

/// Read-only view of the currently running effect.
pub fn active_effect() -> Option<EffectRef> {
    Observer::with(|o| o.stack.last().cloned()).map(EffectRef)
}

/// Read-only view of an effect on the stack.
pub struct EffectRef(Rc<dyn AnyEffect>);

impl EffectRef {
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn is_active(&self) -> bool {
        self.0.is_active()
    }
}

/// Internal face of an effect node, as seen by the dependency graph.
pub(crate) trait AnyEffect {
    fn id(&self) -> u64;
    fn is_active(&self) -> bool;
    fn allow_recurse(&self) -> bool;
    fn track_dep(&self, dep: Dep, slot: DepKey);
    fn owns_dep(&self, dep: &Dep) -> bool;
    fn fire_track(&self, event: &TrackEvent);
    fn notify(self: Rc<Self>, event: &TriggerEvent);
}

struct TrackedDep {
    dep: Dep,
    slot: DepKey,
}

struct EffectNode<T: 'static> {
    id: u64,
    raw: Rc<RefCell<dyn FnMut() -> T>>,
    /// Shared with the effect's scheduler job so a stopped effect is also
    /// skipped by a drain that already holds the job.
    active: Rc<Cell<bool>>,
    allow_recurse: Cell<bool>,
    scheduler: Option<Rc<dyn Fn(Effect<T>)>>,
    on_track: Option<Rc<dyn Fn(&TrackEvent)>>,
    on_trigger: Option<Rc<dyn Fn(&TriggerEvent)>>,
    on_stop: Option<Rc<dyn Fn()>>,
    deps: RefCell<Vec<TrackedDep>>,
    job: RefCell<Option<Job>>,
}

impl<T> EffectNode<T> {
    /// Remove this effect from every dep it joined, then forget them.
    /// Dependencies are recollected from scratch on the next run.
    fn clear_deps(&self) {
        for tracked in self.deps.borrow_mut().drain(..) {
            tracked.dep.remove(tracked.slot);
        }
    }
}

impl<T> Drop for EffectNode<T> {
    fn drop(&mut self) {
        self.clear_deps();
    }
}

impl<T: 'static> AnyEffect for EffectNode<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn allow_recurse(&self) -> bool {
        self.allow_recurse.get()
    }

    fn track_dep(&self, dep: Dep, slot: DepKey) {
        self.deps.borrow_mut().push(TrackedDep { dep, slot });
    }

    fn owns_dep(&self, dep: &Dep) -> bool {
        self.deps
            .borrow()
            .iter()
            .any(|tracked| Dep::ptr_eq(&tracked.dep, dep))
    }

    fn fire_track(&self, event: &TrackEvent) {
        if let Some(on_track) = &self.on_track {
            on_track(event);
        }
    }

    fn notify(self: Rc<Self>, event: &TriggerEvent) {
        if let Some(on_trigger) = &self.on_trigger {
            on_trigger(event);
        }
        let scheduler = self.scheduler.clone();
        match scheduler {
            Some(scheduler) => scheduler(Effect(self)),
            None => {
                Effect(self).run();
            }
        }
    }
}

/// A recomputable unit of work whose reads are recorded as dependencies.
///
/// Handles are cheap clones of one underlying node. The node stays
/// subscribed only while a handle is alive: dep sets reference it weakly,
/// so dropping the last handle disarms the effect.
#[derive_ex(Clone, bound())]
pub struct Effect<T: 'static = ()>(Rc<EffectNode<T>>);

/// Creation options for [`make_effect`].
pub struct EffectOptions<T: 'static = ()> {
    /// Skip the initial run.
    pub lazy: bool,
    /// Permit this effect to re-queue itself from inside its own run.
    pub allow_recurse: bool,
    /// When present, `trigger` calls this instead of invoking the effect.
    pub scheduler: Option<Rc<dyn Fn(Effect<T>)>>,
    pub on_track: Option<Rc<dyn Fn(&TrackEvent)>>,
    pub on_trigger: Option<Rc<dyn Fn(&TriggerEvent)>>,
    pub on_stop: Option<Rc<dyn Fn()>>,
}

impl<T> Default for EffectOptions<T> {
    fn default() -> Self {
        Self {
            lazy: false,
            allow_recurse: false,
            scheduler: None,
            on_track: None,
            on_trigger: None,
            on_stop: None,
        }
    }
}

/// Create an effect around `f` and, unless `options.lazy`, run it once to
/// collect its initial dependencies.
pub fn make_effect<T: 'static>(
    f: impl FnMut() -> T + 'static,
    options: EffectOptions<T>,
) -> Effect<T> {
    make_effect_raw(Rc::new(RefCell::new(f)), options)
}

/// Create an effect sharing the callable of an existing effect.
///
/// This is the runner-unwrapping rule: building an effect from an effect
/// wraps the original function, not the outer effect machinery.
pub fn make_effect_from<T: 'static>(source: &Effect<T>, options: EffectOptions<T>) -> Effect<T> {
    make_effect_raw(source.0.raw.clone(), options)
}

fn make_effect_raw<T: 'static>(
    raw: Rc<RefCell<dyn FnMut() -> T>>,
    options: EffectOptions<T>,
) -> Effect<T> {
    let id = Observer::with(|o| {
        let id = o.next_id;
        o.next_id += 1;
        id
    });
    let effect = Effect(Rc::new(EffectNode {
        id,
        raw,
        active: Rc::new(Cell::new(true)),
        allow_recurse: Cell::new(options.allow_recurse),
        scheduler: options.scheduler,
        on_track: options.on_track,
        on_trigger: options.on_trigger,
        on_stop: options.on_stop,
        deps: RefCell::new(Vec::new()),
        job: RefCell::new(None),
    }));
    if !options.lazy {
        effect.run();
    }
    effect
}

/// Detach `effect` from the graph and disarm it. Idempotent.
pub fn stop<T: 'static>(effect: &Effect<T>) {
    effect.stop();
}

/// Restores the effect stack and tracking state on every exit path out of a
/// run, including panics propagating from the wrapped function.
struct RunGuard;

impl RunGuard {
    fn enter(node: Rc<dyn AnyEffect>) -> RunGuard {
        Observer::with(|o| {
            o.track_stack.push(o.should_track);
            o.should_track = true;
            o.stack.push(node);
        });
        RunGuard
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        Observer::with(|o| {
            o.stack.pop();
            o.should_track = o.track_stack.pop().unwrap_or(true);
        });
    }
}

impl<T: 'static> Effect<T> {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    /// Execute the wrapped function, recording its reads as dependencies.
    ///
    /// A stopped effect with a scheduler returns `None`; a stopped effect
    /// without one runs untracked and returns the result. An effect already
    /// on the stack returns `None` without running, which is what keeps a
    /// write inside an effect from re-entering that same effect.
    pub fn run(&self) -> Option<T> {
        let node = &self.0;
        if !node.active.get() {
            return match &node.scheduler {
                Some(_) => None,
                None => {
                    let mut raw = node.raw.borrow_mut();
                    Some((*raw)())
                }
            };
        }
        let on_stack = Observer::with(|o| o.stack.iter().any(|e| e.id() == node.id));
        if on_stack {
            return None;
        }
        node.clear_deps();
        let _guard = RunGuard::enter(node.clone() as Rc<dyn AnyEffect>);
        let mut raw = node.raw.borrow_mut();
        Some((*raw)())
    }

    /// Run `clear_deps`, fire `on_stop`, and disarm. No-op when already
    /// stopped.
    pub fn stop(&self) {
        if !self.0.active.get() {
            return;
        }
        self.0.clear_deps();
        if let Some(on_stop) = &self.0.on_stop {
            on_stop();
        }
        self.0.active.set(false);
    }

    /// The scheduler job for this effect.
    ///
    /// Identity-stable: every call returns the same job, so queue dedup
    /// treats repeated triggers of one effect as one unit of work. The job
    /// shares the effect's id, recursion flag, and active flag.
    pub fn job(&self) -> Job {
        if let Some(job) = &*self.0.job.borrow() {
            return job.clone();
        }
        let weak = Rc::downgrade(&self.0);
        let job = Job::for_effect(
            self.0.id,
            self.0.allow_recurse.get(),
            self.0.active.clone(),
            move || {
                if let Some(node) = weak.upgrade() {
                    Effect(node).run();
                }
            },
        );
        *self.0.job.borrow_mut() = Some(job.clone());
        job
    }

    #[cfg(test)]
    pub(crate) fn dep_count(&self) -> usize {
        self.0.deps.borrow().len()
    }
}

impl<T> std::fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.0.id)
            .field("active", &self.0.active.get())
            .finish()
    }
}
