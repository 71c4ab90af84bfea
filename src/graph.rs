use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use parse_display::Display;
use slabmap::SlabMap;

use crate::effect::{self, AnyEffect};

#[cfg(test)]
mod tests;

/// Identity of a tracked target. Stable for the lifetime of its [`Target`]
/// handle, never reused within a thread.
pub type TargetId = u64;

/// Shape of a tracked target, selecting which trigger fan-out rules apply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetKind {
    Plain,
    List,
    Map,
}

/// A property coordinate within a target.
///
/// `Iterate` and `MapKeyIterate` are the iteration sentinels: interceptors
/// register against them to depend on "the act of iterating this container"
/// without binding to a concrete element key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Display)]
pub enum PropKey {
    #[display("{0}")]
    Named(Rc<str>),
    #[display("[{0}]")]
    Index(usize),
    #[display("length")]
    Length,
    #[display("value")]
    Value,
    #[display("<iterate>")]
    Iterate,
    #[display("<map-key-iterate>")]
    MapKeyIterate,
}

impl From<&str> for PropKey {
    fn from(key: &str) -> Self {
        PropKey::Named(Rc::from(key))
    }
}

impl From<String> for PropKey {
    fn from(key: String) -> Self {
        PropKey::Named(Rc::from(key.as_str()))
    }
}

impl From<usize> for PropKey {
    fn from(index: usize) -> Self {
        PropKey::Index(index)
    }
}

/// Read operations reported through [`track`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
#[display(style = "lowercase")]
pub enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// Write operations reported through [`trigger`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
#[display(style = "lowercase")]
pub enum TriggerOp {
    Set,
    Add,
    Delete,
    Clear,
}

/// Payload handed to an effect's `on_track` observer.
#[derive(Clone, Debug)]
pub struct TrackEvent {
    pub target: TargetId,
    pub op: TrackOp,
    pub key: PropKey,
}

/// Payload handed to an effect's `on_trigger` observer.
#[derive(Clone, Debug)]
pub struct TriggerEvent {
    pub target: TargetId,
    pub op: TriggerOp,
    pub key: Option<PropKey>,
}

/// The set of effects subscribed to one `(target, key)` coordinate.
///
/// Entries are weak: an effect dropped without `stop` simply stops being
/// reachable. The slot key returned by `add` is stored on the effect side,
/// so cleanup removes a membership without searching.
#[derive(Clone)]
pub(crate) struct Dep(Rc<RefCell<SlabMap<Weak<dyn AnyEffect>>>>);

pub(crate) type DepKey = usize;

impl Dep {
    fn new() -> Self {
        Dep(Rc::new(RefCell::new(SlabMap::new())))
    }

    pub(crate) fn add(&self, effect: &Rc<dyn AnyEffect>) -> DepKey {
        self.0.borrow_mut().insert(Rc::downgrade(effect))
    }

    pub(crate) fn remove(&self, key: DepKey) {
        self.0.borrow_mut().remove(key);
    }

    pub(crate) fn ptr_eq(a: &Dep, b: &Dep) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Snapshot of the live subscribers. Taken before dispatch so that
    /// re-tracking during an effect run cannot extend the iteration.
    fn effects(&self) -> Vec<Rc<dyn AnyEffect>> {
        let mut entries = self.0.borrow_mut();
        entries.optimize();
        entries.values().filter_map(Weak::upgrade).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

struct TargetEntry {
    kind: TargetKind,
    deps: HashMap<PropKey, Dep>,
}

struct GraphState {
    targets: HashMap<TargetId, TargetEntry>,
    next_id: TargetId,
}

impl GraphState {
    fn with<T>(f: impl FnOnce(&mut GraphState) -> T) -> T {
        GRAPH.with(|g| f(&mut g.borrow_mut()))
    }
}

thread_local! {
    static GRAPH: RefCell<GraphState> = RefCell::new(GraphState {
        targets: HashMap::new(),
        next_id: 0,
    });
}

/// Registration handle for an observable object.
///
/// The graph entry lives exactly as long as the last clone of this handle;
/// dropping it releases every dep registered under the target, so a target
/// abandoned by user code cannot keep the graph entry alive.
#[derive(Clone)]
pub struct Target(Rc<TargetHandle>);

struct TargetHandle {
    id: TargetId,
    kind: TargetKind,
}

impl Target {
    pub fn register(kind: TargetKind) -> Target {
        let id = GraphState::with(|g| {
            let id = g.next_id;
            g.next_id += 1;
            g.targets.insert(
                id,
                TargetEntry {
                    kind,
                    deps: HashMap::new(),
                },
            );
            id
        });
        Target(Rc::new(TargetHandle { id, kind }))
    }

    pub fn id(&self) -> TargetId {
        self.0.id
    }

    pub fn kind(&self) -> TargetKind {
        self.0.kind
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl Drop for TargetHandle {
    fn drop(&mut self) {
        // Tolerates thread teardown, where the graph may already be gone.
        let _ = GRAPH.try_with(|g| {
            g.borrow_mut().targets.remove(&self.id);
        });
    }
}

/// Record a read edge from the running effect to `(target, key)`.
///
/// No-op unless tracking is enabled and an effect is on the stack. The
/// `key → dep` entry is created lazily; the effect joins the dep at most
/// once per run, and joining fires its `on_track` observer.
pub fn track(target: &Target, op: TrackOp, key: impl Into<PropKey>) {
    let Some(effect) = effect::tracking_effect() else {
        return;
    };
    let key = key.into();
    let dep = GraphState::with(|g| {
        let entry = g.targets.get_mut(&target.id())?;
        Some(entry.deps.entry(key.clone()).or_insert_with(Dep::new).clone())
    });
    let Some(dep) = dep else {
        return;
    };
    if effect.owns_dep(&dep) {
        return;
    }
    let slot = dep.add(&effect);
    effect.track_dep(dep, slot);
    effect.fire_track(&TrackEvent {
        target: target.id(),
        op,
        key,
    });
}

/// Fan a write on `(target, key)` out to the subscribed effects.
///
/// `new_len` is only interpreted for `Set` writes to `PropKey::Length` on a
/// list target: every integer-keyed dep at an index not below it fires along
/// with the length dep itself. Effects equal to the currently running effect
/// are skipped unless they opted into recursion. Each collected effect has
/// its `on_trigger` observer fired, then is handed to its scheduler callback
/// when one is configured, or invoked directly otherwise.
pub fn trigger(target: &Target, op: TriggerOp, key: Option<PropKey>, new_len: Option<usize>) {
    let deps = GraphState::with(|g| {
        let mut deps = Vec::new();
        let Some(entry) = g.targets.get(&target.id()) else {
            return deps;
        };
        collect_deps(entry, op, &key, new_len, &mut deps);
        deps
    });
    if deps.is_empty() {
        return;
    }

    let active_id = effect::active_effect_id();
    let mut to_run: Vec<Rc<dyn AnyEffect>> = Vec::new();
    for dep in &deps {
        for effect in dep.effects() {
            if Some(effect.id()) == active_id && !effect.allow_recurse() {
                continue;
            }
            if to_run.iter().any(|e| e.id() == effect.id()) {
                continue;
            }
            to_run.push(effect);
        }
    }

    let event = TriggerEvent {
        target: target.id(),
        op,
        key,
    };
    for effect in to_run {
        effect.notify(&event);
    }
}

fn collect_deps(
    entry: &TargetEntry,
    op: TriggerOp,
    key: &Option<PropKey>,
    new_len: Option<usize>,
    deps: &mut Vec<Dep>,
) {
    if op == TriggerOp::Clear {
        deps.extend(entry.deps.values().cloned());
        return;
    }

    if matches!(key, Some(PropKey::Length))
        && entry.kind == TargetKind::List
        && op == TriggerOp::Set
    {
        // Without a provided length, every index dep conservatively fires.
        let new_len = new_len.unwrap_or(0);
        for (k, dep) in &entry.deps {
            match k {
                PropKey::Length => deps.push(dep.clone()),
                PropKey::Index(index) if *index >= new_len => deps.push(dep.clone()),
                _ => {}
            }
        }
        return;
    }

    let Some(key) = key else {
        return;
    };
    if let Some(dep) = entry.deps.get(key) {
        deps.push(dep.clone());
    }
    let push = |deps: &mut Vec<Dep>, key: &PropKey| {
        if let Some(dep) = entry.deps.get(key) {
            deps.push(dep.clone());
        }
    };
    match op {
        TriggerOp::Add => {
            if entry.kind != TargetKind::List {
                push(deps, &PropKey::Iterate);
                if entry.kind == TargetKind::Map {
                    push(deps, &PropKey::MapKeyIterate);
                }
            } else if matches!(key, PropKey::Index(_)) {
                push(deps, &PropKey::Length);
            }
        }
        TriggerOp::Delete => {
            if entry.kind != TargetKind::List {
                push(deps, &PropKey::Iterate);
                if entry.kind == TargetKind::Map {
                    push(deps, &PropKey::MapKeyIterate);
                }
            }
        }
        TriggerOp::Set => {
            if entry.kind == TargetKind::Map {
                push(deps, &PropKey::Iterate);
            }
        }
        TriggerOp::Clear => unreachable!(),
    }
}

#[cfg(test)]
pub(crate) fn dep_len(target: &Target, key: &PropKey) -> usize {
    GraphState::with(|g| {
        g.targets
            .get(&target.id())
            .and_then(|entry| entry.deps.get(key))
            .map(|dep| dep.len())
            .unwrap_or(0)
    })
}
