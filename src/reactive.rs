use std::{cell::RefCell, collections::HashMap, rc::Rc};

use derive_ex::derive_ex;

use crate::graph::{self, PropKey, Target, TargetKind, TrackOp, TriggerOp};

#[cfg(test)]
mod tests;

/// Similar to `Rc<RefCell<T>>`, but reads inside an effect subscribe the
/// effect to writes.
#[derive_ex(Clone, bound())]
pub struct ReactiveCell<T: 'static>(Rc<CellNode<T>>);

struct CellNode<T> {
    target: Target,
    value: RefCell<T>,
}

impl<T: 'static> ReactiveCell<T> {
    pub fn new(value: T) -> Self {
        ReactiveCell(Rc::new(CellNode {
            target: Target::register(TargetKind::Plain),
            value: RefCell::new(value),
        }))
    }

    /// Current value, tracked.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Borrow the current value for the duration of `f`, tracked.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        graph::track(&self.0.target, TrackOp::Get, PropKey::Value);
        f(&self.0.value.borrow())
    }

    pub fn set(&self, value: T) {
        *self.0.value.borrow_mut() = value;
        graph::trigger(&self.0.target, TriggerOp::Set, Some(PropKey::Value), None);
    }

    /// Set the value, notifying only if it changed.
    pub fn set_dedup(&self, value: T)
    where
        T: PartialEq,
    {
        let changed = {
            let mut current = self.0.value.borrow_mut();
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        };
        if changed {
            graph::trigger(&self.0.target, TriggerOp::Set, Some(PropKey::Value), None);
        }
    }

    /// Mutate the value in place and notify.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.0.value.borrow_mut());
        graph::trigger(&self.0.target, TriggerOp::Set, Some(PropKey::Value), None);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReactiveCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.value.try_borrow() {
            Ok(value) => std::fmt::Debug::fmt(&*value, f),
            Err(_) => write!(f, "<borrowed>"),
        }
    }
}

/// String-keyed reactive map. Keyed reads track the key; iteration-shaped
/// reads track the iteration sentinels, so structural writes reach them.
#[derive_ex(Clone, bound())]
pub struct ReactiveMap<V: 'static>(Rc<MapNode<V>>);

struct MapNode<V> {
    target: Target,
    entries: RefCell<HashMap<Rc<str>, V>>,
}

impl<V: 'static> ReactiveMap<V> {
    pub fn new() -> Self {
        ReactiveMap(Rc::new(MapNode {
            target: Target::register(TargetKind::Map),
            entries: RefCell::new(HashMap::new()),
        }))
    }

    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        graph::track(&self.0.target, TrackOp::Get, key);
        self.0.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        graph::track(&self.0.target, TrackOp::Has, key);
        self.0.entries.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        graph::track(&self.0.target, TrackOp::Iterate, PropKey::Iterate);
        self.0.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        graph::track(&self.0.target, TrackOp::Iterate, PropKey::MapKeyIterate);
        self.0.entries.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        graph::track(&self.0.target, TrackOp::Iterate, PropKey::Iterate);
        self.0.entries.borrow().values().cloned().collect()
    }

    pub fn insert(&self, key: &str, value: V) -> Option<V> {
        let previous = self.0.entries.borrow_mut().insert(Rc::from(key), value);
        let op = if previous.is_some() {
            TriggerOp::Set
        } else {
            TriggerOp::Add
        };
        graph::trigger(&self.0.target, op, Some(PropKey::from(key)), None);
        previous
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.0.entries.borrow_mut().remove(key);
        if removed.is_some() {
            graph::trigger(
                &self.0.target,
                TriggerOp::Delete,
                Some(PropKey::from(key)),
                None,
            );
        }
        removed
    }

    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.0.entries.borrow_mut();
            let had_entries = !entries.is_empty();
            entries.clear();
            had_entries
        };
        if had_entries {
            graph::trigger(&self.0.target, TriggerOp::Clear, None, None);
        }
    }
}

impl<V: 'static> Default for ReactiveMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reactive growable sequence. Element reads track the index, length reads
/// track `length`, and length-shrinking writes fan out to every index dep
/// at or past the new length.
#[derive_ex(Clone, bound())]
pub struct ReactiveList<T: 'static>(Rc<ListNode<T>>);

struct ListNode<T> {
    target: Target,
    items: RefCell<Vec<T>>,
}

impl<T: 'static> ReactiveList<T> {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        ReactiveList(Rc::new(ListNode {
            target: Target::register(TargetKind::List),
            items: RefCell::new(items),
        }))
    }

    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        graph::track(&self.0.target, TrackOp::Get, PropKey::Index(index));
        self.0.items.borrow().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        graph::track(&self.0.target, TrackOp::Get, PropKey::Length);
        self.0.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the whole sequence, subscribing to the length and every
    /// element read.
    pub fn iter_snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        graph::track(&self.0.target, TrackOp::Iterate, PropKey::Length);
        let len = self.0.items.borrow().len();
        let mut out = Vec::with_capacity(len);
        for index in 0..len {
            graph::track(&self.0.target, TrackOp::Get, PropKey::Index(index));
            out.push(self.0.items.borrow()[index].clone());
        }
        out
    }

    /// Write an element in bounds, or append when `index` equals the length.
    pub fn set(&self, index: usize, value: T) {
        let len = self.0.items.borrow().len();
        if index < len {
            self.0.items.borrow_mut()[index] = value;
            graph::trigger(
                &self.0.target,
                TriggerOp::Set,
                Some(PropKey::Index(index)),
                None,
            );
        } else if index == len {
            self.push(value);
        } else {
            panic!("index out of bounds: the len is {len} but the index is {index}");
        }
    }

    pub fn push(&self, value: T) {
        let index = {
            let mut items = self.0.items.borrow_mut();
            items.push(value);
            items.len() - 1
        };
        graph::trigger(
            &self.0.target,
            TriggerOp::Add,
            Some(PropKey::Index(index)),
            None,
        );
    }

    pub fn pop(&self) -> Option<T> {
        let (popped, new_len) = {
            let mut items = self.0.items.borrow_mut();
            let popped = items.pop();
            (popped, items.len())
        };
        if popped.is_some() {
            graph::trigger(
                &self.0.target,
                TriggerOp::Set,
                Some(PropKey::Length),
                Some(new_len),
            );
        }
        popped
    }

    pub fn truncate(&self, new_len: usize) {
        let shrank = {
            let mut items = self.0.items.borrow_mut();
            if new_len < items.len() {
                items.truncate(new_len);
                true
            } else {
                false
            }
        };
        if shrank {
            graph::trigger(
                &self.0.target,
                TriggerOp::Set,
                Some(PropKey::Length),
                Some(new_len),
            );
        }
    }
}

impl<T: 'static> Default for ReactiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}
