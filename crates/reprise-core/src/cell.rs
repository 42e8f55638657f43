use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::config::EqualityPolicy;
use crate::reactive::{self, CellId};

pub type SubId = usize;

/// Observable storage location.
///
/// Reading through [`get`](Cell::get) or [`with`](Cell::with) while a node is
/// rendering subscribes that node; [`set`](Cell::set) and
/// [`update`](Cell::update) are the only ways to change the value and enqueue
/// every subscriber for the next recomposition pass.
pub struct Cell<T: 'static>(Rc<Inner<T>>);

struct Inner<T: 'static> {
    id: CellId,
    value: RefCell<T>,
    equality: Option<Equality<T>>,
    subs: RefCell<Vec<(SubId, Rc<dyn Fn(&T)>)>>,
    next_sub: std::cell::Cell<SubId>,
}

// Only present for SkipEqual cells.
struct Equality<T> {
    eq: fn(&T, &T) -> bool,
    snapshot: fn(&T) -> T,
}

impl<T: 'static> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.0.id)
            .field("value", &*self.0.value.borrow())
            .finish()
    }
}

impl<T: 'static> Cell<T> {
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    fn build(value: T, equality: Option<Equality<T>>) -> Self {
        Self(Rc::new(Inner {
            id: reactive::next_cell_id(),
            value: RefCell::new(value),
            equality,
            subs: RefCell::new(Vec::new()),
            next_sub: std::cell::Cell::new(0),
        }))
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    /// Whether both handles point at the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn policy(&self) -> EqualityPolicy {
        if self.0.equality.is_some() {
            EqualityPolicy::SkipEqual
        } else {
            EqualityPolicy::Always
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        reactive::register_cell_read(self.0.id);
        self.0.value.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        reactive::register_cell_read(self.0.id);
        f(&self.0.value.borrow())
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.0.value.borrow().clone()
    }

    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.value.borrow())
    }

    pub fn set(&self, v: T) {
        let changed = match &self.0.equality {
            Some(e) => !(e.eq)(&self.0.value.borrow(), &v),
            None => true,
        };
        *self.0.value.borrow_mut() = v;
        if changed {
            self.notify();
        }
    }

    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        let before = self
            .0
            .equality
            .as_ref()
            .map(|e| (e.snapshot)(&self.0.value.borrow()));
        f(&mut self.0.value.borrow_mut());
        let changed = match (&self.0.equality, before) {
            (Some(e), Some(before)) => !(e.eq)(&before, &self.0.value.borrow()),
            _ => true,
        };
        if changed {
            self.notify();
        }
    }

    /// Callback run synchronously after every notifying write.
    ///
    /// The callback must not write this same cell.
    pub fn subscribe(&self, f: impl Fn(&T) + 'static) -> SubId {
        let id = self.0.next_sub.get();
        self.0.next_sub.set(id + 1);
        self.0.subs.borrow_mut().push((id, Rc::new(f)));
        id
    }

    pub fn unsubscribe(&self, id: SubId) -> bool {
        let mut subs = self.0.subs.borrow_mut();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn notify(&self) {
        reactive::cell_changed(self.0.id);
        let subs: Vec<Rc<dyn Fn(&T)>> =
            self.0.subs.borrow().iter().map(|(_, s)| s.clone()).collect();
        if subs.is_empty() {
            return;
        }
        let v = self.0.value.borrow();
        for s in subs {
            s(&v);
        }
    }
}

impl<T: PartialEq + Clone + 'static> Cell<T> {
    pub fn with_policy(value: T, policy: EqualityPolicy) -> Self {
        let equality = match policy {
            EqualityPolicy::Always => None,
            EqualityPolicy::SkipEqual => Some(Equality {
                eq: <T as PartialEq>::eq,
                snapshot: <T as Clone>::clone,
            }),
        };
        Self::build(value, equality)
    }
}

impl<T: 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        reactive::forget_cell(self.id);
    }
}

pub fn cell<T: 'static>(t: T) -> Cell<T> {
    Cell::new(t)
}

pub fn cell_with_policy<T: PartialEq + Clone + 'static>(t: T, policy: EqualityPolicy) -> Cell<T> {
    Cell::with_policy(t, policy)
}
