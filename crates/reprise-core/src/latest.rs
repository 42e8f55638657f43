use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::runtime::{current, slot_get, slot_put};

/// Holder refreshed with the newest value on every render of its node.
///
/// Long-lived tasks read [`current`](LatestHolder::current) instead of
/// capturing the value, so they act on what the node saw last rather than on
/// what it saw when the task started. Reading a holder never subscribes.
pub struct LatestHolder<T>(Rc<RefCell<T>>);

impl<T> Clone for LatestHolder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for LatestHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LatestHolder").field(&*self.0.borrow()).finish()
    }
}

impl<T> LatestHolder<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    pub fn current(&self) -> T
    where
        T: Clone,
    {
        self.0.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.borrow())
    }

    fn replace(&self, value: T) {
        *self.0.borrow_mut() = value;
    }
}

/// Retained holder for `value`, overwritten on every call.
pub fn latest<T: 'static>(key: impl Into<String>, value: T) -> LatestHolder<T> {
    let Some((_, node)) = current() else {
        return LatestHolder::new(value);
    };
    let slot_key = format!("latest:{}", key.into());
    if let Some(h) = slot_get::<LatestHolder<T>>(&node, &slot_key) {
        h.replace(value);
        return h;
    }
    let h = LatestHolder::new(value);
    slot_put(&node, slot_key, h.clone());
    h
}

/// `latest` keyed by its call site.
#[macro_export]
macro_rules! latest {
    ($value:expr) => {
        $crate::latest::latest(
            concat!(module_path!(), ":", line!(), ":", column!()),
            $value,
        )
    };
}
