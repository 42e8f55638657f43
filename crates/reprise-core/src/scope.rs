use std::cell::RefCell;
use std::rc::Rc;

/// Cleanups owned by one render node; run when the node leaves the
/// composition.
pub struct Scope {
    inner: Rc<ScopeInner>,
}

struct ScopeInner {
    disposers: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                disposers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn add_disposer(&self, disposer: impl FnOnce() + 'static) {
        self.inner.disposers.borrow_mut().push(Box::new(disposer));
    }

    pub fn len(&self) -> usize {
        self.inner.disposers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs disposers in reverse registration order. Disposers added while
    /// disposing run too.
    pub fn dispose(&self) {
        loop {
            let disposers = std::mem::take(&mut *self.inner.disposers.borrow_mut());
            if disposers.is_empty() {
                break;
            }
            for disposer in disposers.into_iter().rev() {
                disposer();
            }
        }
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
