use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::{current, remember_with_key};

#[derive(Clone)]
pub struct Dispose(Rc<RefCell<Option<Box<dyn FnOnce()>>>>);

impl Dispose {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(f)))))
    }

    pub fn noop() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    /// Runs at most once (safe to call multiple times).
    pub fn run(&self) {
        let f = self.0.borrow_mut().take();
        if let Some(f) = f {
            f()
        }
    }
}

/// Helper to build the cleanup returned from a `disposable_effect`.
pub fn on_unmount(f: impl FnOnce() + 'static) -> Dispose {
    Dispose::new(f)
}

/// Runs `effect` after the current render has committed.
///
/// Effects queued by a render that fails are dropped. Outside a composition
/// `effect` runs immediately.
pub fn side_effect(effect: impl FnOnce() + 'static) {
    match current() {
        Some((_, node)) => node.side_effects.borrow_mut().push(Box::new(effect)),
        None => effect(),
    }
}

struct DisposableState<K> {
    dep: Option<K>,
    cleanup: Option<Dispose>,
    installed: bool,
}

/// Runs `effect` after the first successful render and again whenever `dep`
/// changes, running the previous cleanup first. The last cleanup runs when
/// the node is disposed.
pub fn disposable_effect<K: PartialEq + Clone + 'static>(
    key: impl Into<String>,
    dep: K,
    effect: impl FnOnce() -> Dispose + 'static,
) {
    let key = key.into();
    let Some((_, node)) = current() else {
        log::warn!("disposable_effect('{key}') called outside a composition; ignored");
        return;
    };
    let state = remember_with_key(format!("disposable:{key}"), || {
        RefCell::new(DisposableState::<K> {
            dep: None,
            cleanup: None,
            installed: false,
        })
    });

    // Install a single unmount disposer for this slot.
    if !state.borrow().installed {
        state.borrow_mut().installed = true;
        let state = state.clone();
        node.scope.add_disposer(move || {
            let cleanup = state.borrow_mut().cleanup.take();
            if let Some(d) = cleanup {
                d.run();
            }
        });
    }

    if state.borrow().dep.as_ref() == Some(&dep) {
        return;
    }
    node.push_commit(move |_| {
        let previous = state.borrow_mut().cleanup.take();
        if let Some(d) = previous {
            d.run();
        }
        let d = effect();
        let mut s = state.borrow_mut();
        s.dep = Some(dep);
        s.cleanup = Some(d);
    });
}
