use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::node::NodeId;
use crate::runtime::{current, remember_with_key};
use crate::task::{TaskHandle, TaskScope};

/// Task scope tied to the current node; launch from event handlers.
///
/// Outside a composition the returned scope is inert and every launch fails
/// with [`Error::NodeRemoved`](crate::Error::NodeRemoved).
pub fn remember_task_scope(key: impl Into<String>) -> TaskScope {
    let key = key.into();
    let Some((rt, node)) = current() else {
        log::warn!("remember_task_scope('{key}') called outside a composition");
        return TaskScope::new(Weak::new(), NodeId::default(), key);
    };
    let scope = remember_with_key(format!("task_scope:{key}"), || {
        TaskScope::new(Rc::downgrade(&rt), node.id, format!("{}#{}", node.path, key))
    });
    (*scope).clone()
}

struct LaunchState<K> {
    dep: Option<K>,
    handle: Option<TaskHandle>,
}

/// Launch the future built by `make` once the current render commits, and
/// relaunch it (cancelling the running one) whenever `dep` differs from the
/// value seen at the previous launch. The task is cancelled when the node is
/// disposed.
///
/// A task that should act on values changing while it runs reads them from a
/// [`LatestHolder`](crate::LatestHolder) instead of capturing them.
pub fn launched_effect<K, F, Fut>(key: impl Into<String>, dep: K, make: F)
where
    K: PartialEq + 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    let key = key.into();
    let Some((_, node)) = current() else {
        log::warn!("launched_effect('{key}') called outside a composition; ignored");
        return;
    };
    let state = remember_with_key(format!("launched:{key}"), || {
        RefCell::new(LaunchState::<K> {
            dep: None,
            handle: None,
        })
    });
    if state.borrow().dep.as_ref() == Some(&dep) {
        return;
    }

    let owner = node.id;
    let label = format!("{}#{}", node.path, key);
    node.push_commit(move |rt| {
        let previous = state.borrow_mut().handle.take();
        if let Some(h) = previous {
            h.cancel();
        }
        let launched = rt.spawn(owner, label, make());
        let mut s = state.borrow_mut();
        s.dep = Some(dep);
        match launched {
            Ok(h) => s.handle = Some(h),
            Err(e) => log::warn!("launched_effect: {e}"),
        }
    });
}

/// `launched_effect` keyed by its call site.
#[macro_export]
macro_rules! launched_effect {
    ($dep:expr, $make:expr) => {
        $crate::effects_ext::launched_effect(
            concat!(module_path!(), ":", line!(), ":", column!()),
            $dep,
            $make,
        )
    };
}
