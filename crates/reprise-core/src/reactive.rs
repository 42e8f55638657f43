use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::node::NodeId;

pub type CellId = u64;

thread_local! {
    static CURRENT_OBSERVER: RefCell<Option<NodeId>> = const { RefCell::new(None) };
    static GRAPH: RefCell<DepGraph> = RefCell::new(DepGraph::default());
}

#[derive(Default)]
struct DepGraph {
    next_cell: CellId,
    // cell_id -> nodes that read it during their last render
    edges: HashMap<CellId, HashSet<NodeId>>,
    // node_id -> cells it read
    back: HashMap<NodeId, HashSet<CellId>>,
    // nodes waiting for the next recomposition pass, in enqueue order
    dirty: Vec<NodeId>,
    dirty_set: HashSet<NodeId>,
}

impl DepGraph {
    fn remove_all_edges_for(&mut self, obs: NodeId) -> HashSet<CellId> {
        let cells = self.back.remove(&obs).unwrap_or_default();
        for c in &cells {
            if let Some(set) = self.edges.get_mut(c) {
                set.remove(&obs);
                if set.is_empty() {
                    self.edges.remove(c);
                }
            }
        }
        cells
    }

    fn link(&mut self, cell: CellId, obs: NodeId) {
        self.edges.entry(cell).or_default().insert(obs);
        self.back.entry(obs).or_default().insert(cell);
    }

    fn mark_dirty(&mut self, obs: NodeId) {
        if self.dirty_set.insert(obs) {
            self.dirty.push(obs);
        }
    }
}

pub(crate) fn next_cell_id() -> CellId {
    GRAPH.with(|g| {
        let mut g = g.borrow_mut();
        let id = g.next_cell;
        g.next_cell += 1;
        id
    })
}

pub(crate) fn register_cell_read(cell: CellId) {
    CURRENT_OBSERVER.with(|co| {
        if let Some(obs) = *co.borrow() {
            GRAPH.with(|g| g.borrow_mut().link(cell, obs));
        }
    });
}

/// Enqueue every node subscribed to `cell`.
pub(crate) fn cell_changed(cell: CellId) {
    GRAPH.with(|g| {
        let mut g = g.borrow_mut();
        let subscribers: Vec<NodeId> = g
            .edges
            .get(&cell)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for obs in subscribers {
            g.mark_dirty(obs);
        }
    });
}

/// Drop all edges of a cell that no longer exists.
pub(crate) fn forget_cell(cell: CellId) {
    // The graph may already be gone during thread teardown.
    let _ = GRAPH.try_with(|g| {
        let mut g = g.borrow_mut();
        if let Some(nodes) = g.edges.remove(&cell) {
            for n in nodes {
                if let Some(set) = g.back.get_mut(&n) {
                    set.remove(&cell);
                }
            }
        }
    });
}

pub(crate) fn mark_dirty(obs: NodeId) {
    GRAPH.with(|g| g.borrow_mut().mark_dirty(obs));
}

pub(crate) fn clear_dirty(obs: NodeId) {
    GRAPH.with(|g| {
        let mut g = g.borrow_mut();
        if g.dirty_set.remove(&obs) {
            g.dirty.retain(|n| *n != obs);
        }
    });
}

pub(crate) fn take_dirty() -> Vec<NodeId> {
    GRAPH.with(|g| {
        let mut g = g.borrow_mut();
        g.dirty_set.clear();
        std::mem::take(&mut g.dirty)
    })
}

pub(crate) fn has_dirty() -> bool {
    GRAPH.with(|g| !g.borrow().dirty.is_empty())
}

pub(crate) fn is_dirty(obs: NodeId) -> bool {
    GRAPH.with(|g| g.borrow().dirty_set.contains(&obs))
}

/// Remove a node and all of its dependency edges.
pub(crate) fn remove_observer(obs: NodeId) {
    let _ = GRAPH.try_with(|g| {
        let mut g = g.borrow_mut();
        g.remove_all_edges_for(obs);
        if g.dirty_set.remove(&obs) {
            g.dirty.retain(|n| *n != obs);
        }
    });
}

/// Cells `obs` currently depends on.
pub fn dependencies_of(obs: NodeId) -> HashSet<CellId> {
    GRAPH.with(|g| g.borrow().back.get(&obs).cloned().unwrap_or_default())
}

/// Number of nodes subscribed to `cell`.
pub fn subscriber_count(cell: CellId) -> usize {
    GRAPH.with(|g| g.borrow().edges.get(&cell).map_or(0, |s| s.len()))
}

struct ObserverGuard {
    prev: Option<NodeId>,
}

impl ObserverGuard {
    fn enter(obs: Option<NodeId>) -> Self {
        let prev = CURRENT_OBSERVER.with(|co| std::mem::replace(&mut *co.borrow_mut(), obs));
        Self { prev }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT_OBSERVER.try_with(|co| *co.borrow_mut() = prev);
    }
}

/// Run `f` with `obs` as the tracking context, rebuilding its dependency set
/// from scratch. Returns the previous dependency set so a failed render can
/// put it back with [`restore_dependencies`].
pub(crate) fn track<R>(obs: NodeId, f: impl FnOnce() -> R) -> (R, HashSet<CellId>) {
    let previous = GRAPH.with(|g| g.borrow_mut().remove_all_edges_for(obs));
    let _guard = ObserverGuard::enter(Some(obs));
    (f(), previous)
}

/// Re-link `cells` to `obs` in addition to whatever it read so far.
pub(crate) fn restore_dependencies(obs: NodeId, cells: HashSet<CellId>) {
    GRAPH.with(|g| {
        let mut g = g.borrow_mut();
        for c in cells {
            g.link(c, obs);
        }
    });
}

/// Run `f` without a tracking context; reads inside do not subscribe.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ObserverGuard::enter(None);
    f()
}

pub fn current_observer() -> Option<NodeId> {
    CURRENT_OBSERVER.with(|co| *co.borrow())
}
