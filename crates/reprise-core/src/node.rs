use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::bundle::BundleValue;
use crate::runtime::RuntimeInner;
use crate::scope::Scope;

new_key_type! {
    /// Identity of a render node inside one recomposer.
    pub struct NodeId;
}

pub(crate) type RenderFn = Rc<dyn Fn() -> anyhow::Result<()>>;
pub(crate) type Commit = Box<dyn FnOnce(&Rc<RuntimeInner>)>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub(crate) struct NodeFlags: u8 {
        const RENDERING = 1 << 0;
    }
}

/// Saves one persistent slot into the bundle.
pub(crate) struct Persister {
    pub bundle_key: String,
    pub save: Box<dyn Fn() -> Option<BundleValue>>,
}

pub(crate) struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub path: String,
    pub depth: usize,
    pub render: RefCell<RenderFn>,
    pub flags: std::cell::Cell<NodeFlags>,
    pub children: RefCell<Vec<(String, NodeId)>>,
    pub slots: RefCell<HashMap<String, Box<dyn Any>>>,
    pub persisters: RefCell<Vec<Persister>>,
    pub scope: Scope,
    // Per-render scratch, reset at the start of every invocation.
    pub declared: RefCell<SmallVec<[String; 4]>>,
    pub commits: RefCell<Vec<Commit>>,
    pub side_effects: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Node {
    pub fn new(
        id: NodeId,
        parent: Option<&Node>,
        key: impl Into<String>,
        render: RenderFn,
    ) -> Self {
        let key = key.into();
        let (path, depth) = match parent {
            Some(p) => (format!("{}/{}", p.path, key), p.depth + 1),
            None => (key, 0),
        };
        Self {
            id,
            parent: parent.map(|p| p.id),
            path,
            depth,
            render: RefCell::new(render),
            flags: std::cell::Cell::new(NodeFlags::empty()),
            children: RefCell::new(Vec::new()),
            slots: RefCell::new(HashMap::new()),
            persisters: RefCell::new(Vec::new()),
            scope: Scope::new(),
            declared: RefCell::new(SmallVec::new()),
            commits: RefCell::new(Vec::new()),
            side_effects: RefCell::new(Vec::new()),
        }
    }

    pub fn has(&self, flag: NodeFlags) -> bool {
        self.flags.get().contains(flag)
    }

    pub fn set(&self, flag: NodeFlags, on: bool) {
        let mut f = self.flags.get();
        f.set(flag, on);
        self.flags.set(f);
    }

    pub fn child_id(&self, key: &str) -> Option<NodeId> {
        self.children
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, id)| *id)
    }

    /// Queue work to run only if the current render succeeds.
    pub fn push_commit(&self, f: impl FnOnce(&Rc<RuntimeInner>) + 'static) {
        self.commits.borrow_mut().push(Box::new(f));
    }

    pub fn begin_render(&self) {
        self.declared.borrow_mut().clear();
        self.commits.borrow_mut().clear();
        self.side_effects.borrow_mut().clear();
    }

    /// Marks the node as rendering until the guard drops, unwinding included.
    pub fn rendering(&self) -> RenderingGuard<'_> {
        self.set(NodeFlags::RENDERING, true);
        RenderingGuard(self)
    }

    /// Snapshot every persistent slot of this node.
    pub fn saved_values(&self) -> Vec<(String, BundleValue)> {
        self.persisters
            .borrow()
            .iter()
            .filter_map(|p| {
                let saved = (p.save)();
                if saved.is_none() {
                    log::warn!(
                        "slot '{}' has no bundle encoding for its current value; not saved",
                        p.bundle_key
                    );
                }
                saved.map(|v| (p.bundle_key.clone(), v))
            })
            .collect()
    }
}

pub(crate) struct RenderingGuard<'a>(&'a Node);

impl Drop for RenderingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(NodeFlags::RENDERING, false);
    }
}
