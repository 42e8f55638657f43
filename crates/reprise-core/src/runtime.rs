use std::any::type_name;
use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use slotmap::SlotMap;
use smallvec::SmallVec;
use web_time::Instant;

use crate::bundle::{self, Bundle, PrimitiveSaver, Saver};
use crate::cell::Cell;
use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result, panic_message};
use crate::node::{Node, NodeFlags, NodeId, Persister, RenderFn};
use crate::reactive;
use crate::task::{Executor, TaskHandle, TaskScope};
use crate::view_model::ViewModelStore;

thread_local! {
    // Nodes whose render closure is currently on the stack, innermost last.
    static COMPOSITION: RefCell<Vec<(Rc<RuntimeInner>, Rc<Node>)>> = const { RefCell::new(Vec::new()) };
    // The dependency graph is per thread, so only one root may be mounted on it.
    static THREAD_MOUNTED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

struct FrameGuard;

impl FrameGuard {
    fn enter(rt: Rc<RuntimeInner>, node: Rc<Node>) -> Self {
        COMPOSITION.with(|c| c.borrow_mut().push((rt, node)));
        FrameGuard
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let _ = COMPOSITION.try_with(|c| c.borrow_mut().pop());
    }
}

pub(crate) fn current() -> Option<(Rc<RuntimeInner>, Rc<Node>)> {
    COMPOSITION.with(|c| c.borrow().last().cloned())
}

/// Node whose render closure is running, if any.
pub fn current_node() -> Option<NodeId> {
    current().map(|(_, n)| n.id)
}

/// Slash-separated key path of the rendering node.
pub fn current_path() -> Option<String> {
    current().map(|(_, n)| n.path.clone())
}

pub(crate) fn slot_get<T: Clone + 'static>(node: &Node, key: &str) -> Option<T> {
    let slots = node.slots.borrow();
    let existing = slots.get(key)?;
    match existing.downcast_ref::<T>() {
        Some(v) => Some(v.clone()),
        None => {
            log::warn!(
                "slot '{}' on `{}` reused with a different type; replacing.",
                key,
                node.path
            );
            None
        }
    }
}

pub(crate) fn slot_put<T: 'static>(node: &Node, key: String, value: T) {
    node.slots.borrow_mut().insert(key, Box::new(value));
}

/// Key-based remember: the value lives as long as the rendering node.
///
/// Outside a render the value is built fresh every call.
pub fn remember_with_key<T: 'static>(key: impl Into<String>, init: impl FnOnce() -> T) -> Rc<T> {
    let key = key.into();
    let Some((_, node)) = current() else {
        log::warn!("remember_with_key('{key}') called outside a composition; value is not retained");
        return Rc::new(init());
    };
    if let Some(rc) = slot_get::<Rc<T>>(&node, &key) {
        return rc;
    }
    let rc = Rc::new(init());
    slot_put(&node, key, rc.clone());
    rc
}

pub fn remember_state_with_key<T: 'static>(
    key: impl Into<String>,
    init: impl FnOnce() -> T,
) -> Rc<RefCell<T>> {
    remember_with_key(key, || RefCell::new(init()))
}

/// Retained cell: the same instance for every recomposition of the current
/// node, a fresh one after the node is disposed and recreated.
pub fn retain<T: 'static>(key: impl Into<String>, factory: impl FnOnce() -> T) -> Cell<T> {
    let key = key.into();
    let Some((_, node)) = current() else {
        log::warn!("retain('{key}') called outside a composition; cell is not retained");
        return Cell::new(factory());
    };
    let slot_key = format!("cell:{key}");
    if let Some(c) = slot_get::<Cell<T>>(&node, &slot_key) {
        return c;
    }
    let c = Cell::new(factory());
    slot_put(&node, slot_key, c.clone());
    c
}

/// Retained cell that is also saved to the bundle when its node is disposed
/// and restored from it on first creation.
///
/// Only primitive kinds are accepted; anything else fails with
/// [`Error::Configuration`] before the slot is created. Use
/// [`retain_persistent_with`] and a [`Saver`] for other types.
pub fn retain_persistent<T: 'static>(
    key: impl Into<String>,
    factory: impl FnOnce() -> T,
) -> Result<Cell<T>> {
    let key = key.into();
    if !bundle::is_primitive::<T>() {
        return Err(Error::Configuration {
            key,
            type_name: type_name::<T>(),
        });
    }
    retain_persistent_with(key, PrimitiveSaver::<T>::default(), factory)
}

pub fn retain_persistent_with<T: 'static, S: Saver<T>>(
    key: impl Into<String>,
    saver: S,
    factory: impl FnOnce() -> T,
) -> Result<Cell<T>> {
    let key = key.into();
    let (rt, node) = current().ok_or(Error::OutsideComposition {
        op: "retain_persistent",
    })?;
    let slot_key = format!("persist:{key}");
    if let Some(c) = slot_get::<Cell<T>>(&node, &slot_key) {
        return Ok(c);
    }

    let bundle_key = format!("{}#{}", node.path, key);
    let restored = match rt.bundle.borrow().get(&bundle_key) {
        Some(saved) => {
            let v = saver.restore(saved);
            if v.is_none() {
                log::warn!(
                    "bundle entry '{bundle_key}' ({saved:?}) does not decode as {}; using the initial value",
                    type_name::<T>()
                );
            }
            v
        }
        None => None,
    };
    if restored.is_some() {
        log::debug!("restored '{bundle_key}' from bundle");
    }
    let c = Cell::new(match restored {
        Some(v) => v,
        None => factory(),
    });
    slot_put(&node, slot_key, c.clone());

    let persisted = c.clone();
    node.persisters.borrow_mut().push(Persister {
        bundle_key,
        save: Box::new(move || persisted.with_untracked(|v| saver.save(v))),
    });
    Ok(c)
}

/// Declare a keyed child node and render it now with `render`.
///
/// Children that a successful render of their parent does not declare again
/// are disposed.
pub fn child(
    key: impl Into<String>,
    render: impl Fn() -> anyhow::Result<()> + 'static,
) -> Result<NodeId> {
    let key = key.into();
    let (rt, parent) = current().ok_or(Error::OutsideComposition { op: "child" })?;
    let render: RenderFn = Rc::new(render);

    if parent.declared.borrow().iter().any(|k| *k == key) {
        log::warn!(
            "child key '{key}' declared twice under `{}`; rendering it again",
            parent.path
        );
    } else {
        parent.declared.borrow_mut().push(key.clone());
    }

    let id = match parent.child_id(&key).filter(|id| rt.contains(*id)) {
        Some(id) => {
            if let Some(node) = rt.node(id) {
                *node.render.borrow_mut() = render;
            }
            id
        }
        None => rt.insert_child(&parent, key, render),
    };
    rt.render_node(id);
    Ok(id)
}

pub(crate) struct RuntimeInner {
    pub config: RuntimeConfig,
    nodes: RefCell<SlotMap<NodeId, Rc<Node>>>,
    root: RefCell<Option<NodeId>>,
    clock: RefCell<Rc<dyn Clock>>,
    pub bundle: RefCell<Bundle>,
    pub view_models: RefCell<ViewModelStore>,
    executor: Rc<Executor>,
    post_commit: RefCell<Vec<Box<dyn FnOnce()>>>,
    rendered: RefCell<HashSet<NodeId>>,
    errors: RefCell<Vec<Error>>,
}

impl RuntimeInner {
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.borrow().contains_key(id)
    }

    fn node(&self, id: NodeId) -> Option<Rc<Node>> {
        self.nodes.borrow().get(id).cloned()
    }

    fn clock(&self) -> Rc<dyn Clock> {
        self.clock.borrow().clone()
    }

    pub fn spawn(
        &self,
        owner: NodeId,
        label: impl Into<String>,
        fut: impl Future<Output = anyhow::Result<()>> + 'static,
    ) -> Result<TaskHandle> {
        if !self.contains(owner) {
            return Err(Error::NodeRemoved(owner));
        }
        Ok(self.executor.spawn(Some(owner), label, fut))
    }

    fn report(&self, err: Error) {
        log::error!("{err}");
        self.errors.borrow_mut().push(err);
    }

    fn insert_child(&self, parent: &Node, key: String, render: RenderFn) -> NodeId {
        let id = self
            .nodes
            .borrow_mut()
            .insert_with_key(|id| Rc::new(Node::new(id, Some(parent), key.clone(), render)));
        parent.children.borrow_mut().push((key, id));
        log::debug!("created `{}`", self.node(id).map(|n| n.path.clone()).unwrap_or_default());
        id
    }

    fn render_node(self: &Rc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if node.has(NodeFlags::RENDERING) {
            log::warn!("`{}` asked to recompose while rendering; skipped", node.path);
            return;
        }
        reactive::clear_dirty(id);
        self.rendered.borrow_mut().insert(id);
        node.begin_render();

        let render = node.render.borrow().clone();
        let (result, previous) = {
            let _rendering = node.rendering();
            let _frame = FrameGuard::enter(self.clone(), node.clone());
            reactive::track(id, || {
                if self.config.catch_panics {
                    catch_unwind(AssertUnwindSafe(|| render()))
                } else {
                    Ok(render())
                }
            })
        };

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(panic_message(&*payload)),
        };
        match failure {
            None => {
                log::debug!("recomposed `{}`", node.path);
                self.commit(&node);
            }
            Some(message) => {
                // Keep listening to whatever the last good render read.
                reactive::restore_dependencies(id, previous);
                node.commits.borrow_mut().clear();
                node.side_effects.borrow_mut().clear();
                self.report(Error::Render {
                    node: id,
                    path: node.path.clone(),
                    message,
                });
            }
        }
    }

    fn commit(self: &Rc<Self>, node: &Rc<Node>) {
        let declared: SmallVec<[String; 4]> = std::mem::take(&mut *node.declared.borrow_mut());
        let stale: Vec<NodeId> = {
            let mut children = node.children.borrow_mut();
            let mut stale = Vec::new();
            children.retain(|(k, id)| {
                let keep = declared.iter().any(|d| d == k);
                if !keep {
                    stale.push(*id);
                }
                keep
            });
            stale
        };
        for id in stale {
            self.dispose_subtree(id);
        }

        let commits = std::mem::take(&mut *node.commits.borrow_mut());
        reactive::untracked(|| {
            for c in commits {
                c(self);
            }
        });
        let effects = std::mem::take(&mut *node.side_effects.borrow_mut());
        self.post_commit.borrow_mut().extend(effects);
    }

    fn dispose_subtree(&self, id: NodeId) {
        let Some(node) = self.nodes.borrow_mut().remove(id) else {
            return;
        };
        let children: Vec<NodeId> = node.children.borrow_mut().drain(..).map(|(_, c)| c).collect();
        for c in children {
            self.dispose_subtree(c);
        }

        let saved = node.saved_values();
        if !saved.is_empty() {
            let mut bundle = self.bundle.borrow_mut();
            for (k, v) in saved {
                bundle.put(k, v);
            }
        }
        let cancelled = self.executor.cancel_owned(id);
        reactive::untracked(|| node.scope.dispose());
        reactive::remove_observer(id);
        self.rendered.borrow_mut().remove(&id);
        node.persisters.borrow_mut().clear();
        let slots = std::mem::take(&mut *node.slots.borrow_mut());
        drop(slots);
        log::debug!("disposed `{}` ({cancelled} task(s) cancelled)", node.path);
    }

    fn recompose_pass(self: &Rc<Self>) {
        let batch = reactive::take_dirty();
        if batch.is_empty() {
            return;
        }
        let mut ordered: Vec<(usize, NodeId)> = batch
            .into_iter()
            .filter_map(|id| self.node(id).map(|n| (n.depth, id)))
            .collect();
        // Parents first; a parent re-renders its declared children inline.
        ordered.sort_by_key(|(depth, _)| *depth);
        for (_, id) in ordered {
            if self.rendered.borrow().contains(&id) {
                continue;
            }
            self.render_node(id);
        }
    }

    fn flush_side_effects(&self) -> usize {
        let effects = std::mem::take(&mut *self.post_commit.borrow_mut());
        let n = effects.len();
        reactive::untracked(|| {
            for e in effects {
                e();
            }
        });
        n
    }

    fn poll_tasks(&self, report: &mut TickReport) {
        // The budget covers both polling phases of a tick.
        let budget = self
            .config
            .max_task_polls_per_tick
            .saturating_sub(report.tasks_polled);
        let out = self
            .executor
            .run_ready(&self.clock(), budget, self.config.catch_panics);
        report.tasks_polled += out.polled;
        for e in out.errors {
            self.errors.borrow_mut().push(e);
        }
    }

    fn is_idle(&self) -> bool {
        !reactive::has_dirty() && !self.executor.has_ready() && self.post_commit.borrow().is_empty()
    }
}

/// What one call to [`Recomposer::tick`] (or `mount`) did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Render closures invoked, counting children re-rendered by a parent.
    pub recomposed: usize,
    pub tasks_polled: usize,
    pub timers_fired: usize,
    pub side_effects: usize,
    /// Render and task failures, in the order they happened.
    pub errors: Vec<Error>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: TickReport) {
        self.recomposed += other.recomposed;
        self.tasks_polled += other.tasks_polled;
        self.timers_fired += other.timers_fired;
        self.side_effects += other.side_effects;
        self.errors.extend(other.errors);
    }
}

/// Everything that outlives an unmounted composition.
pub struct Teardown {
    /// Survives process death once serialized.
    pub bundle: Bundle,
    /// Survives configuration changes only.
    pub view_models: ViewModelStore,
}

impl Teardown {
    /// The host is finishing for good: clear view models and keep only what a
    /// recreated process would see.
    pub fn finish(mut self) -> Bundle {
        self.view_models.clear();
        self.bundle
    }
}

/// Host-facing driver: owns the node tree, the executor and the bundle.
///
/// One recomposer may be mounted per thread at a time, since the dependency
/// graph is thread-local.
pub struct Recomposer {
    inner: Rc<RuntimeInner>,
}

impl Default for Recomposer {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Recomposer {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                nodes: RefCell::new(SlotMap::with_key()),
                root: RefCell::new(None),
                clock: RefCell::new(Rc::new(SystemClock)),
                bundle: RefCell::new(Bundle::default()),
                view_models: RefCell::new(ViewModelStore::default()),
                executor: Rc::new(Executor::new()),
                post_commit: RefCell::new(Vec::new()),
                rendered: RefCell::new(HashSet::new()),
                errors: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn with_clock(self, clock: impl Clock) -> Self {
        *self.inner.clock.borrow_mut() = Rc::new(clock);
        self
    }

    /// Seed persistent slots from a bundle saved by a previous process.
    pub fn with_bundle(self, bundle: Bundle) -> Self {
        *self.inner.bundle.borrow_mut() = bundle;
        self
    }

    pub fn with_view_models(self, store: ViewModelStore) -> Self {
        *self.inner.view_models.borrow_mut() = store;
        self
    }

    /// Resume from a configuration change: bundle and view models carry over.
    pub fn restore(config: RuntimeConfig, teardown: Teardown) -> Self {
        Self::new(config)
            .with_bundle(teardown.bundle)
            .with_view_models(teardown.view_models)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Create the root node and render it once.
    pub fn mount(&self, root: impl Fn() -> anyhow::Result<()> + 'static) -> Result<TickReport> {
        let rt = &self.inner;
        if rt.root.borrow().is_some() {
            return Err(Error::AlreadyMounted);
        }
        if THREAD_MOUNTED.with(|m| m.replace(true)) {
            return Err(Error::ThreadOccupied);
        }
        let render: RenderFn = Rc::new(root);
        let id = rt
            .nodes
            .borrow_mut()
            .insert_with_key(|id| Rc::new(Node::new(id, None, "root", render)));
        *rt.root.borrow_mut() = Some(id);
        log::info!("mounting root ({} bundle entries)", rt.bundle.borrow().len());

        rt.rendered.borrow_mut().clear();
        rt.render_node(id);
        let mut report = TickReport {
            recomposed: rt.rendered.borrow().len(),
            ..TickReport::default()
        };
        report.side_effects = rt.flush_side_effects();
        rt.poll_tasks(&mut report);
        report.errors = std::mem::take(&mut *rt.errors.borrow_mut());
        Ok(report)
    }

    pub fn root(&self) -> Option<NodeId> {
        *self.inner.root.borrow()
    }

    pub fn is_mounted(&self) -> bool {
        self.root().is_some()
    }

    /// One logical turn: fire due timers, resume ready tasks, recompose every
    /// dirty node at most once, run side effects, then give freshly launched
    /// tasks their first poll.
    pub fn tick(&self) -> TickReport {
        let rt = &self.inner;
        rt.rendered.borrow_mut().clear();
        let mut report = TickReport {
            timers_fired: rt.executor.timers().fire_due(rt.clock().now()),
            ..TickReport::default()
        };
        rt.poll_tasks(&mut report);
        rt.recompose_pass();
        report.recomposed = rt.rendered.borrow().len();
        report.side_effects = rt.flush_side_effects();
        rt.poll_tasks(&mut report);
        report.errors = std::mem::take(&mut *rt.errors.borrow_mut());
        report
    }

    /// Tick until nothing is dirty, ready or pending. Timers that are not yet
    /// due do not count as work.
    pub fn run_until_idle(&self) -> Result<TickReport> {
        let mut total = TickReport::default();
        let max = self.inner.config.max_ticks_until_idle;
        for _ in 0..max {
            if self.inner.is_idle() {
                return Ok(total);
            }
            total.merge(self.tick());
        }
        if self.inner.is_idle() {
            Ok(total)
        } else {
            log::warn!("composition still busy after {max} ticks");
            Err(Error::NotIdle { ticks: max })
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Earliest pending timer, for hosts that sleep between ticks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.executor.timers().next_deadline()
    }

    /// Enqueue `node` for the next pass regardless of its dependencies.
    pub fn schedule_recompute(&self, node: NodeId) -> Result<()> {
        if !self.inner.contains(node) {
            return Err(Error::NodeRemoved(node));
        }
        reactive::mark_dirty(node);
        Ok(())
    }

    pub fn is_scheduled(&self, node: NodeId) -> bool {
        reactive::is_dirty(node)
    }

    /// Start `fut` bound to `node`; it is cancelled when the node is disposed.
    pub fn launch_scoped<F>(&self, node: NodeId, fut: F) -> Result<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let label = self
            .node_path(node)
            .ok_or(Error::NodeRemoved(node))?;
        self.inner.spawn(node, label, fut)
    }

    pub fn task_scope(&self, node: NodeId) -> Result<TaskScope> {
        let label = self
            .node_path(node)
            .ok_or(Error::NodeRemoved(node))?;
        let weak: Weak<RuntimeInner> = Rc::downgrade(&self.inner);
        Ok(TaskScope::new(weak, node, label))
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.executor.active_count()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.contains(node)
    }

    pub fn node_path(&self, node: NodeId) -> Option<String> {
        self.inner.node(node).map(|n| n.path.clone())
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.inner.node(node)?.parent
    }

    /// Id of the child of `parent` declared with `key`.
    pub fn child_of(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        self.inner.node(parent)?.child_id(key)
    }

    /// Write every live persistent slot into the bundle and return a copy,
    /// without tearing anything down.
    pub fn save_state(&self) -> Bundle {
        let nodes: Vec<Rc<Node>> = self.inner.nodes.borrow().values().cloned().collect();
        let mut bundle = self.inner.bundle.borrow_mut();
        for n in nodes {
            for (k, v) in n.saved_values() {
                bundle.put(k, v);
            }
        }
        bundle.clone()
    }

    pub fn bundle(&self) -> Bundle {
        self.inner.bundle.borrow().clone()
    }

    /// Dispose the whole tree, saving persistent slots, cancelling every task.
    pub fn unmount(&self) -> Teardown {
        let rt = &self.inner;
        let root = rt.root.borrow_mut().take();
        if let Some(id) = root {
            rt.dispose_subtree(id);
            THREAD_MOUNTED.with(|m| m.set(false));
        }
        rt.executor.cancel_all();
        rt.post_commit.borrow_mut().clear();
        rt.errors.borrow_mut().clear();
        let bundle = std::mem::take(&mut *rt.bundle.borrow_mut());
        log::info!("unmounted; bundle holds {} entries", bundle.len());
        Teardown {
            bundle,
            view_models: std::mem::take(&mut *rt.view_models.borrow_mut()),
        }
    }
}

impl Drop for Recomposer {
    fn drop(&mut self) {
        let root = self.inner.root.borrow_mut().take();
        if let Some(id) = root {
            self.inner.dispose_subtree(id);
            let _ = THREAD_MOUNTED.try_with(|m| m.set(false));
        }
        self.inner.executor.cancel_all();
    }
}
