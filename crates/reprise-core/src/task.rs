//! Node-scoped cooperative tasks.
//!
//! Tasks are plain futures polled by the recomposer on its own thread, never
//! while a node is rendering. They suspend only at `.await` points such as
//! [`delay`] and [`yield_now`]. Cancelling a task drops its future, so a task
//! cancelled while suspended never runs past the suspension point.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use web_time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::{Error, Result, panic_message};
use crate::node::NodeId;
use crate::reactive;
use crate::runtime::RuntimeInner;

new_key_type! {
    pub struct TaskId;
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// Handle to a launched task. Dropping it does not cancel the task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    state: Rc<std::cell::Cell<TaskState>>,
    executor: Weak<Executor>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == TaskState::Pending
    }

    /// Returns false if the task had already finished.
    pub fn cancel(&self) -> bool {
        match self.executor.upgrade() {
            Some(ex) => ex.cancel(self.id),
            None => {
                if self.is_active() {
                    self.state.set(TaskState::Cancelled);
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

struct TaskSlot {
    owner: Option<NodeId>,
    label: String,
    // None while the task is being polled.
    future: Option<BoxFuture>,
    state: Rc<std::cell::Cell<TaskState>>,
}

#[derive(Default)]
struct ReadyQueue(Mutex<VecDeque<TaskId>>);

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.0.lock().push_back(self.id);
    }
}

type TimerKey = (Instant, u64);

#[derive(Default)]
pub(crate) struct Timers {
    entries: RefCell<BTreeMap<TimerKey, Waker>>,
    seq: std::cell::Cell<u64>,
}

impl Timers {
    fn register(&self, deadline: Instant, waker: Waker) -> TimerKey {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        let key = (deadline, seq);
        self.entries.borrow_mut().insert(key, waker);
        key
    }

    fn cancel(&self, key: TimerKey) {
        self.entries.borrow_mut().remove(&key);
    }

    /// Wake every timer whose deadline has passed.
    pub fn fire_due(&self, now: Instant) -> usize {
        let due: Vec<Waker> = {
            let mut entries = self.entries.borrow_mut();
            let later = entries.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *entries, later).into_values().collect()
        };
        let n = due.len();
        for w in due {
            w.wake();
        }
        n
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.borrow().keys().next().map(|(t, _)| *t)
    }
}

thread_local! {
    static POLL_CONTEXT: RefCell<Option<(Rc<Timers>, Rc<dyn Clock>)>> = const { RefCell::new(None) };
}

fn with_poll_context<R>(timers: &Rc<Timers>, clock: &Rc<dyn Clock>, f: impl FnOnce() -> R) -> R {
    struct Guard(Option<(Rc<Timers>, Rc<dyn Clock>)>);
    impl Drop for Guard {
        fn drop(&mut self) {
            let prev = self.0.take();
            let _ = POLL_CONTEXT.try_with(|c| *c.borrow_mut() = prev);
        }
    }
    let prev = POLL_CONTEXT.with(|c| c.borrow_mut().replace((timers.clone(), clock.clone())));
    let _guard = Guard(prev);
    f()
}

fn poll_context() -> Option<(Rc<Timers>, Rc<dyn Clock>)> {
    POLL_CONTEXT.with(|c| c.borrow().clone())
}

/// Suspends the current task for `duration` of recomposer clock time.
pub fn delay(duration: Duration) -> Delay {
    Delay {
        duration,
        deadline: None,
        timer: None,
    }
}

pub struct Delay {
    duration: Duration,
    deadline: Option<Instant>,
    timer: Option<(Weak<Timers>, TimerKey)>,
}

impl Delay {
    fn clear_timer(&mut self) {
        if let Some((timers, key)) = self.timer.take()
            && let Some(timers) = timers.upgrade()
        {
            timers.cancel(key);
        }
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let Some((timers, clock)) = poll_context() else {
            log::error!("delay polled outside a recomposer task; completing immediately");
            return Poll::Ready(());
        };
        let now = clock.now();
        let deadline = *this.deadline.get_or_insert(now + this.duration);
        this.clear_timer();
        if now >= deadline {
            return Poll::Ready(());
        }
        let key = timers.register(deadline, cx.waker().clone());
        this.timer = Some((Rc::downgrade(&timers), key));
        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

/// Gives other ready tasks a turn before resuming.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub(crate) struct Executor {
    tasks: RefCell<SlotMap<TaskId, TaskSlot>>,
    ready: Arc<ReadyQueue>,
    timers: Rc<Timers>,
}

/// What `run_ready` did in one call.
#[derive(Default)]
pub(crate) struct PollOutcome {
    pub polled: usize,
    pub errors: Vec<Error>,
}

enum Finished {
    Completed,
    Failed(String),
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(SlotMap::with_key()),
            ready: Arc::new(ReadyQueue::default()),
            timers: Rc::new(Timers::default()),
        }
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn spawn(
        self: &Rc<Self>,
        owner: Option<NodeId>,
        label: impl Into<String>,
        fut: impl Future<Output = anyhow::Result<()>> + 'static,
    ) -> TaskHandle {
        let state = Rc::new(std::cell::Cell::new(TaskState::Pending));
        let label = label.into();
        let id = self.tasks.borrow_mut().insert(TaskSlot {
            owner,
            label: label.clone(),
            future: Some(Box::pin(fut)),
            state: state.clone(),
        });
        self.ready.0.lock().push_back(id);
        log::debug!("task `{label}` ({id:?}) launched");
        TaskHandle {
            id,
            state,
            executor: Rc::downgrade(self),
        }
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        let dropped = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(id) else {
                return false;
            };
            if slot.state.get() != TaskState::Pending {
                return false;
            }
            slot.state.set(TaskState::Cancelled);
            log::debug!("task `{}` ({id:?}) cancelled", slot.label);
            // A task cancelling itself is mid-poll; run_ready drops it afterwards.
            if slot.future.is_some() {
                tasks.remove(id)
            } else {
                None
            }
        };
        drop(dropped);
        true
    }

    pub fn cancel_owned(&self, owner: NodeId) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .borrow()
            .iter()
            .filter(|(_, t)| t.owner == Some(owner))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks.borrow().keys().collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.0.lock().is_empty()
    }

    pub fn run_ready(
        &self,
        clock: &Rc<dyn Clock>,
        budget: usize,
        catch_panics: bool,
    ) -> PollOutcome {
        let mut out = PollOutcome::default();
        while out.polled < budget {
            let Some(id) = self.ready.0.lock().pop_front() else {
                break;
            };
            let fut = match self.tasks.borrow_mut().get_mut(id) {
                Some(slot) if slot.state.get() == TaskState::Pending => slot.future.take(),
                _ => None,
            };
            // Stale wake-up for a finished, cancelled or already-running task.
            let Some(mut fut) = fut else {
                continue;
            };
            out.polled += 1;

            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: self.ready.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            let polled = with_poll_context(&self.timers, clock, || {
                reactive::untracked(|| {
                    if catch_panics {
                        catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)))
                    } else {
                        Ok(fut.as_mut().poll(&mut cx))
                    }
                })
            });
            let finished = match polled {
                Ok(Poll::Pending) => None,
                Ok(Poll::Ready(Ok(()))) => Some(Finished::Completed),
                Ok(Poll::Ready(Err(e))) => Some(Finished::Failed(format!("{e:#}"))),
                Err(payload) => Some(Finished::Failed(panic_message(&*payload))),
            };

            let removed = {
                let mut tasks = self.tasks.borrow_mut();
                match (finished, tasks.get_mut(id)) {
                    (None, Some(slot)) if slot.state.get() == TaskState::Pending => {
                        slot.future = Some(fut);
                        continue;
                    }
                    (Some(Finished::Failed(message)), Some(slot))
                        if slot.state.get() == TaskState::Pending =>
                    {
                        slot.state.set(TaskState::Failed);
                        log::error!("task `{}` ({id:?}) failed: {message}", slot.label);
                        out.errors.push(Error::Task {
                            task: id,
                            label: slot.label.clone(),
                            message,
                        });
                        tasks.remove(id)
                    }
                    (Some(Finished::Completed), Some(slot))
                        if slot.state.get() == TaskState::Pending =>
                    {
                        slot.state.set(TaskState::Completed);
                        log::debug!("task `{}` ({id:?}) completed", slot.label);
                        tasks.remove(id)
                    }
                    // Cancelled while it was being polled.
                    _ => tasks.remove(id),
                }
            };
            drop(removed);
            drop(fut);
        }
        out
    }
}

/// Launches tasks bound to one node's lifetime, usable from event handlers.
#[derive(Clone)]
pub struct TaskScope {
    rt: Weak<RuntimeInner>,
    owner: NodeId,
    label: String,
}

impl TaskScope {
    pub(crate) fn new(rt: Weak<RuntimeInner>, owner: NodeId, label: String) -> Self {
        Self { rt, owner, label }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// False once the owning node has left the composition.
    pub fn is_active(&self) -> bool {
        self.rt.upgrade().is_some_and(|rt| rt.contains(self.owner))
    }

    pub fn launch<F>(&self, fut: F) -> Result<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let rt = self.rt.upgrade().ok_or(Error::NodeRemoved(self.owner))?;
        rt.spawn(self.owner, self.label.clone(), fut)
    }
}
