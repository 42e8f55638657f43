pub use crate::bundle::{Bundle, BundleValue, JsonSaver, Saver, saver};
pub use crate::cell::{Cell, cell, cell_with_policy};
pub use crate::clock::{Clock, Duration, Instant, SystemClock, TestClock};
pub use crate::config::{EqualityPolicy, RuntimeConfig};
pub use crate::effects::{Dispose, disposable_effect, on_unmount, side_effect};
pub use crate::effects_ext::{launched_effect, remember_task_scope};
pub use crate::error::{Error, Result};
pub use crate::latest::{LatestHolder, latest};
pub use crate::node::NodeId;
pub use crate::runtime::{
    Recomposer, Teardown, TickReport, child, current_node, remember_state_with_key,
    remember_with_key, retain, retain_persistent, retain_persistent_with,
};
pub use crate::task::{TaskHandle, TaskScope, TaskState, delay, yield_now};
pub use crate::view_model::{ViewModel, ViewModelStore, view_model};
