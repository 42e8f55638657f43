use std::any::Any;

use crate::node::NodeId;
use crate::task::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A persistent slot was requested for a type the bundle cannot encode.
    #[error("slot `{key}` cannot be persisted: `{type_name}` has no primitive bundle encoding")]
    Configuration {
        key: String,
        type_name: &'static str,
    },

    #[error("render of `{path}` failed: {message}")]
    Render {
        node: NodeId,
        path: String,
        message: String,
    },

    #[error("task `{label}` failed: {message}")]
    Task {
        task: TaskId,
        label: String,
        message: String,
    },

    #[error("`{op}` can only be called while a node is rendering")]
    OutsideComposition { op: &'static str },

    #[error("a root is already mounted on this recomposer")]
    AlreadyMounted,

    #[error("another recomposer is already mounted on this thread")]
    ThreadOccupied,

    #[error("node {0:?} is no longer part of the composition")]
    NodeRemoved(NodeId),

    #[error("composition did not settle after {ticks} ticks")]
    NotIdle { ticks: usize },

    #[error("bundle encoding failed: {0}")]
    Bundle(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_render(&self) -> bool {
        matches!(self, Error::Render { .. })
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Error::Task { .. })
    }
}

/// Best-effort message for a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
