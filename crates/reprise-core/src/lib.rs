//! # Cells, Recomposition, and Scoped Tasks
//!
//! Reprise is a small reactive core for declarative UIs. A host mounts a root
//! render closure on a [`Recomposer`]; closures read [`Cell`]s, and writes to
//! those cells schedule the closures that read them for the next tick.
//!
//! - `Cell<T>`: observable value; the only way to change it is `set`/`update`.
//! - `retain*` / `remember_with_key`: storage bound to a render node.
//! - `retain_persistent*`: retained storage saved to a [`Bundle`].
//! - `launched_effect` / `remember_task_scope`: node-scoped async tasks.
//! - `latest`: holder for values a long-lived task must see fresh.
//!
//! ## Cells
//!
//! ```rust
//! use reprise_core::*;
//!
//! let count = cell(0);
//! count.set(1);
//! count.update(|v| *v += 1);
//! assert_eq!(count.get(), 2);
//! ```
//!
//! Every write notifies, even when the value did not change
//! ([`EqualityPolicy::Always`]). Cells built with
//! `cell_with_policy(v, EqualityPolicy::SkipEqual)` stay silent on same-value
//! writes.
//!
//! ## Recomposition
//!
//! ```rust
//! use reprise_core::*;
//!
//! let rc = Recomposer::default();
//! let shown = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
//! let out = shown.clone();
//! rc.mount(move || {
//!     let count = retain("count", || 0);
//!     *out.borrow_mut() = format!("{}", count.get());
//!     if count.get() == 0 {
//!         count.set(1);
//!     }
//!     Ok(())
//! })
//! .unwrap();
//! rc.tick();
//! assert_eq!(*shown.borrow(), "1");
//! ```
//!
//! A tick renders each dirty node at most once, parents before children.
//! Writes made while the pass runs land in the next tick.
//!
//! Plain variables are invisible to the recomposer, and a cell created with
//! `cell(..)` inside a render closure is a new cell on every render; use
//! `retain` to keep it.
//!
//! ## Tasks
//!
//! Tasks are futures polled by the recomposer itself. They suspend at
//! [`delay`] / [`yield_now`] and are dropped, never resumed, once their node
//! leaves the composition:
//!
//! ```rust
//! use reprise_core::*;
//!
//! let clock = TestClock::new();
//! let rc = Recomposer::default().with_clock(clock.clone());
//! let counter = std::rc::Rc::new(std::cell::RefCell::new(None));
//! let c = counter.clone();
//! rc.mount(move || {
//!     let count = retain("count", || 0);
//!     *c.borrow_mut() = Some(count.clone());
//!     launched_effect("bump", (), move || async move {
//!         delay(Duration::from_secs(3)).await;
//!         count.update(|v| *v += 1);
//!         Ok(())
//!     });
//!     Ok(())
//! })
//! .unwrap();
//!
//! clock.advance(Duration::from_secs(3));
//! rc.tick();
//! assert_eq!(counter.borrow().as_ref().unwrap().get(), 1);
//! ```

pub mod bundle;
pub mod cell;
pub mod clock;
pub mod config;
pub mod effects;
pub mod effects_ext;
pub mod error;
pub mod latest;
pub mod node;
pub mod prelude;
pub mod reactive;
pub mod runtime;
pub mod scope;
pub mod task;
pub mod view_model;

mod tests;

pub use bundle::*;
pub use cell::*;
pub use clock::*;
pub use config::*;
pub use effects::*;
pub use effects_ext::*;
pub use error::*;
pub use latest::*;
pub use node::NodeId;
pub use runtime::*;
pub use task::*;
pub use view_model::*;
