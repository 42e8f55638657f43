//! # View models
//!
//! Bundles only hold primitives. State that does not fit, or that should not
//! be rebuilt on a configuration change, lives in a [`ViewModel`] kept by the
//! host in a [`ViewModelStore`]:
//!
//! ```rust
//! use reprise_core::*;
//!
//! struct CounterViewModel {
//!     counter: Cell<i32>,
//! }
//!
//! impl ViewModel for CounterViewModel {}
//!
//! let rc = Recomposer::default();
//! rc.mount(|| {
//!     let vm = view_model("counter", || CounterViewModel { counter: cell(0) });
//!     let _shown = vm.counter.get();
//!     Ok(())
//! })
//! .unwrap();
//! ```
//!
//! The store moves into [`Teardown`](crate::Teardown) on unmount and can be
//! handed to the next recomposer; it is never serialized, so a recreated
//! process starts without it.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::rc::Rc;

use crate::runtime::current;

pub trait ViewModel: Any {
    /// Called once when the owning store is cleared.
    fn on_cleared(&self) {}
}

struct Entry {
    any: Rc<dyn Any>,
    vm: Rc<dyn ViewModel>,
}

#[derive(Default)]
pub struct ViewModelStore {
    entries: HashMap<String, Entry>,
}

impl ViewModelStore {
    pub fn get<VM: ViewModel>(&self, key: &str) -> Option<Rc<VM>> {
        self.entries.get(key)?.any.clone().downcast::<VM>().ok()
    }

    pub fn insert<VM: ViewModel>(&mut self, key: impl Into<String>, vm: Rc<VM>) {
        let key = key.into();
        let entry = Entry {
            any: vm.clone(),
            vm,
        };
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            log::warn!(
                "view model '{key}' replaced by a {}; clearing the old one",
                type_name::<VM>()
            );
            old.vm.on_cleared();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        for (key, e) in self.entries.drain() {
            log::debug!("clearing view model '{key}'");
            e.vm.on_cleared();
        }
    }
}

/// View model stored under `key` in the recomposer's store, created with
/// `factory` on first use.
///
/// Outside a composition a fresh, unstored instance is returned.
pub fn view_model<VM: ViewModel>(key: impl Into<String>, factory: impl FnOnce() -> VM) -> Rc<VM> {
    let key = key.into();
    let Some((rt, _)) = current() else {
        log::warn!("view_model('{key}') called outside a composition; not stored");
        return Rc::new(factory());
    };
    let existing = rt.view_models.borrow().get::<VM>(&key);
    if let Some(vm) = existing {
        return vm;
    }
    let vm = Rc::new(factory());
    rt.view_models.borrow_mut().insert(key, vm.clone());
    vm
}
