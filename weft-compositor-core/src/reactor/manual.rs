//! A reactor that only records watch state.
//!
//! Nothing is polled: the host (usually a test) decides when a fence has
//! signalled and calls `plane_ready` itself.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use weft_buffer_manager::PlaneFence;

use super::{FenceReactor, FenceWatch, PlaneKey};
use crate::error::TransactionError;

#[derive(Debug, Default, Clone)]
pub struct ManualReactor {
    watches: Rc<RefCell<BTreeMap<PlaneKey, bool>>>,
}

impl ManualReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a watch for `key` exists and is switched on.
    pub fn is_enabled(&self, key: PlaneKey) -> bool {
        self.watches.borrow().get(&key).copied().unwrap_or(false)
    }

    /// Keys of every enabled watch, in key order.
    pub fn enabled_watches(&self) -> Vec<PlaneKey> {
        self.watches
            .borrow()
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Number of registered watches, enabled or not.
    pub fn watch_count(&self) -> usize {
        self.watches.borrow().len()
    }
}

impl FenceReactor for ManualReactor {
    type Watch = ManualWatch;

    fn watch(&mut self, key: PlaneKey, _fence: &dyn PlaneFence) -> Result<ManualWatch, TransactionError> {
        self.watches.borrow_mut().insert(key, false);
        Ok(ManualWatch {
            key,
            watches: self.watches.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ManualWatch {
    key: PlaneKey,
    watches: Rc<RefCell<BTreeMap<PlaneKey, bool>>>,
}

impl FenceWatch for ManualWatch {
    fn set_enabled(&mut self, enabled: bool) {
        if let Some(state) = self.watches.borrow_mut().get_mut(&self.key) {
            *state = enabled;
        }
    }
}

impl Drop for ManualWatch {
    fn drop(&mut self) {
        self.watches.borrow_mut().remove(&self.key);
    }
}
