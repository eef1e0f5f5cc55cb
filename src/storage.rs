//! Storage controller: batches model change events into adapter writes.
//!
//! The controller subscribes to the same rule-store event stream as matcher
//! indexes and role managers, tracking how many mutations have not reached
//! the adapter yet. With autosave on, the owning enforcer flushes after every
//! mutation; batch operations suspend autosave and flush once at the end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::errors::EngineError;
use crate::model::Model;

pub struct StorageController {
    adapter: Box<dyn Adapter>,
    enabled: bool,
    autosave: bool,
    pending: Arc<AtomicUsize>,
}

impl StorageController {
    pub fn new(adapter: Box<dyn Adapter>, autosave: bool) -> Self {
        Self {
            adapter,
            enabled: true,
            autosave,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe the pending counter to every rule store of the model.
    /// The subscriptions die with the controller.
    pub fn attach(&self, model: &Model) {
        model.for_each_store(|store| {
            let weak = Arc::downgrade(&self.pending);
            store.subscribe(Box::new(move |_event| {
                let Some(pending) = weak.upgrade() else {
                    return false;
                };
                pending.fetch_add(1, Ordering::SeqCst);
                true
            }));
        });
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable_autosave(&mut self) {
        self.autosave = true;
    }

    pub fn disable_autosave(&mut self) {
        self.autosave = false;
    }

    pub fn autosave_enabled(&self) -> bool {
        self.autosave
    }

    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Load through the adapter; events fired during the load do not count
    /// as unsaved work.
    pub fn load(&self, model: &Model) -> Result<(), EngineError> {
        self.adapter.load_policy(model)?;
        self.pending.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Persist when there are unsaved mutations.
    pub fn flush(&self, model: &Model) -> Result<(), EngineError> {
        if !self.enabled || self.pending.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        self.adapter.save_policy(model)?;
        self.pending.store(0, Ordering::SeqCst);
        tracing::debug!("flushed policy to adapter");
        Ok(())
    }

    /// Flush immediately when autosave is on; called by the enforcer after
    /// each rule mutation.
    pub fn after_mutation(&self, model: &Model) -> Result<(), EngineError> {
        if self.enabled && self.autosave {
            self.flush(model)?;
        }
        Ok(())
    }
}
