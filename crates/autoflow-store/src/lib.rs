//! Persistence for the autoflow automation engine.
//!
//! Schedule state and trigger progress live in two versioned JSON catalogs
//! under a `.storage/` directory. [`FileAutomationStore`] is the shipped
//! implementation; the engine only depends on the [`ScheduleStore`] and
//! [`TriggerStore`] traits, so hosts can substitute their own backend.

mod storage;
mod store;

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
pub use store::{
    AutomationStore, FileAutomationStore, ScheduleMerge, ScheduleMutation, ScheduleStore,
    StoreError, StoreResult, TriggerStore,
};
