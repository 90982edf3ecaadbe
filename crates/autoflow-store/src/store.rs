//! Automation store
//!
//! Two catalogs back the engine: schedule state (document plus lifecycle)
//! and trigger progress. Both live in memory behind a single lock and are
//! written through to disk before a mutation is considered committed, so a
//! crash can lose at most an uncommitted mutation and never observes a
//! counter ahead of what was emitted.
//!
//! Deleting schedules cascades to their trigger progress.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use autoflow_core::{AutomationSchedule, AutomationScheduleData, TriggerData};

use crate::storage::{Storable, Storage, StorageError};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Mutation applied to a stored schedule.
pub type ScheduleMutation = Box<dyn FnOnce(&mut AutomationScheduleData) + Send>;

/// Batch merge: combines the current record (if any) with an incoming
/// schedule definition into the record to store.
pub type ScheduleMerge = Box<
    dyn FnMut(Option<AutomationScheduleData>, AutomationSchedule) -> AutomationScheduleData
        + Send,
>;

/// Persistence contract for schedule state.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn schedules(&self) -> StoreResult<Vec<AutomationScheduleData>>;

    async fn schedule(&self, id: &str) -> StoreResult<Option<AutomationScheduleData>>;

    async fn schedules_with_group(&self, group: &str)
        -> StoreResult<Vec<AutomationScheduleData>>;

    async fn schedules_with_ids(&self, ids: &[String])
        -> StoreResult<Vec<AutomationScheduleData>>;

    /// Applies `mutation` to the stored record and persists the result.
    /// Returns the updated record, or `None` if the id is unknown.
    async fn update_schedule(
        &self,
        id: &str,
        mutation: ScheduleMutation,
    ) -> StoreResult<Option<AutomationScheduleData>>;

    /// Creates or replaces records for the given schedules, in order. The
    /// merge closure sees the current record for each schedule id.
    /// Everything persists as one write.
    async fn upsert_schedules(
        &self,
        schedules: Vec<AutomationSchedule>,
        merge: ScheduleMerge,
    ) -> StoreResult<Vec<AutomationScheduleData>>;

    async fn delete_schedules(&self, ids: &[String]) -> StoreResult<()>;
}

/// Persistence contract for trigger progress.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn trigger_data(
        &self,
        schedule_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Option<TriggerData>>;

    /// Persists a batch of progress records as one write.
    async fn upsert_trigger_data(&self, data: Vec<TriggerData>) -> StoreResult<()>;

    /// Drops all progress for the given schedules.
    async fn delete_trigger_data_for_schedules(
        &self,
        schedule_ids: &[String],
    ) -> StoreResult<()>;

    /// Drops progress for specific triggers of one schedule.
    async fn delete_trigger_data(
        &self,
        schedule_id: &str,
        trigger_ids: &[String],
    ) -> StoreResult<()>;

    /// Drops progress for every schedule not in `schedule_ids`.
    async fn delete_trigger_data_excluding(&self, schedule_ids: &[String]) -> StoreResult<()>;
}

/// Both store halves together; what the engine is injected with.
pub trait AutomationStore: ScheduleStore + TriggerStore {}

impl<T: ScheduleStore + TriggerStore> AutomationStore for T {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleCatalog {
    schedules: Vec<AutomationScheduleData>,
}

impl Storable for ScheduleCatalog {
    const KEY: &'static str = "automation.schedules";
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TriggerCatalog {
    triggers: Vec<TriggerData>,
}

impl Storable for TriggerCatalog {
    const KEY: &'static str = "automation.triggers";
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

#[derive(Default)]
struct StoreState {
    loaded: bool,
    schedules: HashMap<String, AutomationScheduleData>,
    /// schedule id -> trigger id -> progress
    triggers: HashMap<String, HashMap<String, TriggerData>>,
}

/// File-backed [`AutomationStore`] using the `.storage/` directory.
pub struct FileAutomationStore {
    storage: Storage,
    state: Mutex<StoreState>,
}

impl FileAutomationStore {
    pub fn new(data_dir: impl AsRef<std::path::Path>) -> Self {
        Self {
            storage: Storage::new(data_dir),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Loads both catalogs on first access. A catalog that fails to parse
    /// degrades to empty; losing progress under-fires, which is the safe
    /// direction.
    async fn ensure_loaded(&self, state: &mut StoreState) -> StoreResult<()> {
        if state.loaded {
            return Ok(());
        }

        match self.storage.load::<ScheduleCatalog>().await {
            Ok(Some(catalog)) => {
                state.schedules = catalog
                    .schedules
                    .into_iter()
                    .map(|data| (data.schedule.identifier.clone(), data))
                    .collect();
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "Unreadable schedule catalog, starting empty");
            }
        }

        match self.storage.load::<TriggerCatalog>().await {
            Ok(Some(catalog)) => {
                for data in catalog.triggers {
                    state
                        .triggers
                        .entry(data.schedule_id.clone())
                        .or_default()
                        .insert(data.trigger_id.clone(), data);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "Unreadable trigger catalog, starting empty");
            }
        }

        state.loaded = true;
        debug!(
            schedules = state.schedules.len(),
            "Loaded automation store"
        );
        Ok(())
    }

    async fn persist_schedules(
        &self,
        schedules: &HashMap<String, AutomationScheduleData>,
    ) -> StoreResult<()> {
        let mut catalog = ScheduleCatalog {
            schedules: schedules.values().cloned().collect(),
        };
        catalog
            .schedules
            .sort_by(|a, b| a.schedule.identifier.cmp(&b.schedule.identifier));
        self.storage.save(&catalog).await?;
        Ok(())
    }

    async fn persist_triggers(
        &self,
        triggers: &HashMap<String, HashMap<String, TriggerData>>,
    ) -> StoreResult<()> {
        let mut catalog = TriggerCatalog {
            triggers: triggers
                .values()
                .flat_map(|by_trigger| by_trigger.values().cloned())
                .collect(),
        };
        catalog
            .triggers
            .sort_by(|a, b| (&a.schedule_id, &a.trigger_id).cmp(&(&b.schedule_id, &b.trigger_id)));
        self.storage.save(&catalog).await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for FileAutomationStore {
    async fn schedules(&self) -> StoreResult<Vec<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.schedules.values().cloned().collect())
    }

    async fn schedule(&self, id: &str) -> StoreResult<Option<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.schedules.get(id).cloned())
    }

    async fn schedules_with_group(
        &self,
        group: &str,
    ) -> StoreResult<Vec<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state
            .schedules
            .values()
            .filter(|data| data.schedule.group.as_deref() == Some(group))
            .cloned()
            .collect())
    }

    async fn schedules_with_ids(
        &self,
        ids: &[String],
    ) -> StoreResult<Vec<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(ids
            .iter()
            .filter_map(|id| state.schedules.get(id).cloned())
            .collect())
    }

    async fn update_schedule(
        &self,
        id: &str,
        mutation: ScheduleMutation,
    ) -> StoreResult<Option<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let Some(existing) = state.schedules.get(id) else {
            return Ok(None);
        };
        let mut updated = existing.clone();
        mutation(&mut updated);

        // persist against a copy so a failed write leaves memory untouched
        let mut schedules = state.schedules.clone();
        schedules.insert(id.to_owned(), updated.clone());
        self.persist_schedules(&schedules).await?;
        state.schedules = schedules;

        Ok(Some(updated))
    }

    async fn upsert_schedules(
        &self,
        incoming: Vec<AutomationSchedule>,
        mut merge: ScheduleMerge,
    ) -> StoreResult<Vec<AutomationScheduleData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut schedules = state.schedules.clone();
        let mut result = Vec::with_capacity(incoming.len());
        for schedule in incoming {
            let existing = schedules.get(&schedule.identifier).cloned();
            let updated = merge(existing, schedule);
            schedules.insert(updated.schedule.identifier.clone(), updated.clone());
            result.push(updated);
        }
        self.persist_schedules(&schedules).await?;
        state.schedules = schedules;

        Ok(result)
    }

    async fn delete_schedules(&self, ids: &[String]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut schedules = state.schedules.clone();
        let mut triggers = state.triggers.clone();
        let mut schedules_changed = false;
        let mut triggers_changed = false;
        for id in ids {
            schedules_changed |= schedules.remove(id).is_some();
            triggers_changed |= triggers.remove(id).is_some();
        }

        if schedules_changed {
            self.persist_schedules(&schedules).await?;
        }
        if triggers_changed {
            self.persist_triggers(&triggers).await?;
        }
        state.schedules = schedules;
        state.triggers = triggers;
        Ok(())
    }
}

#[async_trait]
impl TriggerStore for FileAutomationStore {
    async fn trigger_data(
        &self,
        schedule_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Option<TriggerData>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state
            .triggers
            .get(schedule_id)
            .and_then(|by_trigger| by_trigger.get(trigger_id))
            .cloned())
    }

    async fn upsert_trigger_data(&self, data: Vec<TriggerData>) -> StoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut triggers = state.triggers.clone();
        for record in data {
            triggers
                .entry(record.schedule_id.clone())
                .or_default()
                .insert(record.trigger_id.clone(), record);
        }
        self.persist_triggers(&triggers).await?;
        state.triggers = triggers;
        Ok(())
    }

    async fn delete_trigger_data_for_schedules(
        &self,
        schedule_ids: &[String],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut triggers = state.triggers.clone();
        let mut changed = false;
        for schedule_id in schedule_ids {
            changed |= triggers.remove(schedule_id).is_some();
        }
        if changed {
            self.persist_triggers(&triggers).await?;
            state.triggers = triggers;
        }
        Ok(())
    }

    async fn delete_trigger_data(
        &self,
        schedule_id: &str,
        trigger_ids: &[String],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut triggers = state.triggers.clone();
        let mut changed = false;
        if let Some(by_trigger) = triggers.get_mut(schedule_id) {
            for trigger_id in trigger_ids {
                changed |= by_trigger.remove(trigger_id).is_some();
            }
        }
        if changed {
            self.persist_triggers(&triggers).await?;
            state.triggers = triggers;
        }
        Ok(())
    }

    async fn delete_trigger_data_excluding(&self, schedule_ids: &[String]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut triggers = state.triggers.clone();
        let before = triggers.len();
        triggers.retain(|schedule_id, _| schedule_ids.contains(schedule_id));
        if triggers.len() != before {
            self.persist_triggers(&triggers).await?;
            state.triggers = triggers;
        }
        Ok(())
    }
}
