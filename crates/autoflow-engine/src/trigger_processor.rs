//! Serialized trigger evaluation.
//!
//! All events flow through one [`AutomationTriggerProcessor`]. Processing
//! is serialized behind a single lock, so counter updates for any one
//! event are atomic with respect to the next. Progress is persisted before
//! a firing becomes observable; a crash between the two under-fires rather
//! than double-fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

use autoflow_core::{
    AutomationEvent, AutomationSchedule, AutomationScheduleData, AutomationScheduleState,
    AutomationTrigger, TriggerData, TriggerExecutionType, TriggerResult, TriggerableState,
};
use autoflow_store::{StoreResult, TriggerStore};

use crate::prepared_trigger::{PreparedTrigger, TriggerActivation, TriggerOutcome};

const RESULT_CHANNEL_CAPACITY: usize = 1024;

/// Activation a trigger gets from its schedule's lifecycle state.
/// Execution triggers listen while the schedule is idle and keep counting
/// while it is paused; cancellation triggers listen only during the window
/// between triggering and execution.
fn activation_for(
    execution_type: TriggerExecutionType,
    state: AutomationScheduleState,
) -> TriggerActivation {
    match execution_type {
        TriggerExecutionType::Execution => match state {
            AutomationScheduleState::Idle => TriggerActivation::Active,
            AutomationScheduleState::Paused => TriggerActivation::AccumulateOnly,
            _ => TriggerActivation::Disabled,
        },
        TriggerExecutionType::DelayCancellation => match state {
            AutomationScheduleState::Triggered | AutomationScheduleState::Prepared => {
                TriggerActivation::Active
            }
            _ => TriggerActivation::Disabled,
        },
    }
}

/// Trigger definitions of a schedule paired with their execution type, in
/// declaration order.
fn trigger_pairs(
    schedule: &AutomationSchedule,
) -> impl Iterator<Item = (&AutomationTrigger, TriggerExecutionType)> {
    let cancellation = schedule
        .delay
        .iter()
        .filter_map(|delay| delay.cancellation_triggers.as_deref())
        .flatten();
    schedule
        .triggers
        .iter()
        .map(|trigger| (trigger, TriggerExecutionType::Execution))
        .chain(cancellation.map(|trigger| (trigger, TriggerExecutionType::DelayCancellation)))
}

struct ProcessorState {
    /// Armed triggers in schedule insertion order.
    triggers: Vec<PreparedTrigger>,
    /// Last observed ambient state, replayed when schedules reactivate.
    app_session_state: Option<TriggerableState>,
}

/// Evaluates every known trigger against the event stream and broadcasts
/// firings.
pub struct AutomationTriggerProcessor {
    store: Arc<dyn TriggerStore>,
    state: Mutex<ProcessorState>,
    sender: broadcast::Sender<TriggerResult>,
    paused: AtomicBool,
}

impl AutomationTriggerProcessor {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        let (sender, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Mutex::new(ProcessorState {
                triggers: Vec::new(),
                app_session_state: None,
            }),
            sender,
            paused: AtomicBool::new(false),
        }
    }

    /// New subscription to trigger firings. Results are broadcast; every
    /// subscriber sees every firing from subscription onward.
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerResult> {
        self.sender.subscribe()
    }

    /// Suppresses emission globally. Counters keep advancing; nothing is
    /// replayed on unpause, but an already satisfied counter fires on the
    /// next qualifying event.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Runs one event through every armed trigger.
    pub async fn process_event(&self, event: &AutomationEvent) {
        let suppressed = self.paused.load(Ordering::Relaxed);
        let date = Utc::now();
        let mut state = self.state.lock().await;

        if let AutomationEvent::StateChanged(new_state) = event {
            state.app_session_state = Some(new_state.clone());
        }

        let mut outcomes = Vec::new();
        for trigger in &mut state.triggers {
            if let Some(outcome) = trigger.process(event, date, suppressed) {
                outcomes.push(outcome);
            }
        }
        self.flush(outcomes).await;
    }

    /// Rebuilds the armed trigger set from the given schedules, loading
    /// persisted progress and dropping progress for schedules that no
    /// longer exist. Idempotent; call on boot and after catalog changes.
    pub async fn restore_schedules(
        &self,
        schedules: &[AutomationScheduleData],
    ) -> StoreResult<()> {
        let ids: Vec<String> = schedules
            .iter()
            .map(|data| data.schedule.identifier.clone())
            .collect();
        self.store.delete_trigger_data_excluding(&ids).await?;

        let mut triggers = Vec::new();
        for data in schedules {
            for (trigger, execution_type) in trigger_pairs(&data.schedule) {
                triggers.push(self.build_trigger(data, trigger, execution_type).await?);
            }
        }

        let mut state = self.state.lock().await;
        state.triggers = triggers;
        debug!(count = state.triggers.len(), "Restored triggers");
        Ok(())
    }

    /// Applies edited or new schedule definitions. Existing progress
    /// survives an edit; triggers removed by it lose theirs.
    pub async fn update_schedules(
        &self,
        schedules: &[AutomationScheduleData],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for data in schedules {
            let schedule_id = data.schedule.identifier.clone();
            let current: Vec<(&AutomationTrigger, TriggerExecutionType)> =
                trigger_pairs(&data.schedule).collect();

            let removed: Vec<String> = state
                .triggers
                .iter()
                .filter(|armed| {
                    armed.schedule_id == schedule_id
                        && !current.iter().any(|(trigger, execution_type)| {
                            trigger.id() == armed.trigger.id()
                                && *execution_type == armed.execution_type
                        })
                })
                .map(|armed| armed.trigger.id().to_owned())
                .collect();
            if !removed.is_empty() {
                self.store.delete_trigger_data(&schedule_id, &removed).await?;
                state.triggers.retain(|armed| {
                    armed.schedule_id != schedule_id
                        || !removed.iter().any(|id| id == armed.trigger.id())
                });
            }

            for (trigger, execution_type) in current {
                let existing = state.triggers.iter_mut().find(|armed| {
                    armed.schedule_id == schedule_id
                        && armed.trigger.id() == trigger.id()
                        && armed.execution_type == execution_type
                });
                match existing {
                    Some(armed) => {
                        armed.update(trigger.clone(), data.schedule.start_date);
                        armed.set_activation(activation_for(execution_type, data.schedule_state));
                    }
                    None => {
                        let built = self.build_trigger(data, trigger, execution_type).await?;
                        state.triggers.push(built);
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-derives trigger activation after a schedule state change. A
    /// schedule returning to active re-evaluates against the latest
    /// observed context, so goals satisfied while it was away fire now
    /// instead of being dropped.
    pub async fn update_schedule_state(
        &self,
        schedule_id: &str,
        schedule_state: AutomationScheduleState,
    ) {
        let suppressed = self.paused.load(Ordering::Relaxed);
        let date = Utc::now();
        let mut state = self.state.lock().await;
        let session = state.app_session_state.clone();

        let mut outcomes = Vec::new();
        for trigger in state
            .triggers
            .iter_mut()
            .filter(|armed| armed.schedule_id == schedule_id)
        {
            let activation = activation_for(trigger.execution_type, schedule_state);
            let reactivated = activation == TriggerActivation::Active
                && trigger.activation != TriggerActivation::Active;
            trigger.set_activation(activation);

            if reactivated
                && trigger.execution_type == TriggerExecutionType::Execution
                && !suppressed
            {
                if let Some(session) = &session {
                    let replay = AutomationEvent::StateChanged(session.clone());
                    if let Some(outcome) = trigger.process(&replay, date, false) {
                        outcomes.push(outcome);
                    }
                }
                if let Some(outcome) = trigger.fire_if_satisfied(date) {
                    outcomes.push(outcome);
                }
            }
        }
        self.flush(outcomes).await;
    }

    /// Disarms the given schedules and deletes their progress. They produce
    /// nothing further until re-introduced by an upsert or restore.
    pub async fn cancel(&self, schedule_ids: &[String]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .triggers
            .retain(|armed| !schedule_ids.contains(&armed.schedule_id));
        self.store
            .delete_trigger_data_for_schedules(schedule_ids)
            .await?;
        Ok(())
    }

    async fn build_trigger(
        &self,
        data: &AutomationScheduleData,
        trigger: &AutomationTrigger,
        execution_type: TriggerExecutionType,
    ) -> StoreResult<PreparedTrigger> {
        let schedule_id = &data.schedule.identifier;
        let mut progress = self
            .store
            .trigger_data(schedule_id, trigger.id())
            .await?
            .unwrap_or_else(|| {
                TriggerData::new(schedule_id.clone(), trigger.id().to_owned())
            });
        trigger.remove_stale_child_data(&mut progress);

        Ok(PreparedTrigger::new(
            schedule_id.clone(),
            trigger.clone(),
            execution_type,
            activation_for(execution_type, data.schedule_state),
            progress,
            data.schedule.start_date,
        ))
    }

    /// Persists changed progress, then emits firings. Persistence failure
    /// drops the emissions: the counter write must land before a result is
    /// observable.
    async fn flush(&self, outcomes: Vec<TriggerOutcome>) {
        if outcomes.is_empty() {
            return;
        }
        let mut batch = Vec::with_capacity(outcomes.len());
        let mut results = Vec::new();
        for outcome in outcomes {
            batch.push(outcome.data);
            if let Some(result) = outcome.result {
                results.push(result);
            }
        }

        if let Err(err) = self.store.upsert_trigger_data(batch).await {
            error!(
                error = %err,
                dropped = results.len(),
                "Failed to persist trigger progress"
            );
            return;
        }

        for result in results {
            debug!(
                schedule_id = %result.schedule_id,
                execution_type = result.trigger_execution_type.as_str(),
                "Trigger fired"
            );
            let _ = self.sender.send(result);
        }
    }
}
