//! Triggers armed against live schedules.
//!
//! The processor holds one [`PreparedTrigger`] per trigger of every known
//! schedule. Each binds the trigger definition to its persisted progress
//! and to an activation level derived from the schedule's state.

use chrono::{DateTime, Utc};

use autoflow_core::{
    AutomationEvent, AutomationTrigger, DeferredTriggerContext, TriggerData,
    TriggerExecutionType, TriggerResult, TriggeringInfo,
};

/// What a trigger is allowed to do with incoming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerActivation {
    /// Counts and emits firings.
    Active,
    /// Counts, including past the goal, but never emits. Paused schedules
    /// keep accumulating through this.
    AccumulateOnly,
    /// Ignores events entirely.
    Disabled,
}

/// What processing one event produced for one trigger.
#[derive(Debug)]
pub(crate) struct TriggerOutcome {
    /// Progress snapshot to persist.
    pub data: TriggerData,
    /// Present when the trigger fired and emission was allowed.
    pub result: Option<TriggerResult>,
}

/// A schedule trigger bound to its live progress.
#[derive(Debug)]
pub(crate) struct PreparedTrigger {
    pub schedule_id: String,
    pub trigger: AutomationTrigger,
    pub execution_type: TriggerExecutionType,
    pub activation: TriggerActivation,
    pub data: TriggerData,
    /// Events dated before this are ignored.
    pub started: Option<DateTime<Utc>>,
}

impl PreparedTrigger {
    pub fn new(
        schedule_id: String,
        trigger: AutomationTrigger,
        execution_type: TriggerExecutionType,
        activation: TriggerActivation,
        data: TriggerData,
        started: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            schedule_id,
            trigger,
            execution_type,
            activation,
            data,
            started,
        }
    }

    /// Replaces the trigger definition after a schedule edit. Progress for
    /// compound children that no longer exist is dropped; everything else
    /// survives the edit.
    pub fn update(&mut self, trigger: AutomationTrigger, started: Option<DateTime<Utc>>) {
        trigger.remove_stale_child_data(&mut self.data);
        self.trigger = trigger;
        self.started = started;
    }

    /// Changes the activation level. Cancellation triggers watch a single
    /// firing's wait window, so they restart their count each time they
    /// arm; execution triggers keep accumulated progress.
    pub fn set_activation(&mut self, activation: TriggerActivation) {
        if activation == TriggerActivation::Active
            && self.activation != TriggerActivation::Active
            && self.execution_type == TriggerExecutionType::DelayCancellation
        {
            self.data.reset();
        }
        self.activation = activation;
    }

    /// Feeds one event through the trigger. Returns a progress snapshot to
    /// persist when anything advanced, plus a result when the trigger fired
    /// and emission was allowed. A firing consumes the goal from the
    /// counter; suppressed emission leaves the counter accumulating.
    pub fn process(
        &mut self,
        event: &AutomationEvent,
        date: DateTime<Utc>,
        emission_suppressed: bool,
    ) -> Option<TriggerOutcome> {
        if self.activation == TriggerActivation::Disabled {
            return None;
        }
        if let Some(started) = self.started {
            if date < started {
                return None;
            }
        }

        let emit = self.activation == TriggerActivation::Active && !emission_suppressed;
        let previous = self.data.clone();
        let matched = self.trigger.match_event(event, &mut self.data, emit)?;

        let fired = matched.triggered && emit;
        if !fired && self.data == previous {
            return None;
        }

        let result = fired.then(|| self.make_result(event.event_data(), date));
        Some(TriggerOutcome {
            data: self.data.clone(),
            result,
        })
    }

    /// Emits a firing for progress that already meets the goal, consuming
    /// it. Used when a schedule comes back from paused with a satisfied
    /// counter, so the firing is not silently dropped.
    pub fn fire_if_satisfied(&mut self, date: DateTime<Utc>) -> Option<TriggerOutcome> {
        if self.activation != TriggerActivation::Active {
            return None;
        }
        if !self.trigger.is_triggered(&self.data) {
            return None;
        }
        self.data.carry_over(self.trigger.goal());
        Some(TriggerOutcome {
            data: self.data.clone(),
            result: Some(self.make_result(serde_json::Value::Null, date)),
        })
    }

    fn make_result(&self, event: serde_json::Value, date: DateTime<Utc>) -> TriggerResult {
        TriggerResult {
            schedule_id: self.schedule_id.clone(),
            trigger_execution_type: self.execution_type,
            trigger_info: TriggeringInfo {
                context: Some(DeferredTriggerContext {
                    trigger_type: self.trigger.type_name().to_owned(),
                    goal: self.trigger.goal(),
                    event,
                }),
                date,
            },
        }
    }
}
