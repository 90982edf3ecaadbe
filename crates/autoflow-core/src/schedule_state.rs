//! Schedule lifecycle state
//!
//! [`AutomationScheduleData`] wraps a schedule document with its runtime
//! state: where it is in the trigger/prepare/execute pipeline, how often it
//! has executed, and what fired it. Every transition re-checks the execution
//! limit and expiry, so a schedule can finish from any state. Transitions
//! only mutate in memory; callers persist the record afterwards.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::AutomationSchedule;
use crate::trigger::TriggeringInfo;

/// Lifecycle states of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationScheduleState {
    /// Waiting for its triggers
    Idle,

    /// A trigger fired; the schedule is queued for preparation
    Triggered,

    /// Preparation finished; waiting for delay conditions and execution
    Prepared,

    /// The payload is executing
    Executing,

    /// Sitting out its execution interval
    Paused,

    /// Cancelled during preparation, retained through its grace period
    PrepareCancelled,

    /// Exhausted or expired, retained through its grace period
    Finished,
}

impl AutomationScheduleState {
    /// States that survive a process restart with work in flight.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, Self::Executing | Self::Prepared | Self::Triggered)
    }

    /// Terminal states eligible for grace-period deletion.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::PrepareCancelled)
    }
}

/// Handle to a prepared execution, created when preparation succeeds and
/// consumed when the schedule executes or is invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedScheduleInfo {
    pub schedule_id: String,

    /// Session the preparation belongs to; a re-trigger rotates it
    pub trigger_session_id: String,

    #[serde(default)]
    pub priority: i32,
}

/// A schedule document plus its runtime state. The unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationScheduleData {
    pub schedule: AutomationSchedule,

    pub schedule_state: AutomationScheduleState,

    pub schedule_state_change_date: DateTime<Utc>,

    #[serde(default)]
    pub execution_count: u32,

    /// Rotates every time the schedule is triggered
    pub trigger_session_id: String,

    /// What fired the schedule, kept while the firing is being serviced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_info: Option<TriggeringInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared_schedule_info: Option<PreparedScheduleInfo>,

    /// Opaque host data carried alongside the schedule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<serde_json::Value>,
}

impl AutomationScheduleData {
    pub fn new(schedule: AutomationSchedule, date: DateTime<Utc>) -> Self {
        Self {
            schedule,
            schedule_state: AutomationScheduleState::Idle,
            schedule_state_change_date: date,
            execution_count: 0,
            trigger_session_id: Uuid::new_v4().to_string(),
            trigger_info: None,
            prepared_schedule_info: None,
            associated_data: None,
        }
    }

    /// Applies an edit: a fresh document keeps the existing runtime state.
    pub fn update_or_create(
        existing: Option<Self>,
        mut schedule: AutomationSchedule,
        date: DateTime<Utc>,
    ) -> Self {
        schedule.last_updated = Some(date);
        match existing {
            None => Self::new(schedule, date),
            Some(mut data) => {
                data.schedule = schedule;
                data
            }
        }
    }

    pub fn is_in_state(&self, states: &[AutomationScheduleState]) -> bool {
        states.contains(&self.schedule_state)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.schedule.end_date.is_some_and(|end| end <= now)
    }

    /// Started and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let started = self.schedule.start_date.map_or(true, |start| start <= now);
        started && !self.is_expired(now)
    }

    /// An unset limit means a single execution; zero means unlimited.
    pub fn is_over_limit(&self) -> bool {
        match self.schedule.limit.unwrap_or(1) {
            0 => false,
            limit => self.execution_count >= limit,
        }
    }

    /// Whether a terminal schedule's grace period has lapsed.
    pub fn should_delete(&self, now: DateTime<Utc>) -> bool {
        if !self.schedule_state.is_terminal() {
            return false;
        }
        match self.schedule.edit_grace_period_days {
            None => true,
            Some(days) => {
                self.schedule_state_change_date + Duration::days(days as i64) <= now
            }
        }
    }

    fn finish_if_exhausted(&mut self, date: DateTime<Utc>) -> bool {
        if self.is_over_limit() || self.is_expired(date) {
            self.finished(date);
            true
        } else {
            false
        }
    }

    fn set_state(&mut self, state: AutomationScheduleState, date: DateTime<Utc>) {
        self.schedule_state = state;
        self.schedule_state_change_date = date;
    }

    /// A trigger fired. Records the firing context, rotates the trigger
    /// session and moves to `Triggered`.
    pub fn triggered(&mut self, trigger_info: TriggeringInfo, date: DateTime<Utc>) {
        if self.finish_if_exhausted(date) {
            return;
        }
        self.trigger_info = Some(trigger_info);
        self.trigger_session_id = Uuid::new_v4().to_string();
        self.set_state(AutomationScheduleState::Triggered, date);
    }

    /// Preparation succeeded for a triggered schedule.
    pub fn prepared(&mut self, info: PreparedScheduleInfo, date: DateTime<Utc>) {
        if self.schedule_state != AutomationScheduleState::Triggered {
            return;
        }
        if self.finish_if_exhausted(date) {
            return;
        }
        self.prepared_schedule_info = Some(info);
        self.set_state(AutomationScheduleState::Prepared, date);
    }

    pub fn executing(&mut self, date: DateTime<Utc>) {
        if self.schedule_state != AutomationScheduleState::Prepared {
            return;
        }
        self.set_state(AutomationScheduleState::Executing, date);
    }

    /// The process died between triggering and execution. A prepared
    /// schedule falls back to `Triggered` to be prepared again; an already
    /// triggered one stays put.
    pub fn prepare_interrupted(&mut self, date: DateTime<Utc>) {
        match self.schedule_state {
            AutomationScheduleState::Prepared => {
                if self.finish_if_exhausted(date) {
                    return;
                }
                self.prepared_schedule_info = None;
                self.set_state(AutomationScheduleState::Triggered, date);
            }
            AutomationScheduleState::Triggered => {
                self.finish_if_exhausted(date);
            }
            _ => {}
        }
    }

    /// The process died mid-execution. With `retry` the execution does not
    /// count and the schedule is re-prepared; otherwise it completes as if
    /// the execution finished.
    pub fn execution_interrupted(&mut self, date: DateTime<Utc>, retry: bool) {
        if retry {
            self.prepared_schedule_info = None;
            if self.finish_if_exhausted(date) {
                return;
            }
            self.set_state(AutomationScheduleState::Triggered, date);
        } else {
            self.finished_executing(date);
        }
    }

    /// A delay cancellation trigger fired while the schedule was prepared.
    pub fn execution_cancelled(&mut self, date: DateTime<Utc>) {
        if self.finish_if_exhausted(date) {
            return;
        }
        self.idle(date);
    }

    /// The executor declined this execution; no execution is consumed.
    pub fn execution_skipped(&mut self, date: DateTime<Utc>) {
        if self.finish_if_exhausted(date) {
            return;
        }
        self.idle(date);
    }

    /// The prepared payload is stale. Back to `Triggered` so the pipeline
    /// can prepare it again with the same firing context.
    pub fn execution_invalidated(&mut self, date: DateTime<Utc>) {
        if self.finish_if_exhausted(date) {
            return;
        }
        self.prepared_schedule_info = None;
        self.set_state(AutomationScheduleState::Triggered, date);
    }

    /// Preparation resolved to skip or penalize.
    pub fn prepare_cancelled(&mut self, date: DateTime<Utc>, penalize: bool) {
        if penalize {
            self.execution_count += 1;
        }
        if self.finish_if_exhausted(date) {
            return;
        }
        self.idle(date);
    }

    /// Preparation cancelled the schedule outright, but an edit grace
    /// period keeps the record around for a possible revival.
    pub fn prepare_cancelled_with_grace(&mut self, date: DateTime<Utc>) {
        self.trigger_info = None;
        self.prepared_schedule_info = None;
        self.set_state(AutomationScheduleState::PrepareCancelled, date);
    }

    /// An execution completed. Consumes one execution, then settles into
    /// `Paused` (interval), `Finished` (exhausted) or `Idle`.
    pub fn finished_executing(&mut self, date: DateTime<Utc>) {
        self.execution_count += 1;
        self.prepared_schedule_info = None;
        if self.finish_if_exhausted(date) {
            return;
        }
        if self.schedule.interval.is_some() {
            self.paused(date);
        } else {
            self.idle(date);
        }
    }

    pub fn finished(&mut self, date: DateTime<Utc>) {
        self.trigger_info = None;
        self.prepared_schedule_info = None;
        self.set_state(AutomationScheduleState::Finished, date);
    }

    pub fn idle(&mut self, date: DateTime<Utc>) {
        self.trigger_info = None;
        self.prepared_schedule_info = None;
        self.set_state(AutomationScheduleState::Idle, date);
    }

    pub fn paused(&mut self, date: DateTime<Utc>) {
        self.trigger_info = None;
        self.prepared_schedule_info = None;
        self.set_state(AutomationScheduleState::Paused, date);
    }

    /// Reconciles state with the current limit and dates: exhausts live
    /// schedules that are over limit or expired, and revives terminal ones
    /// whose edit lifted the restriction.
    pub fn update_state(&mut self, date: DateTime<Utc>) {
        if self.is_over_limit() || self.is_expired(date) {
            if !self.schedule_state.is_terminal() {
                self.finished(date);
            }
        } else if self.schedule_state.is_terminal() {
            self.idle(date);
        }
    }
}
