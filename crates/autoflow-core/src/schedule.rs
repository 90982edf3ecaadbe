//! Schedule documents
//!
//! A schedule pairs triggers with a payload and the constraints that govern
//! when the payload may run. Schedules arrive as JSON documents from the
//! host (remote config, test fixtures) and round-trip losslessly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trigger::{
    deserialize_cancellation_triggers, deserialize_execution_triggers, AutomationTrigger,
};

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule '{id}' has {count} triggers, limit is {limit}")]
    TooManyTriggers { id: String, count: usize, limit: usize },

    #[error("schedule '{id}' trigger '{trigger_id}' has non-positive goal {goal}")]
    InvalidGoal {
        id: String,
        trigger_id: String,
        goal: f64,
    },
}

/// Discriminates the payload kinds a schedule can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Actions,
    InAppMessage,
    Deferred,
}

/// What a deferred payload resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredType {
    Actions,
    InAppMessage,
}

/// Payload fetched from a remote endpoint at prepare time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAutomationData {
    pub url: String,

    #[serde(rename = "type")]
    pub deferred_type: DeferredType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_timeout: Option<bool>,
}

/// The payload executed when a schedule fires.
///
/// Payloads are opaque to the engine; it stores and forwards them. Only the
/// prepare step interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleData {
    Actions { actions: serde_json::Value },
    InAppMessage { message: serde_json::Value },
    Deferred { deferred: DeferredAutomationData },
}

impl ScheduleData {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Self::Actions { .. } => ScheduleType::Actions,
            Self::InAppMessage { .. } => ScheduleType::InAppMessage,
            Self::Deferred { .. } => ScheduleType::Deferred,
        }
    }
}

/// What to do with a schedule whose audience check misses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissBehavior {
    /// Cancel the schedule entirely
    Cancel,

    /// Return to idle without consuming an execution
    Skip,

    /// Return to idle and count the miss as an execution
    #[default]
    Penalize,
}

/// Audience targeting for a schedule. The selector itself is evaluated by
/// the host's prepare step; the engine only acts on the miss behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationAudience {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miss_behavior: Option<MissBehavior>,

    /// Remaining audience fields, passed through untouched
    #[serde(flatten)]
    pub selector: serde_json::Value,
}

/// App states a delayed schedule can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationAppState {
    Foreground,
    Background,
}

/// Conditions that must hold between triggering and execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationDelay {
    /// Minimum seconds after the triggering event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,

    /// Required app state while waiting and at execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_state: Option<AutomationAppState>,

    /// The current screen must be one of these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screens: Option<Vec<String>>,

    /// Triggers that cancel the wait when they fire
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_cancellation_triggers"
    )]
    pub cancellation_triggers: Option<Vec<AutomationTrigger>>,
}

/// A complete schedule document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationSchedule {
    #[serde(rename = "id")]
    pub identifier: String,

    #[serde(deserialize_with = "deserialize_execution_triggers")]
    pub triggers: Vec<AutomationTrigger>,

    pub created: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Cancellation group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Lower values execute first; unset means 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Max executions; unset means 1, zero means unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    #[serde(rename = "start", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(rename = "end", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<AutomationAudience>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<AutomationDelay>,

    /// Seconds to pause after each execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    #[serde(flatten)]
    pub data: ScheduleData,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass_holdout_groups: Option<bool>,

    /// Days a cancelled or finished schedule lingers so an edit can revive it
    #[serde(rename = "edit_grace_period", skip_serializing_if = "Option::is_none")]
    pub edit_grace_period_days: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_constraint_ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

impl AutomationSchedule {
    pub const TRIGGER_LIMIT: usize = 10;

    /// Minimal schedule with everything optional unset.
    pub fn new(
        identifier: impl Into<String>,
        triggers: Vec<AutomationTrigger>,
        data: ScheduleData,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            triggers,
            created,
            last_updated: None,
            group: None,
            priority: None,
            limit: None,
            start_date: None,
            end_date: None,
            audience: None,
            delay: None,
            interval: None,
            data,
            bypass_holdout_groups: None,
            edit_grace_period_days: None,
            metadata: None,
            frequency_constraint_ids: None,
            message_type: None,
        }
    }

    /// All triggers of the schedule, execution and delay cancellation.
    pub fn all_triggers(&self) -> impl Iterator<Item = &AutomationTrigger> {
        self.triggers.iter().chain(
            self.delay
                .iter()
                .filter_map(|delay| delay.cancellation_triggers.as_deref())
                .flatten(),
        )
    }

    pub fn validate(&self) -> ScheduleResult<()> {
        if self.triggers.len() > Self::TRIGGER_LIMIT {
            return Err(ScheduleError::TooManyTriggers {
                id: self.identifier.clone(),
                count: self.triggers.len(),
                limit: Self::TRIGGER_LIMIT,
            });
        }
        for trigger in self.all_triggers() {
            if let Some((trigger_id, goal)) = trigger.invalid_goal() {
                return Err(ScheduleError::InvalidGoal {
                    id: self.identifier.clone(),
                    trigger_id: trigger_id.to_owned(),
                    goal,
                });
            }
        }
        Ok(())
    }
}
