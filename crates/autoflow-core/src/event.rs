//! Automation events
//!
//! Events are the sole input to the trigger processor. The host application
//! bridges its own signals (lifecycle, analytics, screen tracking) into this
//! closed set; unknown signals simply never become events.

use serde::{Deserialize, Serialize};

/// Event kinds that can advance trigger counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTriggerType {
    /// App brought to the foreground
    Foreground,

    /// App sent to the background
    Background,

    /// Screen view
    Screen,

    /// App version changed since the last run
    Version,

    /// First event of a process lifetime
    AppInit,

    /// Region entered
    RegionEnter,

    /// Region exited
    RegionExit,

    /// Custom event, weighted 1.0 per occurrence
    CustomEventCount,

    /// Custom event, weighted by its reported value
    CustomEventValue,

    /// Feature flag interaction
    FeatureFlagInteraction,

    /// A new app session became active
    ActiveSession,
}

impl EventTriggerType {
    /// Document value for this type. Matches the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::Screen => "screen",
            Self::Version => "version",
            Self::AppInit => "app_init",
            Self::RegionEnter => "region_enter",
            Self::RegionExit => "region_exit",
            Self::CustomEventCount => "custom_event_count",
            Self::CustomEventValue => "custom_event_value",
            Self::FeatureFlagInteraction => "feature_flag_interaction",
            Self::ActiveSession => "active_session",
        }
    }
}

/// Ambient app state observed by state-change triggers.
///
/// `version` and `active_session` triggers are edge-detected: they compare
/// the incoming state against the snapshot stored with their progress record
/// and ignore repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerableState {
    /// Identifier of the current app session, if one is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_session_id: Option<String>,

    /// Version string recorded when an app update is detected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_updated: Option<String>,
}

/// A single input to the trigger processor.
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationEvent {
    /// A discrete or weighted application event
    Event {
        trigger_type: EventTriggerType,
        /// Payload the trigger predicate is evaluated against
        data: Option<serde_json::Value>,
        /// Counter weight; 1.0 for discrete events
        value: f64,
    },

    /// The ambient app state changed
    StateChanged(TriggerableState),
}

impl AutomationEvent {
    /// Discrete event with weight 1.0 and no payload.
    pub fn event(trigger_type: EventTriggerType) -> Self {
        Self::Event {
            trigger_type,
            data: None,
            value: 1.0,
        }
    }

    /// Event carrying a payload for predicate evaluation, weight 1.0.
    pub fn with_data(trigger_type: EventTriggerType, data: serde_json::Value) -> Self {
        Self::Event {
            trigger_type,
            data: Some(data),
            value: 1.0,
        }
    }

    /// Event with an explicit counter weight.
    pub fn weighted(
        trigger_type: EventTriggerType,
        data: Option<serde_json::Value>,
        value: f64,
    ) -> Self {
        Self::Event {
            trigger_type,
            data,
            value,
        }
    }

    pub fn is_state_event(&self) -> bool {
        matches!(self, Self::StateChanged(_))
    }

    /// Payload snapshot used when reporting a firing's context.
    pub fn event_data(&self) -> serde_json::Value {
        match self {
            Self::Event { data, .. } => data.clone().unwrap_or(serde_json::Value::Null),
            Self::StateChanged(_) => serde_json::Value::Null,
        }
    }
}
