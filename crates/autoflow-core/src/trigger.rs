//! Trigger definitions and matching
//!
//! Triggers pair a goal with an event source: every matching event increments
//! a floating-point counter, and the trigger fires when the counter reaches
//! the goal. Compound triggers (`or`, `and`, `chain`) combine child triggers
//! and keep per-child progress. Matching is pure state transformation over
//! [`TriggerData`]; persistence and emission live in the engine crate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::event::{AutomationEvent, EventTriggerType, TriggerableState};
use crate::predicate::EventPredicate;

/// Which schedule concern a trigger drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerExecutionType {
    /// Firing starts the schedule's prepare/execute pipeline
    Execution,

    /// Firing cancels a schedule waiting out its delay
    DelayCancellation,
}

impl TriggerExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::DelayCancellation => "delay_cancellation",
        }
    }
}

/// Combinators for compound triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompoundTriggerType {
    /// Any child firing increments the compound counter
    Or,

    /// All children must be fired at once to increment
    And,

    /// Like `and`, but children unlock strictly in order
    Chain,
}

impl CompoundTriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Chain => "chain",
        }
    }
}

/// Event-sourced trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAutomationTrigger {
    /// Stable identifier; derived from content when the document omits it
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub trigger_type: EventTriggerType,

    /// Counter threshold, must be positive
    pub goal: f64,

    /// Optional payload filter; events failing it do not count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<EventPredicate>,
}

impl EventAutomationTrigger {
    pub fn new(trigger_type: EventTriggerType, goal: f64, predicate: Option<EventPredicate>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trigger_type,
            goal,
            predicate,
        }
    }

    fn predicate_matches(&self, payload: &serde_json::Value) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.apply(payload))
    }

    fn evaluate(&self, data: &mut TriggerData, increment: f64) -> MatchResult {
        data.increment(increment);
        MatchResult {
            trigger_id: self.id.clone(),
            triggered: data.count >= self.goal,
        }
    }

    /// Matches one event against this trigger, mutating `data` in place.
    /// Returns `None` when the event is irrelevant to this trigger.
    pub(crate) fn match_event(
        &self,
        event: &AutomationEvent,
        data: &mut TriggerData,
    ) -> Option<MatchResult> {
        match event {
            AutomationEvent::Event {
                trigger_type,
                data: payload,
                value,
            } => {
                if *trigger_type != self.trigger_type {
                    return None;
                }
                let null = serde_json::Value::Null;
                if !self.predicate_matches(payload.as_ref().unwrap_or(&null)) {
                    return None;
                }
                Some(self.evaluate(data, *value))
            }
            AutomationEvent::StateChanged(state) => self.match_state(state, data),
        }
    }

    /// State triggers are edge-detected: only a value different from the one
    /// recorded at the last firing counts.
    fn match_state(
        &self,
        state: &TriggerableState,
        data: &mut TriggerData,
    ) -> Option<MatchResult> {
        match self.trigger_type {
            EventTriggerType::Version => {
                let version = state.version_updated.as_ref()?;
                let last = data
                    .last_triggerable_state
                    .as_ref()
                    .and_then(|s| s.version_updated.as_ref());
                if last == Some(version) {
                    return None;
                }
                if !self.predicate_matches(&serde_json::json!({ "version": version })) {
                    return None;
                }
                data.last_triggerable_state = Some(state.clone());
                Some(self.evaluate(data, 1.0))
            }
            EventTriggerType::ActiveSession => {
                let session = state.app_session_id.as_ref()?;
                let last = data
                    .last_triggerable_state
                    .as_ref()
                    .and_then(|s| s.app_session_id.as_ref());
                if last == Some(session) {
                    return None;
                }
                data.last_triggerable_state = Some(state.clone());
                Some(self.evaluate(data, 1.0))
            }
            _ => None,
        }
    }
}

/// A child slot inside a compound trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundTriggerChild {
    pub trigger: AutomationTrigger,

    /// Sticky children keep their progress when the compound increments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sticky: Option<bool>,

    /// For `or` compounds: reset this child's progress on every increment,
    /// fired or not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_on_increment: Option<bool>,
}

impl CompoundTriggerChild {
    pub fn new(trigger: AutomationTrigger) -> Self {
        Self {
            trigger,
            is_sticky: None,
            reset_on_increment: None,
        }
    }

    pub fn sticky(trigger: AutomationTrigger) -> Self {
        Self {
            trigger,
            is_sticky: Some(true),
            reset_on_increment: None,
        }
    }
}

/// Trigger combining child triggers under a combinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundAutomationTrigger {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub compound_type: CompoundTriggerType,

    pub goal: f64,

    pub children: Vec<CompoundTriggerChild>,
}

impl CompoundAutomationTrigger {
    pub fn new(
        compound_type: CompoundTriggerType,
        goal: f64,
        children: Vec<CompoundTriggerChild>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            compound_type,
            goal,
            children,
        }
    }

    /// Matches one event through the children and applies the combinator.
    /// Unlike event triggers this always reports, since child progress may
    /// have changed even when the compound did not increment.
    pub(crate) fn match_event(
        &self,
        event: &AutomationEvent,
        data: &mut TriggerData,
    ) -> MatchResult {
        let triggered_before = self.triggered_children_count(data);
        let mut child_results = self.match_children(event, data);

        // Chain children unlocked by this event must observe the last known
        // app state immediately, so replay it through the children once.
        let last_state = data.last_triggerable_state.clone();
        if self.compound_type == CompoundTriggerType::Chain
            && last_state.is_some()
            && !event.is_state_event()
            && triggered_before != self.triggered_children_count(data)
        {
            if let Some(state) = last_state {
                child_results = self.match_children(&AutomationEvent::StateChanged(state), data);
            }
        } else if let AutomationEvent::StateChanged(state) = event {
            data.last_triggerable_state = Some(state.clone());
        }

        match self.compound_type {
            CompoundTriggerType::And | CompoundTriggerType::Chain => {
                if child_results.iter().all(|r| r.triggered) {
                    for child in &self.children {
                        if child.is_sticky != Some(true) {
                            data.child_data(child.trigger.id()).reset();
                        }
                    }
                    data.increment(1.0);
                }
            }
            CompoundTriggerType::Or => {
                if child_results.iter().any(|r| r.triggered) {
                    for child in &self.children {
                        let goal = child.trigger.goal();
                        let reset_on_increment = child.reset_on_increment == Some(true);
                        let child_data = data.child_data(child.trigger.id());
                        if child_data.count >= goal || reset_on_increment {
                            child_data.reset();
                        }
                    }
                    data.increment(1.0);
                }
            }
        }

        MatchResult {
            trigger_id: self.id.clone(),
            triggered: data.count >= self.goal,
        }
    }

    /// Runs the event through each child in order. Chain combinators stop
    /// evaluating after the first non-fired child; later children only
    /// report their stored progress.
    fn match_children(
        &self,
        event: &AutomationEvent,
        data: &mut TriggerData,
    ) -> Vec<MatchResult> {
        let mut evaluate_remaining = true;
        let mut results = Vec::with_capacity(self.children.len());

        for child in &self.children {
            let child_id = child.trigger.id().to_owned();
            let child_data = data.child_data(&child_id);

            let matched = if evaluate_remaining {
                // child resets are owned by the combinator, not the child
                child.trigger.match_event(event, child_data, false)
            } else {
                None
            };
            let result = match matched {
                Some(result) => result,
                None => MatchResult {
                    trigger_id: child_id,
                    triggered: child.trigger.is_triggered(child_data),
                },
            };

            if self.compound_type == CompoundTriggerType::Chain
                && evaluate_remaining
                && !result.triggered
            {
                evaluate_remaining = false;
            }
            results.push(result);
        }

        results
    }

    fn triggered_children_count(&self, data: &TriggerData) -> usize {
        self.children
            .iter()
            .filter(|child| {
                data.children
                    .get(child.trigger.id())
                    .is_some_and(|child_data| child.trigger.is_triggered(child_data))
            })
            .count()
    }

    fn remove_stale_child_data(&self, data: &mut TriggerData) {
        if self.children.is_empty() {
            return;
        }
        let mut kept = HashMap::new();
        for child in &self.children {
            let child_id = child.trigger.id().to_owned();
            let mut child_data = data
                .children
                .remove(&child_id)
                .unwrap_or_else(|| TriggerData::new(data.schedule_id.clone(), child_id.clone()));
            child.trigger.remove_stale_child_data(&mut child_data);
            kept.insert(child_id, child_data);
        }
        data.children = kept;
    }
}

/// A trigger document: either a single event trigger or a compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutomationTrigger {
    Event(EventAutomationTrigger),
    Compound(CompoundAutomationTrigger),
}

impl AutomationTrigger {
    /// Active-session trigger firing after `count` distinct sessions.
    pub fn active_session(count: u32) -> Self {
        Self::Event(EventAutomationTrigger::new(
            EventTriggerType::ActiveSession,
            count as f64,
            None,
        ))
    }

    /// Foreground trigger firing after `count` foregrounds.
    pub fn foreground(count: u32) -> Self {
        Self::Event(EventAutomationTrigger::new(
            EventTriggerType::Foreground,
            count as f64,
            None,
        ))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Event(trigger) => &trigger.id,
            Self::Compound(trigger) => &trigger.id,
        }
    }

    pub fn goal(&self) -> f64 {
        match self {
            Self::Event(trigger) => trigger.goal,
            Self::Compound(trigger) => trigger.goal,
        }
    }

    /// Document name of the trigger type, e.g. `app_init` or `chain`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Event(trigger) => trigger.trigger_type.as_str(),
            Self::Compound(trigger) => trigger.compound_type.as_str(),
        }
    }

    pub fn is_triggered(&self, data: &TriggerData) -> bool {
        data.count >= self.goal()
    }

    /// Matches one event. When `reset_on_trigger` is set and the trigger
    /// fires, the counter carries over: the goal is subtracted rather than
    /// the count cleared, so overshoot from weighted events is not lost.
    pub fn match_event(
        &self,
        event: &AutomationEvent,
        data: &mut TriggerData,
        reset_on_trigger: bool,
    ) -> Option<MatchResult> {
        let result = match self {
            Self::Event(trigger) => trigger.match_event(event, data)?,
            Self::Compound(trigger) => trigger.match_event(event, data),
        };
        if reset_on_trigger && result.triggered {
            data.carry_over(self.goal());
        }
        Some(result)
    }

    /// Drops progress for children no longer present in this trigger's
    /// definition. Surviving children keep their counts.
    pub fn remove_stale_child_data(&self, data: &mut TriggerData) {
        if let Self::Compound(trigger) = self {
            trigger.remove_stale_child_data(data);
        }
    }

    /// Fills in missing identifiers with content-derived stable ids, so the
    /// same document always yields the same ids and re-parsing a schedule
    /// does not orphan stored progress.
    pub fn resolve_ids(&mut self, execution_type: TriggerExecutionType) {
        match self {
            Self::Event(trigger) => {
                if trigger.id.is_empty() {
                    trigger.id = stable_id(
                        trigger.trigger_type.as_str(),
                        trigger.goal,
                        trigger.predicate.as_ref(),
                        execution_type,
                    );
                }
            }
            Self::Compound(trigger) => {
                if trigger.id.is_empty() {
                    trigger.id = stable_id(
                        trigger.compound_type.as_str(),
                        trigger.goal,
                        None,
                        execution_type,
                    );
                }
                for child in &mut trigger.children {
                    child.trigger.resolve_ids(execution_type);
                }
            }
        }
    }

    /// First trigger in this tree with a non-positive goal, if any.
    pub fn invalid_goal(&self) -> Option<(&str, f64)> {
        if self.goal() <= 0.0 {
            return Some((self.id(), self.goal()));
        }
        if let Self::Compound(trigger) = self {
            for child in &trigger.children {
                if let Some(invalid) = child.trigger.invalid_goal() {
                    return Some(invalid);
                }
            }
        }
        None
    }
}

fn stable_id(
    type_name: &str,
    goal: f64,
    predicate: Option<&EventPredicate>,
    execution_type: TriggerExecutionType,
) -> String {
    let mut components = format!("{}:{}:{}", type_name, goal, execution_type.as_str());
    if let Some(predicate) = predicate {
        if let Ok(json) = serde_json::to_string(predicate) {
            components.push(':');
            components.push_str(&json);
        }
    }
    Sha256::digest(components.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Deserializes a schedule's execution triggers, resolving missing ids.
pub(crate) fn deserialize_execution_triggers<'de, D>(
    deserializer: D,
) -> Result<Vec<AutomationTrigger>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mut triggers = Vec::<AutomationTrigger>::deserialize(deserializer)?;
    for trigger in &mut triggers {
        trigger.resolve_ids(TriggerExecutionType::Execution);
    }
    Ok(triggers)
}

/// Deserializes a delay's cancellation triggers, resolving missing ids.
pub(crate) fn deserialize_cancellation_triggers<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<AutomationTrigger>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let triggers = Option::<Vec<AutomationTrigger>>::deserialize(deserializer)?;
    Ok(triggers.map(|mut triggers| {
        for trigger in &mut triggers {
            trigger.resolve_ids(TriggerExecutionType::DelayCancellation);
        }
        triggers
    }))
}

/// Persisted matching progress for one trigger of one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    pub schedule_id: String,
    pub trigger_id: String,

    #[serde(default)]
    pub count: f64,

    /// Progress per child, keyed by child trigger id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub children: HashMap<String, TriggerData>,

    /// Last app state this trigger fired on, for edge detection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggerable_state: Option<TriggerableState>,
}

impl TriggerData {
    pub fn new(schedule_id: String, trigger_id: String) -> Self {
        Self {
            schedule_id,
            trigger_id,
            count: 0.0,
            children: HashMap::new(),
            last_triggerable_state: None,
        }
    }

    pub fn increment(&mut self, value: f64) {
        self.count += value;
    }

    /// Clears the counter. Child progress and observed state are kept.
    pub fn reset(&mut self) {
        self.count = 0.0;
    }

    /// Consumes one firing's worth of progress, keeping any overshoot.
    pub fn carry_over(&mut self, goal: f64) {
        self.count = (self.count - goal).max(0.0);
    }

    /// Child progress record, created on first access.
    pub fn child_data(&mut self, trigger_id: &str) -> &mut TriggerData {
        let schedule_id = self.schedule_id.clone();
        self.children
            .entry(trigger_id.to_owned())
            .or_insert_with(|| TriggerData::new(schedule_id, trigger_id.to_owned()))
    }
}

/// Outcome of matching one event against one trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub trigger_id: String,
    pub triggered: bool,
}

/// Snapshot of what fired a deferred schedule, forwarded to resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTriggerContext {
    /// Trigger type name, e.g. `custom_event_value`
    #[serde(rename = "type")]
    pub trigger_type: String,

    pub goal: f64,

    /// Payload of the event that crossed the goal, or null
    pub event: serde_json::Value,
}

/// Context recorded when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeringInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<DeferredTriggerContext>,

    pub date: DateTime<Utc>,
}

/// Emitted by the trigger processor when a trigger crosses its goal.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub schedule_id: String,
    pub trigger_execution_type: TriggerExecutionType,
    pub trigger_info: TriggeringInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_for(trigger: &AutomationTrigger) -> TriggerData {
        TriggerData::new("schedule".into(), trigger.id().into())
    }

    fn event_trigger(trigger_type: EventTriggerType, goal: f64) -> AutomationTrigger {
        AutomationTrigger::Event(EventAutomationTrigger::new(trigger_type, goal, None))
    }

    // ==================== Event triggers ====================

    #[test]
    fn test_event_trigger_counts_matching_type() {
        let trigger = event_trigger(EventTriggerType::Foreground, 2.0);
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Foreground),
                &mut data,
                true,
            )
            .unwrap();
        assert!(!result.triggered);
        assert_eq!(data.count, 1.0);

        assert!(trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Background),
                &mut data,
                true,
            )
            .is_none());
        assert_eq!(data.count, 1.0);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Foreground),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_carry_over_on_fire() {
        let trigger = event_trigger(EventTriggerType::CustomEventValue, 2.0);
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::weighted(EventTriggerType::CustomEventValue, None, 5.0),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
        assert_eq!(data.count, 3.0);

        // residual progress above the goal fires again on the next event
        let result = trigger
            .match_event(
                &AutomationEvent::weighted(EventTriggerType::CustomEventValue, None, 0.5),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
        assert_eq!(data.count, 1.5);
    }

    #[test]
    fn test_carry_over_never_negative() {
        let mut data = TriggerData::new("s".into(), "t".into());
        data.increment(1.5);
        data.carry_over(2.0);
        assert_eq!(data.count, 0.0);
    }

    #[test]
    fn test_no_reset_without_flag() {
        let trigger = event_trigger(EventTriggerType::AppInit, 1.0);
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::AppInit),
                &mut data,
                false,
            )
            .unwrap();
        assert!(result.triggered);
        assert_eq!(data.count, 1.0);
    }

    #[test]
    fn test_predicate_gates_counting() {
        let trigger = AutomationTrigger::Event(EventAutomationTrigger::new(
            EventTriggerType::CustomEventCount,
            1.0,
            Some(EventPredicate::key_equals("name", json!("purchase"))),
        ));
        let mut data = data_for(&trigger);

        assert!(trigger
            .match_event(
                &AutomationEvent::with_data(
                    EventTriggerType::CustomEventCount,
                    json!({"name": "view"}),
                ),
                &mut data,
                true,
            )
            .is_none());
        assert_eq!(data.count, 0.0);

        let result = trigger
            .match_event(
                &AutomationEvent::with_data(
                    EventTriggerType::CustomEventCount,
                    json!({"name": "purchase"}),
                ),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_predicate_sees_null_for_missing_payload() {
        let trigger = AutomationTrigger::Event(EventAutomationTrigger::new(
            EventTriggerType::AppInit,
            1.0,
            Some(EventPredicate::matches(serde_json::Value::Null)),
        ));
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::AppInit),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    // ==================== State triggers ====================

    #[test]
    fn test_active_session_edge_detection() {
        let trigger = AutomationTrigger::active_session(2);
        let mut data = data_for(&trigger);

        let session = TriggerableState {
            app_session_id: Some("session-1".into()),
            version_updated: None,
        };

        let result = trigger
            .match_event(
                &AutomationEvent::StateChanged(session.clone()),
                &mut data,
                true,
            )
            .unwrap();
        assert!(!result.triggered);
        assert_eq!(data.count, 1.0);

        // same session again is ignored
        assert!(trigger
            .match_event(&AutomationEvent::StateChanged(session), &mut data, true)
            .is_none());
        assert_eq!(data.count, 1.0);

        let next = TriggerableState {
            app_session_id: Some("session-2".into()),
            version_updated: None,
        };
        let result = trigger
            .match_event(&AutomationEvent::StateChanged(next), &mut data, true)
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_active_session_ignores_empty_state() {
        let trigger = AutomationTrigger::active_session(1);
        let mut data = data_for(&trigger);

        assert!(trigger
            .match_event(
                &AutomationEvent::StateChanged(TriggerableState::default()),
                &mut data,
                true,
            )
            .is_none());
    }

    #[test]
    fn test_version_trigger_with_predicate() {
        let trigger = AutomationTrigger::Event(EventAutomationTrigger::new(
            EventTriggerType::Version,
            1.0,
            Some(EventPredicate::matches(json!({"version": "2.0.0"}))),
        ));
        let mut data = data_for(&trigger);

        let old = TriggerableState {
            app_session_id: None,
            version_updated: Some("1.9.0".into()),
        };
        assert!(trigger
            .match_event(&AutomationEvent::StateChanged(old), &mut data, true)
            .is_none());

        let new = TriggerableState {
            app_session_id: None,
            version_updated: Some("2.0.0".into()),
        };
        let result = trigger
            .match_event(&AutomationEvent::StateChanged(new), &mut data, true)
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_state_event_ignored_by_plain_triggers() {
        let trigger = event_trigger(EventTriggerType::Foreground, 1.0);
        let mut data = data_for(&trigger);

        let state = TriggerableState {
            app_session_id: Some("session".into()),
            version_updated: None,
        };
        assert!(trigger
            .match_event(&AutomationEvent::StateChanged(state), &mut data, true)
            .is_none());
    }

    // ==================== Compound triggers ====================

    fn compound(
        compound_type: CompoundTriggerType,
        goal: f64,
        children: Vec<CompoundTriggerChild>,
    ) -> AutomationTrigger {
        AutomationTrigger::Compound(CompoundAutomationTrigger::new(compound_type, goal, children))
    }

    #[test]
    fn test_or_fires_on_any_child() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 1.0);
        let trigger = compound(
            CompoundTriggerType::Or,
            2.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Foreground),
                &mut data,
                true,
            )
            .unwrap();
        assert!(!result.triggered);
        assert_eq!(data.count, 1.0);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Screen),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
        assert_eq!(data.count, 0.0);
    }

    #[test]
    fn test_or_resets_fired_children_only() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 3.0);
        let foreground_id = foreground.id().to_owned();
        let screen_id = screen.id().to_owned();
        let trigger = compound(
            CompoundTriggerType::Or,
            2.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&trigger);

        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Screen),
            &mut data,
            true,
        );
        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Foreground),
            &mut data,
            true,
        );

        // the foreground child fired and was consumed; screen progress stays
        assert_eq!(data.children[&foreground_id].count, 0.0);
        assert_eq!(data.children[&screen_id].count, 1.0);
        assert_eq!(data.count, 1.0);
    }

    #[test]
    fn test_or_reset_on_increment_child() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 3.0);
        let screen_id = screen.id().to_owned();
        let trigger = compound(
            CompoundTriggerType::Or,
            2.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild {
                    trigger: screen,
                    is_sticky: None,
                    reset_on_increment: Some(true),
                },
            ],
        );
        let mut data = data_for(&trigger);

        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Screen),
            &mut data,
            true,
        );
        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Foreground),
            &mut data,
            true,
        );

        // the unfired screen child was cleared because the compound incremented
        assert_eq!(data.children[&screen_id].count, 0.0);
    }

    #[test]
    fn test_and_requires_all_children() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 1.0);
        let trigger = compound(
            CompoundTriggerType::And,
            1.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&trigger);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Foreground),
                &mut data,
                true,
            )
            .unwrap();
        assert!(!result.triggered);
        assert_eq!(data.count, 0.0);

        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Screen),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_and_sticky_child_keeps_progress() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 1.0);
        let foreground_id = foreground.id().to_owned();
        let screen_id = screen.id().to_owned();
        let trigger = compound(
            CompoundTriggerType::And,
            2.0,
            vec![
                CompoundTriggerChild::sticky(foreground),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&trigger);

        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Foreground),
            &mut data,
            true,
        );
        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Screen),
            &mut data,
            true,
        );

        assert_eq!(data.count, 1.0);
        assert_eq!(data.children[&foreground_id].count, 1.0);
        assert_eq!(data.children[&screen_id].count, 0.0);

        // the sticky child is still satisfied, so one more screen fires again
        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Screen),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_chain_enforces_order() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let screen = event_trigger(EventTriggerType::Screen, 1.0);
        let screen_id = screen.id().to_owned();
        let trigger = compound(
            CompoundTriggerType::Chain,
            1.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&trigger);

        // out of order: the screen event is not evaluated yet
        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Screen),
            &mut data,
            true,
        );
        assert_eq!(
            data.children.get(&screen_id).map_or(0.0, |d| d.count),
            0.0
        );

        trigger.match_event(
            &AutomationEvent::event(EventTriggerType::Foreground),
            &mut data,
            true,
        );
        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Screen),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    #[test]
    fn test_chain_replays_state_to_unlocked_children() {
        let foreground = event_trigger(EventTriggerType::Foreground, 1.0);
        let session = AutomationTrigger::active_session(1);
        let trigger = compound(
            CompoundTriggerType::Chain,
            1.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(session),
            ],
        );
        let mut data = data_for(&trigger);

        // session state arrives while the chain is still locked
        let state = TriggerableState {
            app_session_id: Some("session-1".into()),
            version_updated: None,
        };
        let result = trigger
            .match_event(&AutomationEvent::StateChanged(state), &mut data, true)
            .unwrap();
        assert!(!result.triggered);

        // the foreground unlocks the session child, which immediately
        // observes the remembered state
        let result = trigger
            .match_event(
                &AutomationEvent::event(EventTriggerType::Foreground),
                &mut data,
                true,
            )
            .unwrap();
        assert!(result.triggered);
    }

    // ==================== Stable ids ====================

    #[test]
    fn test_missing_ids_resolved_deterministically() {
        let doc = json!({"type": "app_init", "goal": 2.0});

        let mut first: AutomationTrigger = serde_json::from_value(doc.clone()).unwrap();
        let mut second: AutomationTrigger = serde_json::from_value(doc).unwrap();
        first.resolve_ids(TriggerExecutionType::Execution);
        second.resolve_ids(TriggerExecutionType::Execution);

        assert!(!first.id().is_empty());
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_stable_id_varies_by_execution_type() {
        let doc = json!({"type": "app_init", "goal": 2.0});

        let mut execution: AutomationTrigger = serde_json::from_value(doc.clone()).unwrap();
        let mut cancellation: AutomationTrigger = serde_json::from_value(doc).unwrap();
        execution.resolve_ids(TriggerExecutionType::Execution);
        cancellation.resolve_ids(TriggerExecutionType::DelayCancellation);

        assert_ne!(execution.id(), cancellation.id());
    }

    #[test]
    fn test_explicit_id_preserved() {
        let doc = json!({"id": "my-trigger", "type": "app_init", "goal": 1.0});
        let mut trigger: AutomationTrigger = serde_json::from_value(doc).unwrap();
        trigger.resolve_ids(TriggerExecutionType::Execution);
        assert_eq!(trigger.id(), "my-trigger");
    }

    #[test]
    fn test_stable_id_varies_by_predicate() {
        let plain = json!({"type": "custom_event_count", "goal": 1.0});
        let filtered = json!({
            "type": "custom_event_count",
            "goal": 1.0,
            "predicate": {"key_equals": {"key": "name", "value": "purchase"}}
        });

        let mut plain: AutomationTrigger = serde_json::from_value(plain).unwrap();
        let mut filtered: AutomationTrigger = serde_json::from_value(filtered).unwrap();
        plain.resolve_ids(TriggerExecutionType::Execution);
        filtered.resolve_ids(TriggerExecutionType::Execution);

        assert_ne!(plain.id(), filtered.id());
    }

    // ==================== Documents ====================

    #[test]
    fn test_parse_compound_document() {
        let doc = json!({
            "id": "compound",
            "type": "or",
            "goal": 1.0,
            "children": [
                {"trigger": {"id": "fg", "type": "foreground", "goal": 2.0}},
                {"trigger": {"id": "bg", "type": "background", "goal": 1.0}, "is_sticky": true}
            ]
        });

        let trigger: AutomationTrigger = serde_json::from_value(doc).unwrap();
        let AutomationTrigger::Compound(compound) = &trigger else {
            panic!("expected compound trigger");
        };
        assert_eq!(compound.compound_type, CompoundTriggerType::Or);
        assert_eq!(compound.children.len(), 2);
        assert_eq!(compound.children[1].is_sticky, Some(true));

        let round_trip: AutomationTrigger =
            serde_json::from_value(serde_json::to_value(&trigger).unwrap()).unwrap();
        assert_eq!(round_trip, trigger);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let doc = json!({"type": "telepathy", "goal": 1.0});
        assert!(serde_json::from_value::<AutomationTrigger>(doc).is_err());
    }

    // ==================== Stale child data ====================

    #[test]
    fn test_remove_stale_child_data() {
        let foreground = event_trigger(EventTriggerType::Foreground, 2.0);
        let screen = event_trigger(EventTriggerType::Screen, 2.0);
        let foreground_id = foreground.id().to_owned();
        let screen_id = screen.id().to_owned();

        let original = compound(
            CompoundTriggerType::And,
            1.0,
            vec![
                CompoundTriggerChild::new(foreground.clone()),
                CompoundTriggerChild::new(screen),
            ],
        );
        let mut data = data_for(&original);
        original.match_event(
            &AutomationEvent::event(EventTriggerType::Foreground),
            &mut data,
            true,
        );
        original.match_event(
            &AutomationEvent::event(EventTriggerType::Screen),
            &mut data,
            true,
        );
        assert_eq!(data.children.len(), 2);

        // the screen child was edited out; foreground progress survives
        let background = event_trigger(EventTriggerType::Background, 1.0);
        let edited = compound(
            CompoundTriggerType::And,
            1.0,
            vec![
                CompoundTriggerChild::new(foreground),
                CompoundTriggerChild::new(background.clone()),
            ],
        );
        edited.remove_stale_child_data(&mut data);

        assert_eq!(data.children.len(), 2);
        assert_eq!(data.children[&foreground_id].count, 1.0);
        assert!(!data.children.contains_key(&screen_id));
        assert_eq!(data.children[background.id()].count, 0.0);
    }

    #[test]
    fn test_invalid_goal_detection() {
        let good = event_trigger(EventTriggerType::Foreground, 1.0);
        assert!(good.invalid_goal().is_none());

        let bad = AutomationTrigger::Event(EventAutomationTrigger::new(
            EventTriggerType::Foreground,
            0.0,
            None,
        ));
        let bad_id = bad.id().to_owned();
        let nested = compound(
            CompoundTriggerType::Or,
            1.0,
            vec![CompoundTriggerChild::new(bad)],
        );
        let (id, goal) = nested.invalid_goal().unwrap();
        assert_eq!(id, bad_id);
        assert_eq!(goal, 0.0);
    }
}
