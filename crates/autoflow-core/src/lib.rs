//! Core data model for the autoflow automation engine.
//!
//! This crate is pure data and logic: events, triggers and their matching
//! state machine, schedule documents, and the schedule lifecycle. It does no
//! IO and spawns no tasks; persistence and orchestration live in
//! `autoflow-store` and `autoflow-engine`.

mod event;
mod predicate;
mod schedule;
mod schedule_state;
mod trigger;

pub use event::{AutomationEvent, EventTriggerType, TriggerableState};
pub use predicate::EventPredicate;
pub use schedule::{
    AutomationAppState, AutomationAudience, AutomationDelay, AutomationSchedule,
    DeferredAutomationData, DeferredType, MissBehavior, ScheduleData, ScheduleError,
    ScheduleResult, ScheduleType,
};
pub use schedule_state::{AutomationScheduleData, AutomationScheduleState, PreparedScheduleInfo};
pub use trigger::{
    AutomationTrigger, CompoundAutomationTrigger, CompoundTriggerChild, CompoundTriggerType,
    DeferredTriggerContext, EventAutomationTrigger, MatchResult, TriggerData,
    TriggerExecutionType, TriggerResult, TriggeringInfo,
};
