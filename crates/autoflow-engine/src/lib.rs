//! Client-side automation scheduling engine.
//!
//! The engine turns app activity into schedule executions. Hosts report
//! events through an [`AutomationEventFeed`]; the trigger processor counts
//! them against each schedule's goals, and [`AutomationEngine`] drives
//! fired schedules through delays, preparation and execution. Preparation
//! and execution are host concerns, plugged in through the
//! [`AutomationPreparer`] and [`AutomationExecutor`] traits. Everything the
//! engine decides is persisted through `autoflow-store` first, so a killed
//! process resumes mid-flight work on restart.

mod collaborators;
mod delay;
mod engine;
mod feed;
mod prepared_trigger;
mod trigger_processor;

pub use collaborators::{
    AutomationExecutor, AutomationPreparer, CollaboratorError, InterruptedBehavior, PreparedData,
    PreparedSchedule, ScheduleExecuteResult, SchedulePrepareResult, ScheduleReadyResult,
};
pub use delay::{
    AppContext, AutomationDelayProcessor, DefaultTaskSleeper, ScheduleConditionsChangedNotifier,
    TaskSleeper,
};
pub use engine::{AutomationEngine, EngineError, EngineResult};
pub use feed::AutomationEventFeed;
pub use trigger_processor::AutomationTriggerProcessor;
