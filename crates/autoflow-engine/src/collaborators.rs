//! Host collaborator contracts.
//!
//! The engine drives schedule lifecycles but never renders content or talks
//! to remote services itself. Hosts plug those concerns in through
//! [`AutomationPreparer`] and [`AutomationExecutor`].

use async_trait::async_trait;
use serde_json::Value;

use autoflow_core::{AutomationSchedule, DeferredTriggerContext, PreparedScheduleInfo};

/// Opaque failure from a host collaborator. Treated as transient: the
/// schedule returns to idle and the firing is not retried.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Payload produced by preparation and consumed by execution. Deferred
/// schedules resolve into one of these during prepare.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedData {
    InAppMessage(Value),
    Actions(Value),
}

/// A schedule with its content resolved, ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedSchedule {
    pub info: PreparedScheduleInfo,
    pub data: PreparedData,
}

/// Outcome of preparing a triggered schedule.
#[derive(Debug)]
pub enum SchedulePrepareResult {
    Prepared(PreparedSchedule),
    /// Stop the schedule entirely.
    Cancel,
    /// Drop this firing without counting it against the limit.
    Skip,
    /// Drop this firing but count it against the limit.
    Penalize,
    /// Inputs changed while preparing; the firing starts over.
    Invalidate,
}

/// Readiness check run just before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleReadyResult {
    Ready,
    NotReady,
    Invalidate,
    Skip,
}

/// Outcome of executing a prepared schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleExecuteResult {
    Finished,
    Cancel,
    Retry,
}

/// What to do with an execution that was cut short by a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptedBehavior {
    Retry,
    Finish,
}

/// Resolves schedule content ahead of execution.
#[async_trait]
pub trait AutomationPreparer: Send + Sync {
    async fn prepare(
        &self,
        schedule: &AutomationSchedule,
        trigger_context: Option<&DeferredTriggerContext>,
        trigger_session_id: &str,
    ) -> Result<SchedulePrepareResult, CollaboratorError>;

    /// Called when previously prepared work will not execute.
    async fn cancelled(&self, schedule: &AutomationSchedule);
}

/// Presents prepared schedules.
#[async_trait]
pub trait AutomationExecutor: Send + Sync {
    /// Whether the prepared content is still valid to show.
    async fn is_valid(&self, schedule: &AutomationSchedule) -> bool;

    /// Whether the display surface can take the content right now.
    fn is_ready(&self, prepared: &PreparedSchedule) -> ScheduleReadyResult;

    async fn execute(
        &self,
        prepared: &PreparedSchedule,
    ) -> Result<ScheduleExecuteResult, CollaboratorError>;

    /// Called during restore for an execution that did not finish.
    async fn interrupted(
        &self,
        schedule: &AutomationSchedule,
        prepared_info: &PreparedScheduleInfo,
    ) -> InterruptedBehavior;
}
