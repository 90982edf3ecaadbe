//! Delay condition waiting.
//!
//! A schedule's delay has two parts: a seconds floor measured from the
//! triggering event, and app conditions (foreground state, current screen)
//! that must hold at execution. [`AutomationDelayProcessor`] waits both
//! out against a live [`AppContext`] feed. All waits are cooperative;
//! cancelling one leaves no side effects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};

use autoflow_core::{AutomationAppState, AutomationDelay};

/// Snapshot of the app surface a delay is judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct AppContext {
    pub app_state: AutomationAppState,
    pub screen: Option<String>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self {
            app_state: AutomationAppState::Background,
            screen: None,
        }
    }
}

/// Clock seam for the waits the engine takes.
#[async_trait]
pub trait TaskSleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the runtime clock.
#[derive(Debug, Default)]
pub struct DefaultTaskSleeper;

#[async_trait]
impl TaskSleeper for DefaultTaskSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wakes schedules parked on execution readiness. Hosts call [`notify`]
/// whenever display conditions change; every parked schedule re-checks.
///
/// [`notify`]: ScheduleConditionsChangedNotifier::notify
#[derive(Debug, Default)]
pub struct ScheduleConditionsChangedNotifier {
    notify: Notify,
}

impl ScheduleConditionsChangedNotifier {
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Per-firing cancellation points for a schedule's in-flight waits.
/// Permits are stored, so a cancel that lands before the wait starts is
/// still observed.
#[derive(Debug, Default)]
pub(crate) struct WaitHandle {
    cancelled: Notify,
    superseded: Notify,
}

impl WaitHandle {
    pub fn cancel(&self) {
        self.cancelled.notify_one();
    }

    pub fn supersede(&self) {
        self.superseded.notify_one();
    }

    pub async fn wait_cancelled(&self) {
        self.cancelled.notified().await;
    }

    async fn wait_superseded(&self) {
        self.superseded.notified().await;
    }
}

/// How a guarded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DelayResult {
    Completed,
    Cancelled,
    Superseded,
}

/// Races a wait against its schedule's cancellation points.
pub(crate) async fn guarded<F>(wait: F, handle: &WaitHandle) -> DelayResult
where
    F: std::future::Future<Output = ()>,
{
    tokio::select! {
        _ = wait => DelayResult::Completed,
        _ = handle.wait_cancelled() => DelayResult::Cancelled,
        _ = handle.wait_superseded() => DelayResult::Superseded,
    }
}

/// Waits out delay conditions against the live app context.
pub struct AutomationDelayProcessor {
    context: watch::Receiver<AppContext>,
    sleeper: Arc<dyn TaskSleeper>,
}

impl AutomationDelayProcessor {
    pub fn new(context: watch::Receiver<AppContext>, sleeper: Arc<dyn TaskSleeper>) -> Self {
        Self { context, sleeper }
    }

    /// Sleeps out whatever part of the seconds floor is still outstanding,
    /// measured from the triggering date. Safe to call again later; time
    /// already served is never re-waited.
    pub async fn preprocess(
        &self,
        delay: &AutomationDelay,
        trigger_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let Some(seconds) = delay.seconds else {
            return;
        };
        let total = Duration::from_secs(seconds);
        let elapsed = (now - trigger_date).to_std().unwrap_or_default();
        let Some(remaining) = total.checked_sub(elapsed) else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        self.sleeper.sleep(remaining).await;
    }

    /// Whether `context` satisfies the delay's app conditions.
    pub fn conditions_met(delay: &AutomationDelay, context: &AppContext) -> bool {
        if let Some(required) = delay.app_state {
            if required != context.app_state {
                return false;
            }
        }
        if let Some(screens) = &delay.screens {
            match &context.screen {
                Some(screen) if screens.contains(screen) => {}
                _ => return false,
            }
        }
        true
    }

    /// Snapshot check against the current app context.
    pub fn conditions_met_now(&self, delay: &AutomationDelay) -> bool {
        Self::conditions_met(delay, &self.context.borrow())
    }

    /// Completes once the app conditions hold. Returns early if the
    /// context feed goes away.
    pub async fn wait_conditions(&self, delay: &AutomationDelay) {
        let mut context = self.context.clone();
        loop {
            {
                let snapshot = context.borrow_and_update();
                if Self::conditions_met(delay, &snapshot) {
                    return;
                }
            }
            if context.changed().await.is_err() {
                return;
            }
        }
    }

    /// Completes once the seconds floor has elapsed and the app conditions
    /// hold.
    pub async fn process(
        &self,
        delay: &AutomationDelay,
        trigger_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.preprocess(delay, trigger_date, now).await;
        self.wait_conditions(delay).await;
    }
}
