//! Schedule lifecycle orchestration.
//!
//! [`AutomationEngine`] owns the full path from a trigger firing to an
//! executed schedule: it consumes the processor's result stream, drives
//! each firing through delay waits and preparation, and hands prepared
//! schedules to a single execution dispatcher. State transitions persist
//! through the store before they take effect anywhere else, so a restart
//! resumes exactly where the last run stopped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use autoflow_core::{
    AutomationEvent, AutomationSchedule, AutomationScheduleData, AutomationScheduleState,
    ScheduleType, TriggerExecutionType, TriggerResult,
};
use autoflow_store::{AutomationStore, ScheduleMutation, ScheduleStore, StoreError};

use crate::collaborators::{
    AutomationExecutor, AutomationPreparer, InterruptedBehavior, PreparedSchedule,
    ScheduleExecuteResult, SchedulePrepareResult, ScheduleReadyResult,
};
use crate::delay::{
    guarded, AppContext, AutomationDelayProcessor, DelayResult,
    ScheduleConditionsChangedNotifier, TaskSleeper, WaitHandle,
};
use crate::trigger_processor::AutomationTriggerProcessor;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How one firing moved past the prepare step.
enum PrepareFlow {
    Proceed(AutomationScheduleData, PreparedSchedule),
    Restart,
    Done,
}

/// How one firing moved past the prepared waits.
enum PreparedFlow {
    Queued,
    Restart,
    Done,
}

struct PendingExecution {
    data: AutomationScheduleData,
    prepared: PreparedSchedule,
    seq: u64,
}

/// Lowest priority first; insertion order breaks ties.
fn pop_next(pending: &mut Vec<PendingExecution>) -> Option<PendingExecution> {
    let index = pending
        .iter()
        .enumerate()
        .min_by_key(|(_, entry)| (entry.prepared.info.priority, entry.seq))
        .map(|(index, _)| index)?;
    Some(pending.remove(index))
}

fn trigger_date(data: &AutomationScheduleData) -> DateTime<Utc> {
    data.trigger_info
        .as_ref()
        .map(|info| info.date)
        .unwrap_or(data.schedule_state_change_date)
}

/// Drives schedules from trigger firings through execution.
pub struct AutomationEngine {
    store: Arc<dyn AutomationStore>,
    preparer: Arc<dyn AutomationPreparer>,
    executor: Arc<dyn AutomationExecutor>,
    processor: Arc<AutomationTriggerProcessor>,
    delays: AutomationDelayProcessor,
    sleeper: Arc<dyn TaskSleeper>,
    notifier: Arc<ScheduleConditionsChangedNotifier>,

    started: AtomicBool,
    paused: watch::Sender<bool>,
    execution_paused: watch::Sender<bool>,
    restored: watch::Sender<bool>,

    /// One live handle per schedule with an in-flight firing.
    wait_handles: DashMap<String, Arc<WaitHandle>>,
    pending: Mutex<Vec<PendingExecution>>,
    pending_notify: Notify,
    next_seq: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationEngine {
    pub fn new<S>(
        store: Arc<S>,
        preparer: Arc<dyn AutomationPreparer>,
        executor: Arc<dyn AutomationExecutor>,
        notifier: Arc<ScheduleConditionsChangedNotifier>,
        app_context: watch::Receiver<AppContext>,
        sleeper: Arc<dyn TaskSleeper>,
    ) -> Self
    where
        S: AutomationStore + 'static,
    {
        let processor = Arc::new(AutomationTriggerProcessor::new(store.clone()));
        Self {
            store,
            preparer,
            executor,
            processor,
            delays: AutomationDelayProcessor::new(app_context, sleeper.clone()),
            sleeper,
            notifier,
            started: AtomicBool::new(false),
            paused: watch::channel(false).0,
            execution_paused: watch::channel(false).0,
            restored: watch::channel(false).0,
            wait_handles: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            pending_notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ==================== Lifecycle ====================

    /// Restores persisted schedules and begins consuming `events`.
    pub async fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<AutomationEvent>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Automation engine already started");
            return;
        }
        info!("Automation engine starting");

        // subscribe before restore so nothing it emits is missed
        let results = self.processor.subscribe();

        let engine = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(err) = engine.restore().await {
                error!(error = %err, "Restore failed");
            }
            engine.restored.send_replace(true);
        }))
        .await;

        let engine = self.clone();
        self.track(tokio::spawn(async move { engine.run_result_loop(results).await }))
            .await;

        let engine = self.clone();
        self.track(tokio::spawn(async move { engine.run_feed_loop(events).await }))
            .await;

        let engine = self.clone();
        self.track(tokio::spawn(async move { engine.run_dispatch_loop().await }))
            .await;

        let engine = self.clone();
        self.track(tokio::spawn(async move { engine.run_unpause_watcher().await }))
            .await;
    }

    /// Stops all processing. Persisted state is untouched; a later
    /// [`start`] resumes from it.
    ///
    /// [`start`]: AutomationEngine::start
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Automation engine stopping");
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.restored.send_replace(false);
        self.pending.lock().await.clear();
        self.wait_handles.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Pauses lifecycle advancement. Trigger results buffer instead of
    /// being dropped; counters keep advancing.
    pub fn set_engine_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    /// Withholds the final execution step while set. Triggers still fire
    /// and schedules still prepare.
    pub fn set_execution_paused(&self, paused: bool) {
        self.execution_paused.send_replace(paused);
    }

    // ==================== Catalog operations ====================

    /// Adds or replaces schedules. A definition that fails validation is
    /// skipped with a diagnostic; the rest land atomically. Edited
    /// schedules keep their runtime state and trigger progress.
    pub async fn upsert_schedules(&self, schedules: Vec<AutomationSchedule>) -> EngineResult<()> {
        self.wait_for_restore().await;
        let now = Utc::now();

        let mut valid = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            if let Err(err) = schedule.validate() {
                warn!(schedule_id = %schedule.identifier, error = %err, "Skipping invalid schedule");
                continue;
            }
            valid.push(schedule);
        }
        if valid.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = valid.iter().map(|s| s.identifier.clone()).collect();
        let updated = self
            .store
            .upsert_schedules(
                valid,
                Box::new(move |existing, schedule| {
                    let mut data = AutomationScheduleData::update_or_create(existing, schedule, now);
                    data.update_state(now);
                    data
                }),
            )
            .await?;

        self.processor.update_schedules(&updated).await?;

        // edits restart any in-flight pre-prepare wait
        for id in &ids {
            self.supersede_wait(id);
        }
        debug!(count = updated.len(), "Upserted schedules");
        Ok(())
    }

    /// Ends the given schedules now and removes them.
    pub async fn stop_schedules(&self, ids: &[String]) -> EngineResult<()> {
        self.wait_for_restore().await;
        let now = Utc::now();
        for id in ids {
            let updated = self
                .transition(
                    id,
                    Box::new(move |data| {
                        data.schedule.end_date = Some(now);
                        data.schedule.last_updated = Some(now);
                        data.finished(now);
                    }),
                )
                .await?;
            if let Some(updated) = updated {
                if updated.should_delete(now) {
                    self.remove_schedules(&[id.clone()]).await?;
                } else {
                    self.cancel_wait(id);
                }
            }
        }
        Ok(())
    }

    /// Removes schedules and their trigger progress outright. In-flight
    /// firings are cancelled.
    pub async fn cancel_schedules(&self, ids: &[String]) -> EngineResult<()> {
        self.wait_for_restore().await;
        debug!(?ids, "Cancelling schedules");
        self.remove_schedules(ids).await
    }

    /// Removes every schedule in the group.
    pub async fn cancel_schedules_with_group(&self, group: &str) -> EngineResult<()> {
        self.wait_for_restore().await;
        let ids: Vec<String> = self
            .store
            .schedules_with_group(group)
            .await?
            .into_iter()
            .map(|data| data.schedule.identifier)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        debug!(group, ?ids, "Cancelling schedule group");
        self.remove_schedules(&ids).await
    }

    /// Removes every schedule carrying the given payload type.
    pub async fn cancel_schedules_with_type(
        &self,
        schedule_type: ScheduleType,
    ) -> EngineResult<()> {
        self.wait_for_restore().await;
        let ids: Vec<String> = self
            .store
            .schedules()
            .await?
            .into_iter()
            .filter(|data| data.schedule.data.schedule_type() == schedule_type)
            .map(|data| data.schedule.identifier)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        debug!(?schedule_type, ?ids, "Cancelling schedules by type");
        self.remove_schedules(&ids).await
    }

    /// Looks up one schedule; expired schedules are treated as absent.
    pub async fn get_schedule(&self, id: &str) -> EngineResult<Option<AutomationSchedule>> {
        let Some(data) = self.store.schedule(id).await? else {
            return Ok(None);
        };
        if data.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(data.schedule))
    }

    pub async fn get_schedules(&self) -> EngineResult<Vec<AutomationSchedule>> {
        let now = Utc::now();
        Ok(self
            .store
            .schedules()
            .await?
            .into_iter()
            .filter(|data| !data.should_delete(now))
            .map(|data| data.schedule)
            .collect())
    }

    // ==================== Restore ====================

    /// Rebuilds runtime state from the store: re-arms triggers, resumes or
    /// unwinds schedules that were mid-flight, and clears out finished
    /// schedules past their grace window.
    async fn restore(self: &Arc<Self>) -> EngineResult<()> {
        let now = Utc::now();
        let mut schedules = self.store.schedules().await?;
        schedules.sort_by_key(|data| (data.schedule.priority.unwrap_or(0), data.schedule.created));
        self.processor.restore_schedules(&schedules).await?;

        for data in &schedules {
            match data.schedule_state {
                AutomationScheduleState::Executing => {
                    self.restore_interrupted_execution(data).await?;
                }
                AutomationScheduleState::Prepared | AutomationScheduleState::Triggered => {
                    self.restore_interrupted_prepare(data).await?;
                }
                AutomationScheduleState::Paused => {
                    self.arm_interval(data).await;
                }
                _ => {}
            }
        }

        let finished: Vec<String> = schedules
            .iter()
            .filter(|data| data.should_delete(now))
            .map(|data| data.schedule.identifier.clone())
            .collect();
        if !finished.is_empty() {
            debug!(count = finished.len(), "Deleting finished schedules");
            self.remove_schedules(&finished).await?;
        }

        debug!(count = schedules.len(), "Restored schedules");
        Ok(())
    }

    async fn restore_interrupted_execution(
        self: &Arc<Self>,
        data: &AutomationScheduleData,
    ) -> EngineResult<()> {
        let Some(info) = &data.prepared_schedule_info else {
            return self.restore_interrupted_prepare(data).await;
        };
        let behavior = self.executor.interrupted(&data.schedule, info).await;
        let retry = behavior == InterruptedBehavior::Retry;
        let now = Utc::now();
        let updated = self
            .transition(
                &data.schedule.identifier,
                Box::new(move |data| data.execution_interrupted(now, retry)),
            )
            .await?;
        if let Some(updated) = updated {
            match updated.schedule_state {
                AutomationScheduleState::Paused => self.arm_interval(&updated).await,
                AutomationScheduleState::Triggered => {
                    self.spawn_process_triggered(updated.schedule.identifier.clone())
                        .await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn restore_interrupted_prepare(
        self: &Arc<Self>,
        data: &AutomationScheduleData,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let updated = self
            .transition(
                &data.schedule.identifier,
                Box::new(move |data| data.prepare_interrupted(now)),
            )
            .await?;
        if let Some(updated) = updated {
            if updated.schedule_state == AutomationScheduleState::Triggered {
                self.spawn_process_triggered(updated.schedule.identifier.clone())
                    .await;
            }
        }
        Ok(())
    }

    /// Resumes an interval pause, sleeping out whatever remains of it.
    async fn arm_interval(self: &Arc<Self>, data: &AutomationScheduleData) {
        let interval = std::time::Duration::from_secs(data.schedule.interval.unwrap_or(0));
        let elapsed = (Utc::now() - data.schedule_state_change_date)
            .to_std()
            .unwrap_or_default();
        let remaining = interval.checked_sub(elapsed).unwrap_or_default();
        let schedule_id = data.schedule.identifier.clone();

        let engine = self.clone();
        self.track(tokio::spawn(async move {
            engine.sleeper.sleep(remaining).await;
            let now = Utc::now();
            let resumed = engine
                .transition(
                    &schedule_id,
                    Box::new(move |data| {
                        if data.schedule_state == AutomationScheduleState::Paused {
                            data.idle(now);
                            data.update_state(now);
                        }
                    }),
                )
                .await;
            if let Err(err) = resumed {
                error!(schedule_id = %schedule_id, error = %err, "Failed to resume paused schedule");
            }
        }))
        .await;
    }

    // ==================== Event and result loops ====================

    async fn run_feed_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<AutomationEvent>,
    ) {
        self.wait_for_restore().await;
        while let Some(event) = events.recv().await {
            self.processor.process_event(&event).await;
        }
    }

    async fn run_result_loop(self: Arc<Self>, mut results: broadcast::Receiver<TriggerResult>) {
        self.wait_for_restore().await;
        let mut paused = self.paused.subscribe();
        loop {
            // engine pause parks consumption; the channel buffers firings
            while *paused.borrow_and_update() {
                if paused.changed().await.is_err() {
                    return;
                }
            }
            match results.recv().await {
                Ok(result) => self.handle_trigger_result(result).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Trigger result stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Wakes parked executions whenever both pause flags clear.
    async fn run_unpause_watcher(self: Arc<Self>) {
        let mut paused = self.paused.subscribe();
        let mut execution_paused = self.execution_paused.subscribe();
        loop {
            let changed = tokio::select! {
                changed = paused.changed() => changed,
                changed = execution_paused.changed() => changed,
            };
            if changed.is_err() {
                return;
            }
            if !*paused.borrow() && !*execution_paused.borrow() {
                self.notifier.notify();
            }
        }
    }

    async fn handle_trigger_result(self: &Arc<Self>, result: TriggerResult) {
        let schedule_id = result.schedule_id;
        match result.trigger_execution_type {
            TriggerExecutionType::Execution => {
                let info = result.trigger_info;
                let fired_at = info.date;
                let now = Utc::now();
                let outcome = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| {
                            if data.schedule_state == AutomationScheduleState::Idle {
                                data.triggered(info, now);
                            }
                        }),
                    )
                    .await;
                match outcome {
                    Ok(Some(updated))
                        if updated.schedule_state == AutomationScheduleState::Triggered
                            && updated.trigger_info.as_ref().map(|info| info.date)
                                == Some(fired_at) =>
                    {
                        debug!(schedule_id = %schedule_id, "Schedule triggered");
                        self.spawn_process_triggered(schedule_id).await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(schedule_id = %schedule_id, "Dropped firing for unknown schedule");
                    }
                    Err(err) => {
                        error!(schedule_id = %schedule_id, error = %err, "Failed to apply firing");
                    }
                }
            }
            TriggerExecutionType::DelayCancellation => {
                let now = Utc::now();
                let outcome = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| {
                            if data.is_in_state(&[
                                AutomationScheduleState::Triggered,
                                AutomationScheduleState::Prepared,
                            ]) {
                                data.execution_cancelled(now);
                            }
                        }),
                    )
                    .await;
                if let Ok(Some(updated)) = outcome {
                    if !updated.is_in_state(&[
                        AutomationScheduleState::Triggered,
                        AutomationScheduleState::Prepared,
                    ]) {
                        debug!(schedule_id = %schedule_id, "Firing cancelled by delay cancellation");
                        self.cancel_wait(&schedule_id);
                        self.preparer.cancelled(&updated.schedule).await;
                    }
                }
            }
        }
    }

    // ==================== Triggered pipeline ====================

    async fn spawn_process_triggered(self: &Arc<Self>, schedule_id: String) {
        let engine = self.clone();
        self.track(tokio::spawn(async move {
            engine.process_triggered(schedule_id).await;
        }))
        .await;
    }

    /// Drives one firing from triggered through preparation into the
    /// execution queue. Loops back to the top whenever the schedule is
    /// edited or invalidated under it.
    async fn process_triggered(self: Arc<Self>, schedule_id: String) {
        loop {
            let data = match self.store.schedule(&schedule_id).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    self.clear_wait(&schedule_id);
                    return;
                }
                Err(err) => {
                    error!(schedule_id = %schedule_id, error = %err, "Schedule lookup failed");
                    self.clear_wait(&schedule_id);
                    return;
                }
            };
            if data.schedule_state != AutomationScheduleState::Triggered {
                self.clear_wait(&schedule_id);
                return;
            }

            let handle = Arc::new(WaitHandle::default());
            self.wait_handles
                .insert(schedule_id.clone(), handle.clone());

            // the seconds floor runs before preparation
            if let Some(delay) = data.schedule.delay.clone() {
                let wait = self.delays.preprocess(&delay, trigger_date(&data), Utc::now());
                match guarded(wait, &handle).await {
                    DelayResult::Completed => {}
                    DelayResult::Superseded => continue,
                    DelayResult::Cancelled => {
                        self.clear_wait(&schedule_id);
                        return;
                    }
                }
            }

            // the schedule may have changed or been cancelled during the wait
            let current = match self.store.schedule(&schedule_id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    self.clear_wait(&schedule_id);
                    return;
                }
                Err(err) => {
                    error!(schedule_id = %schedule_id, error = %err, "Schedule lookup failed");
                    self.clear_wait(&schedule_id);
                    return;
                }
            };
            if current.schedule_state != AutomationScheduleState::Triggered {
                self.clear_wait(&schedule_id);
                return;
            }
            if current.schedule != data.schedule {
                continue;
            }

            let now = Utc::now();
            if !current.is_active(now) {
                let _ = self
                    .transition(&schedule_id, Box::new(move |data| data.update_state(now)))
                    .await;
                self.clear_wait(&schedule_id);
                return;
            }

            let (prepared_data, prepared) = match self.prepare_schedule(&current).await {
                PrepareFlow::Proceed(data, prepared) => (data, prepared),
                PrepareFlow::Restart => continue,
                PrepareFlow::Done => {
                    self.clear_wait(&schedule_id);
                    return;
                }
            };

            match self.process_prepared(prepared_data, prepared, handle).await {
                PreparedFlow::Queued => return,
                PreparedFlow::Restart => continue,
                PreparedFlow::Done => {
                    self.clear_wait(&schedule_id);
                    return;
                }
            }
        }
    }

    async fn prepare_schedule(&self, data: &AutomationScheduleData) -> PrepareFlow {
        let schedule_id = data.schedule.identifier.clone();
        debug!(schedule_id = %schedule_id, "Preparing schedule");

        let context = data
            .trigger_info
            .as_ref()
            .and_then(|info| info.context.as_ref());
        let result = self
            .preparer
            .prepare(&data.schedule, context, &data.trigger_session_id)
            .await;

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                // transient failure: the firing is dropped, not retried
                warn!(schedule_id = %schedule_id, error = %err, "Prepare failed");
                let now = Utc::now();
                let _ = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| {
                            if data.schedule_state == AutomationScheduleState::Triggered {
                                data.idle(now);
                            }
                        }),
                    )
                    .await;
                return PrepareFlow::Done;
            }
        };

        match result {
            SchedulePrepareResult::Prepared(prepared) => {
                let info = prepared.info.clone();
                let now = Utc::now();
                let updated = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| {
                            // a cancellation that landed while preparing wins
                            if data.schedule_state == AutomationScheduleState::Triggered {
                                data.prepared(info, now);
                            }
                        }),
                    )
                    .await;
                match updated {
                    Ok(Some(updated))
                        if updated.schedule_state == AutomationScheduleState::Prepared =>
                    {
                        PrepareFlow::Proceed(updated, prepared)
                    }
                    Ok(_) => {
                        self.preparer.cancelled(&data.schedule).await;
                        PrepareFlow::Done
                    }
                    Err(err) => {
                        error!(schedule_id = %schedule_id, error = %err, "Failed to store prepared state");
                        PrepareFlow::Done
                    }
                }
            }
            SchedulePrepareResult::Cancel => {
                self.cancel_firing(data, Utc::now()).await;
                PrepareFlow::Done
            }
            SchedulePrepareResult::Skip => {
                let now = Utc::now();
                let _ = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| data.prepare_cancelled(now, false)),
                    )
                    .await;
                PrepareFlow::Done
            }
            SchedulePrepareResult::Penalize => {
                let now = Utc::now();
                let _ = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| data.prepare_cancelled(now, true)),
                    )
                    .await;
                PrepareFlow::Done
            }
            SchedulePrepareResult::Invalidate => PrepareFlow::Restart,
        }
    }

    /// A cancel verdict deletes the schedule unless an edit grace period
    /// holds it in a terminal parking state.
    async fn cancel_firing(&self, data: &AutomationScheduleData, now: DateTime<Utc>) {
        let schedule_id = &data.schedule.identifier;
        if data.schedule.edit_grace_period_days.unwrap_or(0) > 0 {
            let _ = self
                .transition(
                    schedule_id,
                    Box::new(move |data| data.prepare_cancelled_with_grace(now)),
                )
                .await;
        } else if let Err(err) = self.remove_schedules(&[schedule_id.clone()]).await {
            error!(schedule_id = %schedule_id, error = %err, "Failed to remove cancelled schedule");
        }
    }

    /// Waits out the delay's app conditions, re-validates, and queues the
    /// execution.
    async fn process_prepared(
        self: &Arc<Self>,
        data: AutomationScheduleData,
        prepared: PreparedSchedule,
        handle: Arc<WaitHandle>,
    ) -> PreparedFlow {
        if let Some(delay) = data.schedule.delay.clone() {
            tokio::select! {
                _ = self.delays.wait_conditions(&delay) => {}
                _ = handle.wait_cancelled() => return PreparedFlow::Done,
            }
        }

        let now = Utc::now();
        let valid = match self.check_still_valid(&data, now).await {
            Ok(valid) => valid,
            Err(err) => {
                error!(schedule_id = %data.schedule.identifier, error = %err, "Validity check failed");
                return PreparedFlow::Done;
            }
        };
        if !valid {
            return self.invalidate(&data).await;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.push(PendingExecution {
            data,
            prepared,
            seq,
        });
        self.pending_notify.notify_one();
        PreparedFlow::Queued
    }

    async fn check_still_valid(
        &self,
        data: &AutomationScheduleData,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let Some(current) = self.store.schedule(&data.schedule.identifier).await? else {
            return Ok(false);
        };
        Ok(current.schedule_state == AutomationScheduleState::Prepared
            && current.schedule == data.schedule
            && current.is_active(now)
            && self.executor.is_valid(&current.schedule).await)
    }

    /// Unwinds a prepared firing whose content or window lapsed. Back to
    /// triggered for another attempt when possible, otherwise out.
    async fn invalidate(&self, data: &AutomationScheduleData) -> PreparedFlow {
        let schedule_id = &data.schedule.identifier;
        let now = Utc::now();
        let updated = self
            .transition(
                schedule_id,
                Box::new(move |data| {
                    if data.schedule_state == AutomationScheduleState::Prepared {
                        data.execution_invalidated(now);
                    }
                }),
            )
            .await;
        match updated {
            Ok(Some(updated))
                if updated.schedule_state == AutomationScheduleState::Triggered =>
            {
                debug!(schedule_id = %schedule_id, "Prepared schedule invalidated, retriggering");
                PreparedFlow::Restart
            }
            _ => {
                self.preparer.cancelled(&data.schedule).await;
                PreparedFlow::Done
            }
        }
    }

    // ==================== Execution ====================

    async fn run_dispatch_loop(self: Arc<Self>) {
        self.wait_for_restore().await;
        loop {
            let next = {
                let mut pending = self.pending.lock().await;
                pop_next(&mut pending)
            };
            match next {
                Some(entry) => self.attempt_execution(entry).await,
                None => self.pending_notify.notified().await,
            }
        }
    }

    async fn attempt_execution(self: &Arc<Self>, entry: PendingExecution) {
        let schedule_id = entry.data.schedule.identifier.clone();

        let current = match self.store.schedule(&schedule_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                self.clear_wait(&schedule_id);
                return;
            }
            Err(err) => {
                error!(schedule_id = %schedule_id, error = %err, "Schedule lookup failed");
                return;
            }
        };
        if current.schedule_state != AutomationScheduleState::Prepared {
            // cancelled or restarted while queued
            self.clear_wait(&schedule_id);
            return;
        }

        // conditions may have lapsed while queued; wait them out again
        if let Some(delay) = &current.schedule.delay {
            if !self.delays.conditions_met_now(delay) {
                let engine = self.clone();
                let handle = self.wait_handle(&schedule_id);
                self.track(tokio::spawn(async move {
                    engine
                        .run_prepared_pipeline(entry.data, entry.prepared, handle)
                        .await;
                }))
                .await;
                return;
            }
        }

        match self.check_ready(&current, &entry.prepared) {
            ScheduleReadyResult::Ready => self.execute(entry, current).await,
            ScheduleReadyResult::NotReady => {
                debug!(schedule_id = %schedule_id, "Schedule not ready, parking");
                let engine = self.clone();
                self.track(tokio::spawn(async move {
                    engine.notifier.wait().await;
                    engine.requeue(entry).await;
                }))
                .await;
            }
            ScheduleReadyResult::Invalidate => match self.invalidate(&entry.data).await {
                PreparedFlow::Restart => self.spawn_process_triggered(schedule_id).await,
                _ => self.clear_wait(&schedule_id),
            },
            ScheduleReadyResult::Skip => {
                let now = Utc::now();
                let _ = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| data.execution_skipped(now)),
                    )
                    .await;
                self.preparer.cancelled(&current.schedule).await;
                self.clear_wait(&schedule_id);
            }
        }
    }

    fn check_ready(
        &self,
        data: &AutomationScheduleData,
        prepared: &PreparedSchedule,
    ) -> ScheduleReadyResult {
        if *self.paused.borrow() || *self.execution_paused.borrow() {
            return ScheduleReadyResult::NotReady;
        }
        if !data.is_active(Utc::now()) {
            return ScheduleReadyResult::Invalidate;
        }
        self.executor.is_ready(prepared)
    }

    async fn run_prepared_pipeline(
        self: Arc<Self>,
        data: AutomationScheduleData,
        prepared: PreparedSchedule,
        handle: Arc<WaitHandle>,
    ) {
        let schedule_id = data.schedule.identifier.clone();
        match self.process_prepared(data, prepared, handle).await {
            PreparedFlow::Queued => {}
            PreparedFlow::Restart => self.process_triggered(schedule_id).await,
            PreparedFlow::Done => self.clear_wait(&schedule_id),
        }
    }

    async fn execute(self: &Arc<Self>, entry: PendingExecution, current: AutomationScheduleData) {
        let schedule_id = current.schedule.identifier.clone();
        let now = Utc::now();
        let updated = self
            .transition(
                &schedule_id,
                Box::new(move |data| {
                    if data.schedule_state == AutomationScheduleState::Prepared {
                        data.executing(now);
                    }
                }),
            )
            .await;
        match updated {
            Ok(Some(updated))
                if updated.schedule_state == AutomationScheduleState::Executing => {}
            Ok(_) => {
                // lost a race to a cancellation
                self.clear_wait(&schedule_id);
                return;
            }
            Err(err) => {
                error!(schedule_id = %schedule_id, error = %err, "Failed to mark executing");
                return;
            }
        }

        info!(schedule_id = %schedule_id, "Executing schedule");
        let mut result = self.executor.execute(&entry.prepared).await;
        while matches!(result, Ok(ScheduleExecuteResult::Retry)) {
            debug!(schedule_id = %schedule_id, "Execution deferred, waiting for conditions");
            self.notifier.wait().await;
            result = self.executor.execute(&entry.prepared).await;
        }

        match result {
            Ok(ScheduleExecuteResult::Finished) => {
                let now = Utc::now();
                let outcome = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| data.finished_executing(now)),
                    )
                    .await;
                self.clear_wait(&schedule_id);
                if let Ok(Some(updated)) = outcome {
                    if updated.schedule_state == AutomationScheduleState::Paused {
                        self.arm_interval(&updated).await;
                    }
                }
            }
            Ok(ScheduleExecuteResult::Cancel) => {
                if let Err(err) = self.remove_schedules(&[schedule_id.clone()]).await {
                    error!(schedule_id = %schedule_id, error = %err, "Failed to remove schedule");
                }
            }
            Err(err) => {
                // transient failure: back to idle without burning the firing
                warn!(schedule_id = %schedule_id, error = %err, "Execute failed");
                let now = Utc::now();
                let _ = self
                    .transition(
                        &schedule_id,
                        Box::new(move |data| data.execution_skipped(now)),
                    )
                    .await;
                self.clear_wait(&schedule_id);
            }
            Ok(ScheduleExecuteResult::Retry) => {}
        }
    }

    async fn requeue(&self, entry: PendingExecution) {
        self.pending.lock().await.push(entry);
        self.pending_notify.notify_one();
    }

    // ==================== Shared plumbing ====================

    /// Applies a state mutation and propagates the resulting state to the
    /// trigger processor so activations stay in step.
    async fn transition(
        &self,
        schedule_id: &str,
        mutation: ScheduleMutation,
    ) -> EngineResult<Option<AutomationScheduleData>> {
        let updated = self.store.update_schedule(schedule_id, mutation).await?;
        if let Some(data) = &updated {
            self.processor
                .update_schedule_state(schedule_id, data.schedule_state)
                .await;
        }
        Ok(updated)
    }

    async fn remove_schedules(&self, ids: &[String]) -> EngineResult<()> {
        self.store.delete_schedules(ids).await?;
        self.processor.cancel(ids).await?;
        for id in ids {
            self.cancel_wait(id);
            self.wait_handles.remove(id);
        }
        Ok(())
    }

    fn wait_handle(&self, schedule_id: &str) -> Arc<WaitHandle> {
        self.wait_handles
            .entry(schedule_id.to_owned())
            .or_default()
            .clone()
    }

    fn cancel_wait(&self, schedule_id: &str) {
        if let Some(handle) = self.wait_handles.get(schedule_id) {
            handle.cancel();
        }
    }

    fn supersede_wait(&self, schedule_id: &str) {
        if let Some(handle) = self.wait_handles.get(schedule_id) {
            handle.supersede();
        }
    }

    fn clear_wait(&self, schedule_id: &str) {
        self.wait_handles.remove(schedule_id);
    }

    /// Catalog and lifecycle operations line up behind restore when the
    /// engine is running; on a stopped engine they act on the store
    /// directly.
    async fn wait_for_restore(&self) {
        if !self.is_started() {
            return;
        }
        let mut restored = self.restored.subscribe();
        loop {
            if *restored.borrow_and_update() {
                return;
            }
            if restored.changed().await.is_err() {
                return;
            }
        }
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}
