//! App lifecycle and analytics ingestion.
//!
//! Hosts report what the app is doing through [`AutomationEventFeed`]; the
//! feed turns those reports into [`AutomationEvent`]s for the trigger
//! processor and keeps the [`AppContext`] watch current for delay
//! condition checks.

use std::sync::{Mutex, PoisonError};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use autoflow_core::{AutomationAppState, AutomationEvent, EventTriggerType, TriggerableState};

use crate::delay::AppContext;

pub struct AutomationEventFeed {
    events: mpsc::UnboundedSender<AutomationEvent>,
    context: watch::Sender<AppContext>,
    state: Mutex<TriggerableState>,
}

impl AutomationEventFeed {
    /// Creates the feed plus the event stream and app context watch the
    /// engine consumes.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<AutomationEvent>,
        watch::Receiver<AppContext>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (context, context_rx) = watch::channel(AppContext::default());
        let feed = Self {
            events,
            context,
            state: Mutex::new(TriggerableState::default()),
        };
        (feed, events_rx, context_rx)
    }

    pub fn notify_app_init(&self) {
        self.emit(AutomationEvent::event(EventTriggerType::AppInit));
    }

    /// The app came to the foreground. Starts a new app session.
    pub fn notify_foregrounded(&self) {
        self.emit(AutomationEvent::event(EventTriggerType::Foreground));

        let state = {
            let mut state = self.lock_state();
            state.app_session_id = Some(Uuid::new_v4().to_string());
            state.clone()
        };
        self.emit(AutomationEvent::StateChanged(state));
        self.context
            .send_modify(|context| context.app_state = AutomationAppState::Foreground);
    }

    /// The app left the foreground. The session id is kept; the next
    /// foreground rotates it.
    pub fn notify_backgrounded(&self) {
        self.emit(AutomationEvent::event(EventTriggerType::Background));
        self.context
            .send_modify(|context| context.app_state = AutomationAppState::Background);
    }

    pub fn notify_screen_viewed(&self, screen: &str) {
        self.emit(AutomationEvent::with_data(
            EventTriggerType::Screen,
            json!(screen),
        ));
        self.context
            .send_modify(|context| context.screen = Some(screen.to_owned()));
    }

    /// The app version changed since the last run. State only; version
    /// triggers are edge-detected against it.
    pub fn notify_version_updated(&self, version: &str) {
        let state = {
            let mut state = self.lock_state();
            state.version_updated = Some(version.to_owned());
            state.clone()
        };
        self.emit(AutomationEvent::StateChanged(state));
    }

    pub fn notify_region_entered(&self, region_id: &str) {
        self.emit(AutomationEvent::with_data(
            EventTriggerType::RegionEnter,
            json!({ "region_id": region_id }),
        ));
    }

    pub fn notify_region_exited(&self, region_id: &str) {
        self.emit(AutomationEvent::with_data(
            EventTriggerType::RegionExit,
            json!({ "region_id": region_id }),
        ));
    }

    /// An analytics event. Fans out to the count trigger at weight 1.0 and
    /// the value trigger at the event's value.
    pub fn notify_custom_event(&self, data: serde_json::Value, value: f64) {
        self.emit(AutomationEvent::weighted(
            EventTriggerType::CustomEventCount,
            Some(data.clone()),
            1.0,
        ));
        self.emit(AutomationEvent::weighted(
            EventTriggerType::CustomEventValue,
            Some(data),
            value,
        ));
    }

    pub fn notify_feature_flag_interaction(&self, data: serde_json::Value) {
        self.emit(AutomationEvent::with_data(
            EventTriggerType::FeatureFlagInteraction,
            data,
        ));
    }

    fn emit(&self, event: AutomationEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TriggerableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
