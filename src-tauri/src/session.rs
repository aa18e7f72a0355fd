//! Session Controller
//!
//! Owns the screen state machine, the credential lifecycle and the poll task.
//! The desktop shell only reads snapshots and calls the operations below.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn, debug};

use crate::auth::Credentials;
use crate::client::{ClientError, GlucoseClient, GlucoseData};
use crate::config::AppConfig;
use crate::messages::{self, Locale, Message};
use crate::model::{GlucoseBand, HistoryPoint, Reading, Screen};
use crate::storage::CredentialStore;
use crate::window::WindowController;

/// Tunables taken from the app configuration
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub poll_interval: Duration,
    pub locale: Locale,
    pub default_protocol_version: String,
}

impl From<&AppConfig> for SessionOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            locale: config.locale,
            default_protocol_version: config.default_protocol_version.clone(),
        }
    }
}

/// Classified result of one fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ok(Reading, Vec<HistoryPoint>),
    AuthError(String),
    TransientError(String),
}

impl FetchOutcome {
    /// Map a client result to user-facing text. Raw transport errors only reach the log.
    pub fn classify(result: Result<GlucoseData, ClientError>, locale: Locale) -> Self {
        match result {
            Ok(GlucoseData { current: Some(reading), history }) => FetchOutcome::Ok(reading, history),
            Ok(GlucoseData { current: None, .. }) => {
                warn!("Glucose response has no current reading");
                FetchOutcome::TransientError(messages::text(locale, Message::ConnectionFailed).into())
            }
            Err(ClientError::Authentication(raw)) => {
                info!("Credentials rejected: {}", raw);
                FetchOutcome::AuthError(messages::text(locale, Message::InvalidCredentials).into())
            }
            Err(ClientError::Transport(raw)) => {
                warn!("Glucose fetch failed: {}", raw);
                FetchOutcome::TransientError(messages::text(locale, Message::ConnectionFailed).into())
            }
        }
    }
}

/// What the presentation layer renders from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub screen: Screen,
    pub reading: Option<Reading>,
    pub band: Option<GlucoseBand>,
    pub arrow: Option<String>,
    pub history: Vec<HistoryPoint>,
    pub error: Option<String>,
    pub loading: bool,
    pub username: Option<String>,
    pub protocol_version: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("cannot navigate from {from} to {to}")]
    Rejected { from: Screen, to: Screen },
}

#[derive(Debug)]
struct SessionState {
    screen: Screen,
    credentials: Option<Credentials>,
    last_reading: Option<Reading>,
    last_history: Vec<HistoryPoint>,
    last_error: Option<String>,
    loading: bool,
    protocol_version: String,
    // Bumped by every login/logout; results from an older generation are dropped
    generation: u64,
}

impl SessionState {
    fn new(default_protocol_version: &str) -> Self {
        Self {
            screen: Screen::Login,
            credentials: None,
            last_reading: None,
            last_history: Vec::new(),
            last_error: None,
            loading: true,
            protocol_version: default_protocol_version.to_string(),
            generation: 0,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            screen: self.screen,
            reading: self.last_reading,
            band: self.last_reading.map(|r| r.band()),
            arrow: self.last_reading.map(|r| r.trend.arrow().to_string()),
            history: self.last_history.clone(),
            error: self.last_error.clone(),
            loading: self.loading,
            username: self.credentials.as_ref().map(|c| c.username.clone()),
            protocol_version: self.protocol_version.clone(),
        }
    }
}

struct Inner<C, S, W> {
    client: C,
    store: S,
    window: W,
    options: SessionOptions,
    state: Mutex<SessionState>,
    poll: Mutex<Option<JoinHandle<()>>>,
    updates: watch::Sender<SessionSnapshot>,
}

/// Single authority for screen transitions, credentials and polling
pub struct SessionController<C, S, W> {
    inner: Arc<Inner<C, S, W>>,
}

impl<C, S, W> Clone for SessionController<C, S, W> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C, S, W> SessionController<C, S, W>
where
    C: GlucoseClient,
    S: CredentialStore + 'static,
    W: WindowController,
{
    pub fn new(client: C, store: S, window: W, options: SessionOptions) -> Self {
        let state = SessionState::new(&options.default_protocol_version);
        let (updates, _) = watch::channel(state.snapshot());

        Self {
            inner: Arc::new(Inner {
                client,
                store,
                window,
                options,
                state: Mutex::new(state),
                poll: Mutex::new(None),
                updates,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state().snapshot()
    }

    /// Receives a fresh snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    /// Restore a saved login at startup
    pub async fn bootstrap(&self) {
        self.set_loading(true);
        self.transition(Screen::Login);

        let saved = match self.inner.store.load() {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Failed to read saved credentials: {}", e);
                None
            }
        };

        match saved {
            None => debug!("No saved credentials"),
            Some(credentials) => {
                info!("Restoring session for user: {}", credentials.username);
                let generation = {
                    let mut state = self.state();
                    state.generation += 1;
                    state.protocol_version = credentials.protocol_version.clone();
                    state.credentials = Some(credentials.clone());
                    state.generation
                };

                let result = self.inner.client.read(&credentials).await;
                let outcome = FetchOutcome::classify(result, self.inner.options.locale);
                if self.settle(generation, outcome, &credentials, Entry::Restore).is_none() {
                    debug!("Startup fetch superseded");
                }
            }
        }

        self.set_loading(false);
    }

    /// Fetch with the given credentials and record the outcome.
    ///
    /// Returns false on failure or when a login/logout superseded this call.
    pub async fn fetch_and_evaluate(&self, credentials: &Credentials) -> bool {
        let generation = self.state().generation;
        self.fetch_in_generation(credentials, generation)
            .await
            .unwrap_or(false)
    }

    pub async fn login(&self, username: &str, password: &str, protocol_version: &str) -> bool {
        let credentials = Credentials::new(username.trim(), password, protocol_version.trim());
        info!("Logging in user: {}", credentials.username);

        self.stop_polling();
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.loading = true;
            state.generation
        };
        self.publish();

        let outcome = if credentials.is_complete() {
            let result = self.inner.client.read(&credentials).await;
            FetchOutcome::classify(result, self.inner.options.locale)
        } else {
            let message = messages::text(self.inner.options.locale, Message::InvalidCredentials);
            FetchOutcome::AuthError(message.into())
        };

        let Some(success) = self.settle(generation, outcome, &credentials, Entry::Login) else {
            debug!("Login superseded before completion");
            return false;
        };

        self.set_loading(false);
        success
    }

    pub fn logout(&self) {
        info!("Logging out");

        {
            let mut state = self.state();
            state.generation += 1;

            // Ordered against the save in `settle` by the state lock
            if let Err(e) = self.inner.store.clear() {
                warn!("Failed to clear saved credentials: {}", e);
            }

            state.credentials = None;
            state.last_reading = None;
            state.last_history.clear();
            state.last_error = None;
            state.loading = false;
            state.protocol_version = self.inner.options.default_protocol_version.clone();
            state.screen = Screen::Login;
        }

        self.stop_polling();
        self.sync_window();
        self.publish();
    }

    /// Move between Main and History. Login is only reached through logout.
    pub fn navigate(&self, target: Screen) -> Result<(), NavigationError> {
        {
            let state = self.state();
            let allowed = state.last_reading.is_some()
                && matches!(state.screen, Screen::Main | Screen::History)
                && matches!(target, Screen::Main | Screen::History);
            if !allowed {
                debug!("Rejected navigation {} -> {}", state.screen, target);
                return Err(NavigationError::Rejected { from: state.screen, to: target });
            }
        }

        self.transition(target);
        Ok(())
    }

    /// Stop background work, for window teardown
    pub fn shutdown(&self) {
        self.stop_polling();
    }

    pub fn is_polling(&self) -> bool {
        self.poll_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn fetch_in_generation(&self, credentials: &Credentials, generation: u64) -> Option<bool> {
        let result = self.inner.client.read(credentials).await;
        let outcome = FetchOutcome::classify(result, self.inner.options.locale);
        self.apply(generation, outcome)
    }

    /// Record an outcome unless the session moved on. `None` means it was dropped.
    fn apply(&self, generation: u64, outcome: FetchOutcome) -> Option<bool> {
        let success = {
            let mut state = self.state();
            if state.generation != generation {
                return None;
            }
            record(&mut state, outcome)
        };

        self.publish();
        Some(success)
    }

    /// Finish a login or restore. Outcome, saved record, credentials and screen
    /// change under one lock, or not at all if the generation moved on.
    fn settle(
        &self,
        generation: u64,
        outcome: FetchOutcome,
        credentials: &Credentials,
        entry: Entry,
    ) -> Option<bool> {
        let success = {
            let mut state = self.state();
            if state.generation != generation {
                return None;
            }

            let success = record(&mut state, outcome);
            if success {
                if entry == Entry::Login {
                    if let Err(e) = self.inner.store.save(credentials) {
                        warn!("Failed to persist credentials: {}", e);
                    }
                }
                state.protocol_version = credentials.protocol_version.clone();
                state.credentials = Some(credentials.clone());
                state.screen = Screen::Main;
            } else {
                // A failed login leaves nothing of an earlier session behind
                state.last_reading = None;
                state.last_history.clear();
                if entry == Entry::Login {
                    state.credentials = None;
                }
                state.screen = Screen::Login;
            }
            success
        };

        self.sync_window();
        self.publish();
        if success {
            self.start_polling(generation);
        }
        Some(success)
    }

    /// One poll cycle. Returns whether polling should continue.
    async fn poll_tick(&self, generation: u64) -> bool {
        let credentials = {
            let state = self.state();
            if state.generation != generation || state.last_reading.is_none() {
                return false;
            }
            match state.credentials.clone() {
                Some(credentials) => credentials,
                None => return false,
            }
        };

        let result = self.inner.client.read(&credentials).await;
        let outcome = FetchOutcome::classify(result, self.inner.options.locale);
        let auth_failed = matches!(outcome, FetchOutcome::AuthError(_));

        match self.apply(generation, outcome) {
            None => false,
            Some(_) if auth_failed => {
                info!("Stopping poll after authentication failure");
                false
            }
            Some(_) => true,
        }
    }

    fn start_polling(&self, generation: u64) {
        let period = self.inner.options.poll_interval;
        let weak = Arc::downgrade(&self.inner);

        let mut slot = self.poll_slot();
        if self.state().generation != generation {
            debug!("Not polling for a superseded session");
            return;
        }

        let handle = tokio::spawn(poll_loop(weak, generation, period));

        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        debug!("Polling every {:?}", period);
    }

    fn stop_polling(&self) {
        if let Some(handle) = self.poll_slot().take() {
            handle.abort();
            debug!("Polling stopped");
        }
    }

    fn transition(&self, screen: Screen) {
        self.state().screen = screen;
        self.inner.window.resize_to(screen);
        self.publish();
        debug!("Screen: {}", screen);
    }

    /// Resize to whatever screen is current, which may differ from the one just set
    fn sync_window(&self) {
        let screen = self.state().screen;
        self.inner.window.resize_to(screen);
        debug!("Screen: {}", screen);
    }

    fn set_loading(&self, loading: bool) {
        self.state().loading = loading;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.inner.updates.send_replace(snapshot);
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poll_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.poll.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Login,
    Restore,
}

fn record(state: &mut SessionState, outcome: FetchOutcome) -> bool {
    match outcome {
        FetchOutcome::Ok(reading, history) => {
            state.last_reading = Some(reading);
            state.last_history = history;
            state.last_error = None;
            true
        }
        FetchOutcome::AuthError(message) | FetchOutcome::TransientError(message) => {
            state.last_error = Some(message);
            false
        }
    }
}

/// Ticks sequentially, so the next fetch is only scheduled once the previous one settled
async fn poll_loop<C, S, W>(inner: Weak<Inner<C, S, W>>, generation: u64, period: Duration)
where
    C: GlucoseClient,
    S: CredentialStore + 'static,
    W: WindowController,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let controller = SessionController { inner };
        if !controller.poll_tick(generation).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::{TimeZone, Utc};
    use tokio::sync::Notify;

    use crate::model::Trend;
    use crate::storage::StorageError;

    #[derive(Clone, Default)]
    struct ScriptedClient {
        responses: Arc<Mutex<VecDeque<Result<GlucoseData, ClientError>>>>,
        calls: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedClient {
        fn with(responses: Vec<Result<GlucoseData, ClientError>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                ..Self::default()
            }
        }

        fn push(&self, response: Result<GlucoseData, ClientError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GlucoseClient for ScriptedClient {
        async fn read(&self, _credentials: &Credentials) -> Result<GlucoseData, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(ClientError::Transport("script exhausted".into())))
        }
    }

    type SaveHook = Box<dyn FnOnce() + Send>;

    #[derive(Clone, Default)]
    struct MemoryStore {
        record: Arc<Mutex<Option<Credentials>>>,
        broken: bool,
        on_save: Arc<Mutex<Option<SaveHook>>>,
    }

    impl MemoryStore {
        fn holding(credentials: Credentials) -> Self {
            Self {
                record: Arc::new(Mutex::new(Some(credentials))),
                ..Self::default()
            }
        }

        /// Runs once, right after the next successful save
        fn after_next_save(&self, hook: impl FnOnce() + Send + 'static) {
            *self.on_save.lock().unwrap() = Some(Box::new(hook));
        }

        fn broken() -> Self {
            Self { broken: true, ..Self::default() }
        }

        fn get(&self) -> Option<Credentials> {
            self.record.lock().unwrap().clone()
        }
    }

    impl CredentialStore for MemoryStore {
        fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
            if self.broken {
                return Err(StorageError::Io("disk full".into()));
            }
            *self.record.lock().unwrap() = Some(credentials.clone());
            let hook = self.on_save.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(())
        }

        fn load(&self) -> Result<Option<Credentials>, StorageError> {
            if self.broken {
                return Err(StorageError::Decryption("bad blob".into()));
            }
            Ok(self.get())
        }

        fn clear(&self) -> Result<(), StorageError> {
            *self.record.lock().unwrap() = None;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingWindow {
        resizes: Arc<Mutex<Vec<Screen>>>,
    }

    impl RecordingWindow {
        fn resizes(&self) -> Vec<Screen> {
            self.resizes.lock().unwrap().clone()
        }
    }

    impl WindowController for RecordingWindow {
        fn resize_to(&self, screen: Screen) {
            self.resizes.lock().unwrap().push(screen);
        }
    }

    type TestController = SessionController<ScriptedClient, MemoryStore, RecordingWindow>;

    fn options() -> SessionOptions {
        SessionOptions {
            poll_interval: Duration::from_secs(90),
            locale: Locale::En,
            default_protocol_version: "4.12.0".into(),
        }
    }

    fn controller(client: &ScriptedClient, store: &MemoryStore, window: &RecordingWindow) -> TestController {
        SessionController::new(client.clone(), store.clone(), window.clone(), options())
    }

    fn reading(value: f64) -> GlucoseData {
        GlucoseData {
            current: Some(Reading { value, trend: Trend::Flat }),
            history: Vec::new(),
        }
    }

    fn with_history(value: f64, history: &[f64]) -> GlucoseData {
        let history = history
            .iter()
            .enumerate()
            .map(|(i, v)| HistoryPoint {
                date: Utc.timestamp_opt(1_700_000_000 + i as i64 * 900, 0).unwrap(),
                value: *v,
            })
            .collect();
        GlucoseData { history, ..reading(value) }
    }

    fn invalid() -> Option<String> {
        Some(messages::text(Locale::En, Message::InvalidCredentials).to_string())
    }

    fn connection_failed() -> Option<String> {
        Some(messages::text(Locale::En, Message::ConnectionFailed).to_string())
    }

    async fn logged_in(client: &ScriptedClient, store: &MemoryStore, window: &RecordingWindow) -> TestController {
        client.push(Ok(reading(120.0)));
        let controller = controller(client, store, window);
        assert!(controller.login("a", "b", "5.3.0").await);
        controller
    }

    #[tokio::test]
    async fn login_success_shows_main_and_persists_credentials() {
        let (client, store, window) = (ScriptedClient::with(vec![Ok(reading(120.0))]), MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(controller.login("a", "b", "5.3.0").await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Main);
        assert_eq!(snapshot.reading.map(|r| r.value), Some(120.0));
        assert_eq!(snapshot.arrow.as_deref(), Some("➡"));
        assert_eq!(snapshot.error, None);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.protocol_version, "5.3.0");
        assert_eq!(store.get(), Some(Credentials::new("a", "b", "5.3.0")));
        assert_eq!(window.resizes(), vec![Screen::Main]);
        assert!(controller.is_polling());
    }

    #[tokio::test]
    async fn rejected_credentials_stay_on_login_and_are_not_saved() {
        let client = ScriptedClient::with(vec![Err(ClientError::Authentication("Bad credentials".into()))]);
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(!controller.login("a", "wrong", "5.3.0").await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.error, invalid());
        assert!(!snapshot.loading);
        assert_eq!(store.get(), None);
        assert_eq!(window.resizes(), vec![Screen::Login]);
        assert!(!controller.is_polling());
    }

    #[tokio::test]
    async fn response_without_current_is_a_connection_failure() {
        let client = ScriptedClient::with(vec![Ok(GlucoseData::default())]);
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(!controller.login("a", "b", "5.3.0").await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.error, connection_failed());
        assert_eq!(store.get(), None);
    }

    #[tokio::test]
    async fn transport_error_text_is_not_shown() {
        let client = ScriptedClient::with(vec![Err(ClientError::Transport("dns error: api.libreview.io".into()))]);
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        controller.login("a", "b", "5.3.0").await;

        let error = controller.snapshot().error.unwrap();
        assert!(!error.contains("dns"));
        assert_eq!(Some(error), connection_failed());
    }

    #[tokio::test]
    async fn blank_fields_fail_without_calling_the_service() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(!controller.login("  ", "b", "5.3.0").await);

        assert_eq!(client.calls(), 0);
        assert_eq!(controller.snapshot().error, invalid());
    }

    #[tokio::test]
    async fn save_failure_does_not_block_login() {
        let client = ScriptedClient::with(vec![Ok(reading(95.0))]);
        let (store, window) = (MemoryStore::broken(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(controller.login("a", "b", "5.3.0").await);
        assert_eq!(controller.snapshot().screen, Screen::Main);
    }

    #[tokio::test]
    async fn failed_poll_keeps_last_reading_and_screen() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;
        controller.navigate(Screen::History).unwrap();
        let generation = controller.state().generation;

        client.push(Err(ClientError::Transport("timeout".into())));
        assert!(controller.poll_tick(generation).await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.reading.map(|r| r.value), Some(120.0));
        assert_eq!(snapshot.screen, Screen::History);
        assert_eq!(snapshot.error, connection_failed());
    }

    #[tokio::test]
    async fn successful_poll_replaces_history_and_clears_error() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;
        let generation = controller.state().generation;

        client.push(Err(ClientError::Transport("timeout".into())));
        client.push(Ok(with_history(140.0, &[130.0, 135.0])));
        controller.poll_tick(generation).await;
        assert!(controller.poll_tick(generation).await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.reading.map(|r| r.value), Some(140.0));
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn rejected_credentials_during_poll_stop_polling() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;
        let generation = controller.state().generation;

        client.push(Err(ClientError::Authentication("Bad credentials".into())));
        assert!(!controller.poll_tick(generation).await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Main);
        assert_eq!(snapshot.reading.map(|r| r.value), Some(120.0));
        assert_eq!(snapshot.error, invalid());
    }

    #[tokio::test]
    async fn fetch_and_evaluate_records_reading_without_moving_screen() {
        let client = ScriptedClient::with(vec![Ok(with_history(77.0, &[70.0, 74.0]))]);
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert!(controller.fetch_and_evaluate(&Credentials::new("a", "b", "5.3.0")).await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading.map(|r| r.value), Some(77.0));
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(store.get(), None);
    }

    #[tokio::test]
    async fn history_needs_a_reading() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        assert_eq!(
            controller.navigate(Screen::History),
            Err(NavigationError::Rejected { from: Screen::Login, to: Screen::History })
        );
        assert_eq!(controller.snapshot().screen, Screen::Login);
        assert!(window.resizes().is_empty());
    }

    #[tokio::test]
    async fn navigation_between_main_and_history() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;

        controller.navigate(Screen::History).unwrap();
        controller.navigate(Screen::Main).unwrap();
        assert!(controller.navigate(Screen::Login).is_err());

        assert_eq!(controller.snapshot().screen, Screen::Main);
        assert_eq!(window.resizes(), vec![Screen::Main, Screen::History, Screen::Main]);
    }

    #[tokio::test]
    async fn logout_clears_session_and_saved_record() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        client.push(Ok(with_history(120.0, &[110.0])));
        let controller = controller(&client, &store, &window);
        controller.login("a", "b", "5.3.0").await;

        controller.logout();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading, None);
        assert!(snapshot.history.is_empty());
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.username, None);
        assert_eq!(snapshot.protocol_version, "4.12.0");
        assert_eq!(store.get(), None);
        assert!(!controller.is_polling());
        assert!(controller.navigate(Screen::History).is_err());
    }

    #[tokio::test]
    async fn bootstrap_without_saved_credentials_shows_login() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);
        assert!(controller.snapshot().loading);

        controller.bootstrap().await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert!(!snapshot.loading);
        assert_eq!(client.calls(), 0);
        assert_eq!(window.resizes(), vec![Screen::Login]);
    }

    #[tokio::test]
    async fn bootstrap_restores_saved_session() {
        let client = ScriptedClient::with(vec![Ok(reading(88.0))]);
        let store = MemoryStore::holding(Credentials::new("a", "b", "5.3.0"));
        let window = RecordingWindow::default();
        let controller = controller(&client, &store, &window);

        controller.bootstrap().await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Main);
        assert_eq!(snapshot.username.as_deref(), Some("a"));
        assert_eq!(snapshot.protocol_version, "5.3.0");
        assert!(!snapshot.loading);
        assert_eq!(window.resizes(), vec![Screen::Login, Screen::Main]);
        assert!(controller.is_polling());
    }

    #[tokio::test]
    async fn bootstrap_with_failing_fetch_surfaces_error_on_login() {
        let client = ScriptedClient::with(vec![Err(ClientError::Transport("offline".into()))]);
        let store = MemoryStore::holding(Credentials::new("a", "b", "5.3.0"));
        let window = RecordingWindow::default();
        let controller = controller(&client, &store, &window);

        controller.bootstrap().await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.error, connection_failed());
        assert!(!snapshot.loading);
        assert!(!controller.is_polling());
    }

    #[tokio::test]
    async fn unreadable_store_counts_as_no_credentials() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::broken(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        controller.bootstrap().await;

        assert_eq!(controller.snapshot().screen, Screen::Login);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn login_result_arriving_after_logout_is_ignored() {
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient {
            gate: Some(gate.clone()),
            ..ScriptedClient::with(vec![Ok(reading(150.0))])
        };
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.login("a", "b", "5.3.0").await })
        };
        while client.calls() == 0 {
            tokio::task::yield_now().await;
        }

        controller.logout();
        gate.notify_one();

        assert!(!pending.await.unwrap());
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading, None);
        assert_eq!(store.get(), None);
        assert!(!controller.is_polling());
    }

    #[tokio::test]
    async fn logout_during_login_commit_leaves_nothing_behind() {
        let client = ScriptedClient::with(vec![Ok(reading(150.0))]);
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        let logout_thread = Arc::new(Mutex::new(None));
        {
            let controller = controller.clone();
            let logout_thread = logout_thread.clone();
            store.after_next_save(move || {
                let handle = std::thread::spawn(move || controller.logout());
                *logout_thread.lock().unwrap() = Some(handle);
            });
        }

        controller.login("a", "b", "5.3.0").await;
        let handle = logout_thread.lock().unwrap().take().unwrap();
        handle.join().unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading, None);
        assert_eq!(snapshot.username, None);
        assert_eq!(store.get(), None);
        assert!(!controller.is_polling());
    }

    #[tokio::test]
    async fn poll_result_arriving_after_logout_is_ignored() {
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient {
            gate: Some(gate.clone()),
            ..ScriptedClient::with(vec![Ok(reading(120.0)), Ok(reading(200.0))])
        };
        let (store, window) = (MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);

        gate.notify_one();
        assert!(controller.login("a", "b", "5.3.0").await);
        let generation = controller.state().generation;

        let tick = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.poll_tick(generation).await })
        };
        while client.calls() < 2 {
            tokio::task::yield_now().await;
        }

        controller.logout();
        gate.notify_one();

        assert!(!tick.await.unwrap());
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading, None);
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn failed_login_from_main_drops_previous_session() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;
        controller.navigate(Screen::History).unwrap();

        client.push(Err(ClientError::Authentication("Bad credentials".into())));
        assert!(!controller.login("b", "wrong", "5.3.0").await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.screen, Screen::Login);
        assert_eq!(snapshot.reading, None);
        assert!(snapshot.history.is_empty());
        assert_eq!(snapshot.username, None);
        assert_eq!(snapshot.error, invalid());
        assert!(controller.navigate(Screen::History).is_err());
        assert!(controller.navigate(Screen::Main).is_err());
        assert!(!controller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timer_refetches_every_interval() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = logged_in(&client, &store, &window).await;
        client.push(Ok(reading(130.0)));
        client.push(Err(ClientError::Transport("timeout".into())));

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(client.calls(), 2);
        assert_eq!(controller.snapshot().reading.map(|r| r.value), Some(130.0));

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(client.calls(), 3);
        assert_eq!(controller.snapshot().error, connection_failed());
        assert!(controller.is_polling());

        controller.logout();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_latest_snapshot() {
        let (client, store, window) = (ScriptedClient::default(), MemoryStore::default(), RecordingWindow::default());
        let controller = controller(&client, &store, &window);
        let mut updates = controller.subscribe();

        client.push(Ok(reading(101.0)));
        controller.login("a", "b", "5.3.0").await;

        assert!(updates.has_changed().unwrap());
        let latest = updates.borrow_and_update().clone();
        assert_eq!(latest.screen, Screen::Main);
        assert_eq!(latest.reading.map(|r| r.value), Some(101.0));
    }
}
