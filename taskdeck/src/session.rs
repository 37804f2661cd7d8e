//! A signed-in session: the mirror, profile editor and realtime subscription of
//! one principal, acquired together and released together.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::auth::{AuthError, AuthProvider, Principal};
use crate::messages::{Table, Task};
use crate::mirror::{MirrorError, OptimisticPolicy, TaskMirror};
use crate::notifier::{ChangeNotifier, DEFAULT_NOTIFY_CAPACITY};
use crate::profile::{ProfileEditor, ProfileError};
use crate::realtime::{RealtimeListener, ReconnectPolicy};
use crate::stats::StatisticsView;
use crate::store::{RemoteStore, StoreError};

pub const RECONNECT_DELAY_ENV: &str = "TASKDECK_RECONNECT_DELAY_MS";
pub const MAX_RECONNECTS_ENV: &str = "TASKDECK_MAX_RECONNECTS";
pub const ROLLBACK_ENV: &str = "TASKDECK_ROLLBACK_ON_FAILURE";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No authenticated principal")]
    Unauthenticated,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause before each attempt to re-open a closed realtime connection.
    pub reconnect_delay: Duration,
    /// Attempts before the listener gives up. The session stays usable without it.
    pub max_reconnect_attempts: u32,
    /// Revert a failed optimistic toggle or delete.
    pub rollback_on_failure: bool,
    pub notify_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let reconnect = ReconnectPolicy::default();
        Self {
            reconnect_delay: reconnect.delay,
            max_reconnect_attempts: reconnect.max_attempts,
            rollback_on_failure: false,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `TASKDECK_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SessionError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(RECONNECT_DELAY_ENV) {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                SessionError::Config(format!("{RECONNECT_DELAY_ENV}={raw}: {e}"))
            })?;
            config.reconnect_delay = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup(MAX_RECONNECTS_ENV) {
            config.max_reconnect_attempts = raw.trim().parse().map_err(|e| {
                SessionError::Config(format!("{MAX_RECONNECTS_ENV}={raw}: {e}"))
            })?;
        }
        if let Some(raw) = lookup(ROLLBACK_ENV) {
            config.rollback_on_failure = parse_flag(&raw).ok_or_else(|| {
                SessionError::Config(format!("{ROLLBACK_ENV}={raw}: expected true or false"))
            })?;
        }
        Ok(config)
    }

    pub fn optimistic_policy(&self) -> OptimisticPolicy {
        if self.rollback_on_failure {
            OptimisticPolicy::Rollback
        } else {
            OptimisticPolicy::BestEffort
        }
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: self.reconnect_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub struct SessionBuilder {
    store: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(store: Arc<dyn RemoteStore>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            store,
            auth,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_rollback_on_failure(mut self, rollback: bool) -> Self {
        self.config.rollback_on_failure = rollback;
        self
    }

    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.config.notify_capacity = capacity;
        self
    }

    /// Subscribe to the principal's tasks, load mirror and profile, and start
    /// the realtime listener.
    ///
    /// The subscription is opened before the initial load so that no change made
    /// in between is missed. On any failure everything acquired so far is released.
    pub async fn start(self) -> Result<Session, SessionError> {
        let principal = self
            .auth
            .current_principal()
            .ok_or(SessionError::Unauthenticated)?;
        let owner = principal.id;
        log::info!("Starting session for {owner}");

        let notifier = ChangeNotifier::with_capacity(self.config.notify_capacity);
        let mirror = Arc::new(
            TaskMirror::new(Arc::clone(&self.store), notifier.clone())
                .with_policy(self.config.optimistic_policy()),
        );

        let subscription = self.store.subscribe(&owner, Table::Tasks).await?;
        mirror.load(owner).await?;
        let profile = ProfileEditor::load(Arc::clone(&self.store), &principal).await?;

        let listener = RealtimeListener::spawn(
            Arc::clone(&self.store),
            Arc::clone(&mirror),
            owner,
            subscription,
            self.config.reconnect_policy(),
        );

        Ok(Session {
            principal,
            auth: self.auth,
            notifier,
            mirror,
            profile,
            listener: Some(listener),
        })
    }
}

pub struct Session {
    principal: Principal,
    auth: Arc<dyn AuthProvider>,
    notifier: ChangeNotifier,
    mirror: Arc<TaskMirror>,
    profile: ProfileEditor,
    listener: Option<RealtimeListener>,
}

impl Session {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The task mirror, as long as the provider still reports this session's
    /// principal.
    pub fn tasks(&self) -> Result<&Arc<TaskMirror>, SessionError> {
        self.ensure_authenticated()?;
        Ok(&self.mirror)
    }

    /// Create a task owned by the session's principal.
    pub async fn add_task(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, SessionError> {
        let task = self
            .tasks()?
            .create(self.principal.id, title, description)
            .await?;
        Ok(task)
    }

    /// Re-fetch the principal's tasks.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.tasks()?.load(self.principal.id).await?;
        Ok(())
    }

    pub fn profile(&self) -> &ProfileEditor {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> Result<&mut ProfileEditor, SessionError> {
        self.ensure_authenticated()?;
        Ok(&mut self.profile)
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn statistics(&self) -> StatisticsView {
        StatisticsView::attach(&self.mirror, &self.notifier)
    }

    /// Whether realtime events are still being received.
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    /// End the session and release the realtime subscription.
    pub async fn close(mut self) {
        self.release().await;
        log::info!("Session for {} closed", self.principal.id);
    }

    /// Release the realtime subscription, then sign out with the provider.
    pub async fn sign_out(mut self) -> Result<(), SessionError> {
        self.release().await;
        self.auth.sign_out().await.map_err(|e| {
            log::error!("Sign-out of {} failed: {e}", self.principal.id);
            SessionError::Auth(e)
        })?;
        log::info!("Signed out {}", self.principal.id);
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
    }

    fn ensure_authenticated(&self) -> Result<(), SessionError> {
        match self.auth.current_principal() {
            Some(current) if current.id == self.principal.id => Ok(()),
            _ => Err(SessionError::Unauthenticated),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.signal_stop();
        }
    }
}
