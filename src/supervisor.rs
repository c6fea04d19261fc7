//! Session lifecycle and reconnection.
//!
//! The [`Supervisor`] registers the app identity (or reuses a stored
//! registration), keeps exactly one push socket alive, and reconnects after an
//! unsolicited closure. Every outcome is reported through the [`EventSink`].
//!
//! ```text
//! Idle ─► Registering ─► Connecting ─► Connected ─► Reconnecting ─► Connected
//!              │              │                          │
//!              └──────────────┴────────► Failed ◄────────┘
//! ```
//!
//! Invariants:
//! - `start` does its work at most once per supervisor.
//! - At most one socket handle is active. The Connect Procedure runs under the
//!   `active` mutex, which tears the previous handle down before installing a
//!   new one.
//! - Closure signals inside the debounce window, or while a reconnect is in
//!   flight, never start another reconnect.
//! - `reconnect_in_flight` is cleared on every exit path of a reconnect.
//! - Started/restarted events go out only after the new handle is installed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{CredentialPolicy, SupervisorConfig, SuppressedClosurePolicy};
use crate::error::PushError;
use crate::events::{emit, EventSink};
use crate::keys::KeyMaterial;
use crate::protocol::{Identity, PushEvent, PushMessage};
use crate::registrar::{Registrar, RegistrationRequest};
use crate::socket::{CloseReason, SocketConnector, SocketHandle, SocketParams};
use crate::store::{Credential, CredentialStore, PersistedCredential};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Supervisor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Registering,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Policy knobs for a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub debounce: Duration,
    pub credential_policy: CredentialPolicy,
    pub suppressed_closure: SuppressedClosurePolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            credential_policy: CredentialPolicy::default(),
            suppressed_closure: SuppressedClosurePolicy::default(),
        }
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            debounce: config.debounce(),
            credential_policy: config.credential_policy,
            suppressed_closure: config.suppressed_closure,
        }
    }
}

/// The collaborators a supervisor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub registrar: Arc<dyn Registrar>,
    pub connector: Arc<dyn SocketConnector>,
    pub store: Arc<dyn CredentialStore>,
    pub sink: Arc<dyn EventSink>,
}

struct SessionState {
    started: bool,
    phase: SupervisorState,
    keys: Option<Arc<KeyMaterial>>,
    credential: Option<Credential>,
    /// Generation of the most recently installed socket session. Closure
    /// signals carrying any other generation are stale.
    generation: u64,
    last_close: Option<Instant>,
    reconnect_in_flight: bool,
    retry_scheduled: bool,
    /// Set by `shutdown`; no socket is installed afterwards.
    shut_down: bool,
}

struct ActiveSocket {
    generation: u64,
    handle: SocketHandle,
}

struct Inner {
    collaborators: Collaborators,
    settings: SupervisorSettings,
    state: Mutex<SessionState>,
    /// Held across the whole Connect Procedure.
    active: tokio::sync::Mutex<Option<ActiveSocket>>,
}

enum ClosureDecision {
    Ignore,
    Suppress { in_flight: bool, retry_at: Option<Instant> },
    Reconnect,
}

/// Owns the push session for one process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(collaborators: Collaborators, settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                collaborators,
                settings,
                state: Mutex::new(SessionState {
                    started: false,
                    phase: SupervisorState::Idle,
                    keys: None,
                    credential: None,
                    generation: 0,
                    last_close: None,
                    reconnect_in_flight: false,
                    retry_scheduled: false,
                    shut_down: false,
                }),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.inner.settings
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state.lock().phase
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn reconnect_in_flight(&self) -> bool {
        self.inner.state.lock().reconnect_in_flight
    }

    /// Token of the live credential, if registration has completed.
    pub fn token(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .credential
            .as_ref()
            .map(|c| c.token.clone())
    }

    /// Register (or reuse a registration) and open the push socket.
    ///
    /// Only the first call does anything; later calls re-emit the last known
    /// `service-started` state. Outcomes are reported as events. Returns once
    /// the first connect attempt has resolved.
    pub async fn start(&self, identity: Identity) {
        let keys = {
            let mut state = self.inner.state.lock();
            if state.started {
                let token = state.credential.as_ref().map(|c| c.token.clone());
                drop(state);
                let token = token.or_else(|| self.inner.stored_token());
                tracing::debug!(has_token = token.is_some(), "start requested again, echoing state");
                self.inner.emit(PushEvent::ServiceStarted(token));
                return;
            }
            state.started = true;
            let keys = Arc::new(KeyMaterial::generate());
            state.keys = Some(keys.clone());
            keys
        };

        tracing::info!(app_id = %identity.app_id, "starting push service");
        match self.inner.bring_up(&identity, &keys).await {
            Ok(token) => {
                tracing::info!("push service started");
                self.inner.emit(PushEvent::ServiceStarted(Some(token)));
            }
            Err(PushError::ShutDown) => {
                tracing::debug!("shut down while starting, no socket installed");
            }
            Err(e) => {
                tracing::error!(error = %e, "error while starting the push service");
                self.inner.set_phase(SupervisorState::Failed);
                self.inner.emit(PushEvent::ServiceError(e.to_string()));
            }
        }
    }

    /// Disconnect the active socket, if any, without triggering a reconnect.
    pub async fn shutdown(&self) {
        // Flag first: a connect already holding `active` checks it before
        // installing its session.
        self.inner.state.lock().shut_down = true;
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::debug!(generation = previous.generation, "disconnecting push socket");
            previous.handle.disconnect();
        }
        let mut state = self.inner.state.lock();
        // Bumping the generation makes any in-flight closure signal stale.
        state.generation += 1;
        state.phase = SupervisorState::Idle;
    }

    #[cfg(test)]
    fn handle_closure(&self, generation: u64, reason: CloseReason) {
        self.inner.on_closed(generation, reason);
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }
}

impl Inner {
    fn emit(&self, event: PushEvent) {
        emit(self.collaborators.sink.as_ref(), event);
    }

    fn set_phase(&self, phase: SupervisorState) {
        self.state.lock().phase = phase;
    }

    fn stored_token(&self) -> Option<String> {
        match self.collaborators.store.load() {
            Ok(stored) => stored.credentials.map(|c| c.token),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read credential store");
                None
            }
        }
    }

    async fn bring_up(self: &Arc<Self>, identity: &Identity, keys: &KeyMaterial) -> Result<String, PushError> {
        self.set_phase(SupervisorState::Registering);
        let credential = self.register(identity, keys).await?;
        self.state.lock().credential = Some(credential.clone());

        self.set_phase(SupervisorState::Connecting);
        self.connect(&credential, keys).await?;
        Ok(credential.token)
    }

    /// Registration Procedure.
    async fn register(&self, identity: &Identity, keys: &KeyMaterial) -> Result<Credential, PushError> {
        if self.settings.credential_policy == CredentialPolicy::ReuseMatchingApp {
            if let Some(credential) = self.reusable_credential(&identity.app_id) {
                tracing::info!(app_id = %identity.app_id, "reusing stored credentials");
                return Ok(credential);
            }
        }

        let request = RegistrationRequest::new(identity.clone(), keys.public());
        let credential = self.collaborators.registrar.register(request).await?;

        self.collaborators
            .store
            .save(&PersistedCredential::from(&credential), &identity.app_id)?;
        tracing::info!(app_id = %identity.app_id, "registered, credentials saved");
        self.emit(PushEvent::TokenUpdated(credential.token.clone()));
        Ok(credential)
    }

    fn reusable_credential(&self, app_id: &str) -> Option<Credential> {
        let stored = match self.collaborators.store.load() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "credential store unreadable, registering again");
                return None;
            }
        };
        if stored.app_id.as_deref() != Some(app_id) {
            return None;
        }
        match Credential::try_from(stored.credentials?) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "stored credentials unusable, registering again");
                None
            }
        }
    }

    /// Connect Procedure. Returns the generation of the installed session.
    async fn connect(self: &Arc<Self>, credential: &Credential, keys: &KeyMaterial) -> Result<u64, PushError> {
        let mut active = self.active.lock().await;
        if self.state.lock().shut_down {
            return Err(PushError::ShutDown);
        }
        if let Some(previous) = active.take() {
            tracing::debug!(generation = previous.generation, "tearing down previous push socket");
            previous.handle.disconnect();
        }

        let params = SocketParams {
            acg: credential.acg,
            ece: keys.private(),
        };
        let session = self.collaborators.connector.connect(params).await?;

        let generation = {
            let mut state = self.state.lock();
            if state.shut_down {
                drop(state);
                tracing::debug!("shut down while connecting, discarding new push socket");
                session.handle.disconnect();
                return Err(PushError::ShutDown);
            }
            state.generation += 1;
            state.phase = SupervisorState::Connected;
            state.generation
        };
        *active = Some(ActiveSocket {
            generation,
            handle: session.handle,
        });
        tokio::spawn(pump(Arc::downgrade(self), generation, session.messages, session.closed));
        tracing::debug!(generation, "push socket installed");
        Ok(generation)
    }

    fn forward_message(&self, generation: u64, message: PushMessage) {
        {
            let state = self.state.lock();
            if state.generation != generation || state.phase != SupervisorState::Connected {
                tracing::debug!(generation, "dropping message from inactive session");
                return;
            }
        }
        tracing::debug!(persistent_id = ?message.persistent_id(), "push message received");
        self.emit(PushEvent::MessageReceived(message));
    }

    /// Single entry point for closure signals.
    fn on_closed(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        if reason == CloseReason::LocalDisconnect {
            tracing::debug!(generation, "push socket closed locally");
            return;
        }

        let decision = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if generation != state.generation {
                ClosureDecision::Ignore
            } else {
                let recent = state
                    .last_close
                    .map(|at| now.duration_since(at) < self.settings.debounce)
                    .unwrap_or(false);
                if recent || state.reconnect_in_flight {
                    let retry_at = match self.settings.suppressed_closure {
                        SuppressedClosurePolicy::Deferred
                            if !state.reconnect_in_flight && !state.retry_scheduled =>
                        {
                            state.retry_scheduled = true;
                            state.last_close.map(|at| at + self.settings.debounce)
                        }
                        _ => None,
                    };
                    ClosureDecision::Suppress {
                        in_flight: state.reconnect_in_flight,
                        retry_at,
                    }
                } else {
                    state.last_close = Some(now);
                    state.reconnect_in_flight = true;
                    state.phase = SupervisorState::Reconnecting;
                    ClosureDecision::Reconnect
                }
            }
        };

        match decision {
            ClosureDecision::Ignore => {
                tracing::debug!(generation, %reason, "ignoring closure of superseded session");
            }
            ClosureDecision::Suppress { in_flight, retry_at } => {
                tracing::warn!(generation, %reason, in_flight, "push socket closed, reconnect suppressed");
                let detail = if in_flight {
                    "reconnect already in progress"
                } else {
                    "last reconnect was too recent"
                };
                self.emit(PushEvent::ServiceError(format!(
                    "push socket {}; reconnect suppressed ({})",
                    reason, detail
                )));
                if let Some(at) = retry_at {
                    self.schedule_retry(generation, reason, at);
                }
            }
            ClosureDecision::Reconnect => {
                tracing::warn!(generation, %reason, "push socket closed, reconnecting");
                let inner = self.clone();
                tokio::spawn(async move { inner.reconnect().await });
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64, reason: CloseReason, at: Instant) {
        tracing::debug!(generation, "deferring reconnect until debounce window ends");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().retry_scheduled = false;
                inner.on_closed(generation, reason);
            }
        });
    }

    /// Reconnection Procedure. Runs on its own task.
    async fn reconnect(self: Arc<Self>) {
        let outcome = {
            let _in_flight = InFlightGuard { inner: &self };
            self.try_reconnect().await
        };

        match outcome {
            Ok(token) => {
                tracing::info!("push service restarted");
                self.emit(PushEvent::ServiceRestarted(token));
            }
            Err(PushError::ShutDown) => {
                tracing::debug!("reconnect abandoned, supervisor shut down");
            }
            Err(e) => {
                tracing::error!(error = %e, "error while restarting the push service");
                self.set_phase(SupervisorState::Failed);
                self.emit(PushEvent::ServiceError(e.to_string()));
            }
        }
    }

    async fn try_reconnect(self: &Arc<Self>) -> Result<String, PushError> {
        if !self.collaborators.sink.is_alive() {
            return Err(PushError::TargetGone);
        }
        let (credential, keys) = {
            let state = self.state.lock();
            if state.shut_down {
                return Err(PushError::ShutDown);
            }
            let credential = state
                .credential
                .clone()
                .ok_or(PushError::MissingSession("no credential"))?;
            let keys = state
                .keys
                .clone()
                .ok_or(PushError::MissingSession("no key material"))?;
            (credential, keys)
        };
        self.connect(&credential, &keys).await?;
        Ok(credential.token)
    }
}

/// Clears `reconnect_in_flight` however the attempt ends.
struct InFlightGuard<'a> {
    inner: &'a Inner,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().reconnect_in_flight = false;
    }
}

/// Forwards one session's messages and its closure signal.
async fn pump(
    supervisor: Weak<Inner>,
    generation: u64,
    mut messages: mpsc::Receiver<PushMessage>,
    mut closed: oneshot::Receiver<CloseReason>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            msg = messages.recv() => match msg {
                Some(message) => match supervisor.upgrade() {
                    Some(inner) => inner.forward_message(generation, message),
                    None => return,
                },
                // Transport dropped its sender; the closure signal follows.
                None => break (&mut closed).await,
            },
            reason = &mut closed => break reason,
        }
    };
    // A sender dropped without firing means the transport died outright.
    let reason = reason.unwrap_or_else(|_| CloseReason::Remote("transport dropped".into()));
    if let Some(inner) = supervisor.upgrade() {
        inner.on_closed(generation, reason);
    }
}
