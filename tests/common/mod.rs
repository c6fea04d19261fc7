#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use push_receiver::events::ChannelSink;
use push_receiver::protocol::{Identity, PushEvent};
use push_receiver::registrar::{Registrar, RegistrarError, RegistrationRequest};
use push_receiver::socket::{
    CloseReason, SessionDriver, SocketConnector, SocketError, SocketParams, SocketSession,
};
use push_receiver::store::{Acg, Credential, CredentialStore, MemoryStore};
use push_receiver::supervisor::{Collaborators, Supervisor, SupervisorSettings};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Registrar that hands out a fixed credential and records every request.
pub struct FakeRegistrar {
    pub credential: Credential,
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<RegistrationRequest>>,
}

impl FakeRegistrar {
    pub fn new(token: &str, id: u128, security_token: u128) -> Self {
        Self {
            credential: Credential {
                token: token.to_string(),
                acg: Acg { id, security_token },
            },
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn register(&self, request: RegistrationRequest) -> Result<Credential, RegistrarError> {
        self.requests.lock().push(request);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RegistrarError::Other("registrar offline".into()));
        }
        Ok(self.credential.clone())
    }
}

/// Connector that hands out in-memory sessions and keeps their driver halves
/// so tests can push messages and close sessions.
#[derive(Default)]
pub struct FakeConnector {
    pub fail: AtomicBool,
    pub attempts: AtomicUsize,
    pub params: Mutex<Vec<SocketParams>>,
    pub drivers: Mutex<Vec<SessionDriver>>,
}

impl FakeConnector {
    pub fn session_count(&self) -> usize {
        self.drivers.lock().len()
    }

    pub fn close(&self, index: usize, detail: &str) {
        self.drivers.lock()[index]
            .closer
            .notify(CloseReason::Remote(detail.to_string()));
    }

    pub fn is_disconnected(&self, index: usize) -> bool {
        *self.drivers.lock()[index].shutdown_rx.borrow()
    }

    pub fn message_sender(&self, index: usize) -> mpsc::Sender<push_receiver::protocol::PushMessage> {
        self.drivers.lock()[index].messages.clone()
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, params: SocketParams) -> Result<SocketSession, SocketError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.params.lock().push(params);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SocketError::Other("connection refused".into()));
        }
        let (session, driver) = SocketSession::channel(16);
        self.drivers.lock().push(driver);
        Ok(session)
    }
}

pub struct TestService {
    pub supervisor: Supervisor,
    pub registrar: Arc<FakeRegistrar>,
    pub connector: Arc<FakeConnector>,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
}

/// A supervisor wired to fakes, with the default settings.
pub fn service_with_store(store: Arc<dyn CredentialStore>) -> TestService {
    service_with(store, SupervisorSettings::default())
}

pub fn service() -> TestService {
    service_with_store(Arc::new(MemoryStore::new()))
}

pub fn service_with(store: Arc<dyn CredentialStore>, settings: SupervisorSettings) -> TestService {
    let registrar = Arc::new(FakeRegistrar::new("T1", 123, 456));
    let connector = Arc::new(FakeConnector::default());
    let (sink, events) = ChannelSink::new();
    let supervisor = Supervisor::new(
        Collaborators {
            registrar: registrar.clone(),
            connector: connector.clone(),
            store,
            sink: Arc::new(sink),
        },
        settings,
    );
    TestService {
        supervisor,
        registrar,
        connector,
        events,
    }
}

pub fn identity() -> Identity {
    Identity::new("app1", "proj1", "key1", "vkey1")
}

/// Wait for the next event, failing the test after 5 seconds.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within 5s")
        .expect("event channel open")
}
