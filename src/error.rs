use thiserror::Error;

use crate::registrar::RegistrarError;
use crate::socket::SocketError;
use crate::store::StoreError;

/// Why a start or reconnect attempt failed. The `Display` text is what the
/// foreground sees in the `service-error` event.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrarError),

    #[error("connect failed: {0}")]
    Connect(#[from] SocketError),

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("event target is gone")]
    TargetGone,

    #[error("supervisor was shut down")]
    ShutDown,

    #[error("no session to resume: {0}")]
    MissingSession(&'static str),
}
