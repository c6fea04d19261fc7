//! push-receiver
//!
//! Keeps a background process registered with a push-notification backend and
//! relays token updates and incoming push messages to a foreground process.
//!
//! The [`supervisor::Supervisor`] owns the session lifecycle. Everything it
//! talks to sits behind a narrow trait so it can be swapped or faked:
//! [`registrar::Registrar`], [`socket::SocketConnector`],
//! [`store::CredentialStore`] and [`events::EventSink`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod protocol;
pub mod registrar;
pub mod socket;
pub mod store;
pub mod supervisor;
