#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Account-scoped store-and-forward message broker
//!
//! A TCP server mediates between authenticated users: messages are
//! addressed by username, stored as files in per-user mailbox
//! directories, and flagged unread through a filename prefix until
//! first fetch. The crate exposes the server, the on-disk stores, the
//! wire protocol, and a typed client for driving it.

mod client;
mod config;
mod credentials;
mod error;
mod mailbox;
mod registry;
mod server;
mod session;
pub mod wire;
mod workers;

pub use client::{Message, MessengerClient, parse_listing};
pub use config::{DEFAULT_PORT, PORT_ENV_VAR, ServerConfig, resolve_port};
pub use error::{Error, Result};
pub use mailbox::MailboxStore;
pub use registry::{AddOutcome, MAX_SESSIONS, SessionRegistry};
pub use server::Server;
pub use session::{MAX_PASSWORD_ATTEMPTS, Session};
pub use wire::{Command, MessageHeader, ResultCode};
