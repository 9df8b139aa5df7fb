//! Error types for pgm-messenger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (or sent a short frame). Kept
    /// separate from [`Error::Io`] so callers can tell an orderly
    /// disconnect from a genuine transport fault.
    #[error("peer disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// Unknown or invalid username. Also produced by name sanitization,
    /// before any filesystem access.
    #[error("user not found")]
    UserNotFound,

    /// Unknown or invalid message filename. Also produced by name
    /// sanitization, before any filesystem access.
    #[error("message not found")]
    MessageNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;
