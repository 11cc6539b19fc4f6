//! Error types for bulk-mailer.

use std::fmt;
use std::io;

/// Main error type for campaign setup and execution.
#[derive(Debug)]
pub enum Error {
    /// I/O errors (dataset or attachment files)
    Io(io::Error),
    /// Dataset could not be parsed
    Dataset(String),
    /// Configuration rejected before connecting
    Config(String),
    /// The run was started without an explicit confirmation
    NotConfirmed,
    /// Opening the relay session failed
    Session(SessionError),
}

/// Failures while opening a relay session. Both variants are fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The relay rejected the credentials
    Auth(String),
    /// Network, TLS or protocol failure before authentication completed
    Connection(String),
}

/// Failure to deliver one message. Isolated to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Sender or recipient address could not be parsed
    InvalidAddress(String),
    /// The MIME message could not be assembled
    Build(String),
    /// The relay refused the message or the connection dropped mid-send
    Rejected(String),
    /// The broken connection could not be re-established
    Reconnect(SessionError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Dataset(msg) => write!(f, "dataset error: {msg}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::NotConfirmed => write!(f, "campaign has not been confirmed"),
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
            Self::Build(msg) => write!(f, "could not build message: {msg}"),
            Self::Rejected(msg) => write!(f, "relay rejected message: {msg}"),
            Self::Reconnect(e) => write!(f, "reconnect failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Session(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for SessionError {}

impl std::error::Error for DeliveryError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Self::Dataset(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io_err) => io_err,
            other => Self::other(other.to_string()),
        }
    }
}

/// Result type alias for bulk-mailer operations.
pub type Result<T> = std::result::Result<T, Error>;
