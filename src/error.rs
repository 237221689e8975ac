use std::fmt;

use crate::message::MessageId;

#[derive(Debug)]
pub enum Error {
    /// Ack/requeue referenced a message id that is not currently in flight.
    UnknownMessage(MessageId),
    /// Administrative repositioning outside the backend's valid range.
    InvalidOffset(u64),
    /// Operation attempted after the channel was closed.
    Exiting,
    /// The backend log refused a read or write; delivery halts until the
    /// backend is replaced or restarted.
    BackendUnavailable(&'static str),
    InvalidMessage(&'static str),
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownMessage(id) => write!(f, "message not in flight: {id}"),
            Error::InvalidOffset(offset) => write!(f, "offset out of range: {offset}"),
            Error::Exiting => write!(f, "channel exiting"),
            Error::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Error::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
