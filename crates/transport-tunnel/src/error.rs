use std::fmt::Display;
use std::io;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0} is closed")]
    Closed(&'static str),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("signaling error: {0}")]
    Signaling(String),
}

impl TunnelError {
    /// Errors that end the owning peer rather than a single channel or session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Transport(_))
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Parse(_) => io::ErrorKind::InvalidData,
            TunnelError::Closed(_) => io::ErrorKind::BrokenPipe,
            TunnelError::DeadlineExceeded => io::ErrorKind::TimedOut,
            TunnelError::NotFound(_) => io::ErrorKind::NotFound,
            TunnelError::Transport(_) | TunnelError::Signaling(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub(crate) fn to_transport_error<E: Display>(err: E) -> TunnelError {
    TunnelError::Transport(err.to_string())
}

pub(crate) fn to_signaling_error<E: Display>(err: E) -> TunnelError {
    TunnelError::Signaling(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn io_error_kinds_follow_taxonomy() {
        let deadline: io::Error = TunnelError::DeadlineExceeded.into();
        assert_eq!(deadline.kind(), io::ErrorKind::TimedOut);

        let closed: io::Error = TunnelError::Closed("channel").into();
        assert_eq!(closed.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(closed.to_string(), "channel is closed");

        assert!(TunnelError::Transport("ice failed".into()).is_fatal());
        assert!(!TunnelError::NotFound("web:3".into()).is_fatal());
    }
}
