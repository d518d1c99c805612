use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::probe::dialer::RunId;

/// Failure of a single presence or auth probe.
///
/// Every variant is `Clone` so a failed outcome can be cached and handed to
/// every caller waiting on the same key. A negative detection is never one of
/// these; it is a normal `PresenceResult`/`AuthResult`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("missing run identity")]
    MissingRunIdentity,

    #[error("dialers not initialized for {0}")]
    RunNotInitialized(RunId),

    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: DialError,
    },

    #[error("rdp decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("run {0} was cancelled")]
    Cancelled(RunId),
}

impl ProbeError {
    /// Errors caused by the host never registering the run. Retrying without
    /// re-registration will not help.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            ProbeError::MissingRunIdentity | ProbeError::RunNotInitialized(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DialError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Connect timeout reported by the OS before our own deadline fired.
    #[error("connect timed out: {0}")]
    TimedOut(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("name resolution failed: {0}")]
    Resolve(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for DialError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused(e.to_string()),
            io::ErrorKind::TimedOut => DialError::TimedOut(e.to_string()),
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => {
                DialError::Resolve(e.to_string())
            }
            io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => DialError::Unreachable(e.to_string()),
            _ => DialError::Io(e.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("not an rdp service")]
    NotRdp,
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}
