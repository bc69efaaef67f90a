use std::io;

/// Status codes that cross the public API boundary (`open`/`send`/`shutdown`)
/// and are carried through connection and state-change callbacks. These are
/// the conceptual error kinds of the design; mapping to the full OPC UA
/// status code table is the service layer's job, not the core's.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StatusCode {
    Good,
    BadInvalidArgument,
    BadConnectionRejected,
    BadConnectionClosed,
    BadOutOfMemory,
    BadNotFound,
    BadSecurityPolicyRejected,
    BadSequenceNumberInvalid,
    BadTokenUnknown,
    BadInternalError,
}

impl StatusCode {
    #[inline]
    pub fn is_good(self) -> bool {
        matches!(self, StatusCode::Good)
    }

    #[inline]
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Good
    }
}

impl From<io::Error> for StatusCode {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StatusCode::BadNotFound,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => StatusCode::BadInvalidArgument,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => StatusCode::BadConnectionClosed,
            io::ErrorKind::OutOfMemory => StatusCode::BadOutOfMemory,
            _ => StatusCode::BadInternalError,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for StatusCode {}
