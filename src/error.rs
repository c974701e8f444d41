use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// Error during parsing of ip address
    ParseIpAddr(String),

    /// An incoming packet could not be decoded. The datagram is dropped.
    Malformed(String),

    /// A compressed domain name contains a pointer loop. The datagram
    /// is dropped.
    CircularName(String),

    /// An outgoing packet is full. The encoder truncates the current
    /// message and continues into a new one.
    BufferFull,

    /// A resolver did not produce an answer before its deadline.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => write!(f, "try again"),
            Error::Msg(s) => write!(f, "{}", s),
            Error::ParseIpAddr(s) => write!(f, "parsing of ip addr failed, reason: {}", s),
            Error::Malformed(s) => write!(f, "malformed DNS message: {}", s),
            Error::CircularName(s) => write!(f, "circular domain name: {}", s),
            Error::BufferFull => write!(f, "outgoing packet buffer is full"),
            Error::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;
