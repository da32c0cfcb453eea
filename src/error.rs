/// A meshdb error. Socket failures never travel across thread boundaries as
/// errors; they collapse into message status transitions and peer
/// disconnections (see network::Delivery). Everything else propagates.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Invalid configuration, e.g. a bad CLI argument or log level.
    Config(String),
    /// An invalid wire frame or payload.
    InvalidData(String),
    /// An internal error or invariant violation. These should never happen.
    Internal(String),
    /// A network error, e.g. an unresolvable peer address.
    Network(String),
}

/// A meshdb result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Config(s) => write!(f, "config error: {s}"),
            Error::InvalidData(s) => write!(f, "invalid data: {s}"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
            Error::Network(s) => write!(f, "network error: {s}"),
        }
    }
}

/// Constructs a Config error result from a format string.
#[macro_export]
macro_rules! errconfig {
    ($($args:tt)*) => { Err($crate::error::Error::Config(format!($($args)*))) };
}

/// Constructs an InvalidData error result from a format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Config(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {err}"))
    }
}
