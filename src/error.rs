use std::io;

/// Everything that can go wrong talking to a RESP3 server, from protocol
/// corruption on the wire down to a caller observing a handle too early.
#[derive(thiserror::Error, Debug)]
pub enum RedisError {
    /// The decoder found a byte where it expected a different RESP3 type
    /// prefix. Fatal to the connection that produced it.
    #[error("unexpected character `{actual}`, expected `{expected}`")]
    UnexpectedCharacter { actual: char, expected: char },

    /// A `:` line did not contain a valid base-10 integer.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// A `,` line did not contain a valid double, `inf` or `-inf`.
    #[error("invalid double: {0}")]
    InvalidDouble(String),

    /// A `(` line did not contain a valid base-10 big number.
    #[error("invalid big number: {0}")]
    InvalidBigNumber(String),

    /// A `#` line was not exactly `t` or `f`.
    #[error("invalid boolean: {0}")]
    InvalidBoolean(String),

    /// The stream ended in the middle of a value.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Underlying transport error; always fatal to the owning connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The encoder was asked to serialize an argument type it does not
    /// understand. No partial output is written.
    #[error("invalid argument type: {0}")]
    InvalidType(String),

    /// The server replied with a RESP3 error (`-` or `!`). Local to the
    /// request that produced it; the connection stays usable.
    #[error("{code} {message}")]
    Server { code: String, message: String },

    /// A `to_*` conversion could not represent the value as the requested
    /// destination type.
    #[error("cannot convert {value:?} to {to}")]
    Conversion { to: &'static str, value: String },

    /// A result handle was observed while its pipeline was never flushed.
    #[error("result observed before the owning pipeline was flushed")]
    NotFlushed,

    /// A result handle's deadline elapsed before the reply arrived.
    #[error("timed out waiting for reply")]
    Timeout,

    /// A command was submitted to a connection that is shutting down.
    #[error("connection is shutting down")]
    InShutdown,

    /// A command was submitted to, or a handle observed on, a closed
    /// connection.
    #[error("connection is closed")]
    Closed,

    /// The pool could not satisfy an acquisition within its deadline.
    #[error("pool wait timed out")]
    PoolTimeout,

    /// The pool has been closed and will no longer hand out connections.
    #[error("pool is closed")]
    PoolClosed,
}

impl RedisError {
    /// True for decode failures and I/O failures: anything that leaves the
    /// wire in an unrecoverable state for the owning connection.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            RedisError::UnexpectedCharacter { .. }
                | RedisError::InvalidNumber(_)
                | RedisError::InvalidDouble(_)
                | RedisError::InvalidBigNumber(_)
                | RedisError::InvalidBoolean(_)
                | RedisError::UnexpectedEof
                | RedisError::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RedisError::Timeout | RedisError::PoolTimeout)
    }

    /// Builds a `RedisError::Server` from a raw error line body, splitting
    /// the leading whitespace-delimited code from the remainder.
    pub fn from_error_line(line: &str) -> Self {
        match line.split_once(' ') {
            Some((code, message)) => RedisError::Server {
                code: code.to_string(),
                message: message.to_string(),
            },
            None => RedisError::Server {
                code: line.to_string(),
                message: String::new(),
            },
        }
    }
}

/// Clone is needed because a single fatal error must be delivered to every
/// outstanding handle exactly once while also
/// staying resident on the connection for late arrivals.
impl Clone for RedisError {
    fn clone(&self) -> Self {
        match self {
            RedisError::UnexpectedCharacter { actual, expected } => {
                RedisError::UnexpectedCharacter {
                    actual: *actual,
                    expected: *expected,
                }
            }
            RedisError::InvalidNumber(s) => RedisError::InvalidNumber(s.clone()),
            RedisError::InvalidDouble(s) => RedisError::InvalidDouble(s.clone()),
            RedisError::InvalidBigNumber(s) => RedisError::InvalidBigNumber(s.clone()),
            RedisError::InvalidBoolean(s) => RedisError::InvalidBoolean(s.clone()),
            RedisError::UnexpectedEof => RedisError::UnexpectedEof,
            RedisError::Io(e) => RedisError::Io(io::Error::new(e.kind(), e.to_string())),
            RedisError::InvalidType(s) => RedisError::InvalidType(s.clone()),
            RedisError::Server { code, message } => RedisError::Server {
                code: code.clone(),
                message: message.clone(),
            },
            RedisError::Conversion { to, value } => RedisError::Conversion {
                to,
                value: value.clone(),
            },
            RedisError::NotFlushed => RedisError::NotFlushed,
            RedisError::Timeout => RedisError::Timeout,
            RedisError::InShutdown => RedisError::InShutdown,
            RedisError::Closed => RedisError::Closed,
            RedisError::PoolTimeout => RedisError::PoolTimeout,
            RedisError::PoolClosed => RedisError::PoolClosed,
        }
    }
}

pub type RedisResult<T> = Result<T, RedisError>;
