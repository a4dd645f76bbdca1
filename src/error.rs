use std::fmt;

/// Crate-wide error type. Mirrors the storage/network error enums of the
/// surrounding codebase: a small closed set of variants, `Display`+`Error`,
/// never a catch-all string bag.
#[derive(Debug)]
pub enum PoolError {
    Decode(String),
    Crypto(String),
    Io(std::io::Error),
    Store(String),
    Rpc(String),
    Protocol(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Decode(e) => write!(f, "decode error: {}", e),
            PoolError::Crypto(e) => write!(f, "crypto error: {}", e),
            PoolError::Io(e) => write!(f, "io error: {}", e),
            PoolError::Store(e) => write!(f, "store error: {}", e),
            PoolError::Rpc(e) => write!(f, "rpc error: {}", e),
            PoolError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(e)
    }
}

impl From<sled::Error> for PoolError {
    fn from(e: sled::Error) -> Self {
        PoolError::Store(e.to_string())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
