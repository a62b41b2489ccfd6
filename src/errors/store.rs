use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The node could not be reached or dropped the connection.
    #[error("connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },

    /// The node answered but is no longer the writable primary.
    #[error("node {addr} is not the primary: {reason}")]
    NotPrimary { addr: String, reason: String },

    /// No primary could be located through the monitoring layer.
    #[error("primary lookup failed: {0}")]
    Lookup(String),

    #[error("store unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },

    #[error("store command failed: {0}")]
    Command(String),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Errors that mean the cached primary must be dropped and re-resolved.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            StoreError::Connection { .. } | StoreError::NotPrimary { .. } | StoreError::Lookup(_)
        )
    }

    /// Classifies a Redis error raised while talking to the node at `addr`.
    pub fn from_redis(err: redis::RedisError, addr: &str) -> Self {
        let addr = addr.to_string();
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            return StoreError::Connection { addr, reason: err.to_string() };
        }
        if matches!(err.kind(), redis::ErrorKind::ReadOnly | redis::ErrorKind::MasterDown)
            || matches!(err.code(), Some("READONLY") | Some("MASTERDOWN"))
        {
            return StoreError::NotPrimary { addr, reason: err.to_string() };
        }
        StoreError::Command(err.to_string())
    }
}
