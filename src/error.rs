//! relay-fabric/src/error.rs
//! Typed error hierarchy for the relay fabric.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricError>;

/// `Invariant` marks a state-machine bug: the owning
/// session logs it at `error!` and tears itself down, but does not take the process down.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory store error: {0}")]
    Directory(String),

    #[error("failed to dial peer proxy {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl FabricError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        FabricError::Protocol(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        FabricError::Invariant(msg.into())
    }
}
