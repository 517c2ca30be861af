//! Errors surfaced by the bridge kernel.

use nplbridge_types::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// Any failure of a bridge operation, passed through unchanged.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Configuration was rejected or a subsystem could not be built.
    #[error("Bridge failed to start: {0}")]
    BootFailed(String),
}

impl KernelError {
    /// Collapse into the failure taxonomy reported to agents.
    pub fn into_bridge(self) -> BridgeError {
        match self {
            KernelError::Bridge(e) => e,
            KernelError::BootFailed(msg) => BridgeError::Config(msg),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
