//! Connection and dispatch errors.

use murmur_protocol::{ProtocolError, ServerFrame};
use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single dispatched frame.
///
/// None of these close the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Sender may not address the recipient or group.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Frame could not be decoded and was dropped.
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// Persistence failed for this operation.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl DispatchError {
    /// Rejection frame to send back to the originating connection.
    #[must_use]
    pub fn rejection(&self) -> Option<ServerFrame> {
        match self {
            DispatchError::Unauthorized(reason) => Some(ServerFrame::error(403, reason.clone())),
            DispatchError::Storage(_) => Some(ServerFrame::error(500, "Internal error")),
            DispatchError::Malformed(_) => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Unauthorized(_) => "unauthorized",
            DispatchError::Malformed(_) => "malformed",
            DispatchError::Storage(_) => "storage",
        }
    }
}

/// Failure to register a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The core is shutting down and takes no new sessions.
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StoreError),
}
