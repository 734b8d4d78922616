//! Errors raised by the device actor and its control surface.

use thiserror::Error;

/// Errors a [`crate::Replicator`] control-surface call may return.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// A write was attempted while this device's role is not `Primary`.
    #[error("device is not Primary; application writes are rejected")]
    NotPrimary,

    /// `connect` was called while a link is already established.
    #[error("already connected; call disconnect first")]
    AlreadyConnected,

    /// A control-surface call that needs a link (e.g. an explicit flush)
    /// was made while none is established.
    #[error("not connected")]
    NotConnected,

    /// The post-connect `ReportParams` handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A core-level operation failed.
    #[error(transparent)]
    Core(#[from] rdbd_core::Error),

    /// A protocol-level (wire) operation failed.
    #[error(transparent)]
    Protocol(#[from] rdbd_protocol::ProtocolError),

    /// The backing device rejected an I/O.
    #[error(transparent)]
    Device(#[from] rdbd_block_device::DeviceError),
}

/// Convenience alias for replicator operations.
pub type Result<T> = core::result::Result<T, ReplicatorError>;
