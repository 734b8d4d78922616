//! Protocol-level error taxonomy (spec §7 `ProtocolMismatch`/`BrokenPipe`/
//! `NetworkTimeout`).

use thiserror::Error;

/// Maximum payload length accepted for any single packet. A packet
/// claiming more is treated as a protocol violation rather than an
/// allocation hazard.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Errors raised while framing, sending, or receiving wire packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A packet header carried the wrong magic. Connection must be torn
    /// down (spec §7 `ProtocolMismatch`).
    #[error("bad packet magic {got:#010x} (expected {expected:#010x})")]
    BadMagic { got: u32, expected: u32 },

    /// A packet header's `length` field exceeded [`MAX_PAYLOAD_LEN`].
    #[error("packet length {got} exceeds maximum {max}")]
    LengthOutOfRange { got: u16, max: usize },

    /// An unrecognized command code.
    #[error("unknown command code {0}")]
    UnknownCommand(u16),

    /// A fixed-size command body was too short to decode.
    #[error("truncated {command} body: got {got} bytes, need {need}")]
    TruncatedBody { command: &'static str, got: usize, need: usize },

    /// The peer's `version` in `ReportParams` could not be negotiated.
    #[error("peer protocol version {peer} is not compatible with ours ({mine})")]
    VersionMismatch { mine: u16, peer: u16 },

    /// A size mismatch the user did not explicitly allow (spec §4.6).
    #[error("device size mismatch: local {local} sectors, peer {peer} sectors")]
    SizeMismatch { local: u64, peer: u64 },

    /// The send timer expired before the packet went out fully (spec §7
    /// `NetworkTimeout`).
    #[error("send timed out after {0:?}")]
    SendTimeout(std::time::Duration),

    /// The socket reported an EOF or I/O error (spec §7 `BrokenPipe`).
    #[error("connection broken: {0}")]
    BrokenPipe(#[source] std::io::Error),

    /// The operation was cancelled (shutdown, or an explicit disconnect).
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias for protocol operations.
pub type Result<T> = core::result::Result<T, ProtocolError>;
