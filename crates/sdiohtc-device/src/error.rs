use sdiohtc_bus::BusError;
use sdiohtc_frame::{FrameError, Lookahead, NetBuf};

/// Errors that can occur in device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Bus-level error.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Header or trailer decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A fetched header differs from the lookahead that announced it.
    #[error("lookahead mismatch (expected {expected}, got {actual})")]
    LookaheadMismatch {
        expected: Lookahead,
        actual: Lookahead,
    },

    /// A refreshed header names a different endpoint than its receive unit.
    #[error("endpoint mismatch (unit {expected}, header {actual})")]
    EndpointMismatch { expected: u8, actual: u8 },

    /// A message does not fit its receive buffer.
    #[error("receive buffer too small ({needed} bytes, capacity {capacity})")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The pipe does not map to a mailbox.
    #[error("invalid pipe {0}")]
    InvalidPipe(u8),

    /// The mailbox index is out of range.
    #[error("invalid mailbox {0}")]
    InvalidMailbox(u8),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target raised its fatal CPU event.
    #[error("target reported a fatal error")]
    TargetFailure,
}

impl DeviceError {
    /// True for errors that abort a whole receive pass: the mailbox contents
    /// past this point can no longer be trusted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DeviceError::Frame(_)
                | DeviceError::LookaheadMismatch { .. }
                | DeviceError::EndpointMismatch { .. }
                | DeviceError::BufferTooSmall { .. }
        )
    }
}

/// A failed send; the caller gets its buffer back.
#[derive(Debug, thiserror::Error)]
#[error("send failed: {error}")]
pub struct SendError {
    #[source]
    pub error: DeviceError,
    pub payload: NetBuf,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
