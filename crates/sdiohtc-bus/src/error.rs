/// Errors that can occur while queueing or executing bus transfers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Every request in the fixed pool is in use.
    #[error("bus request pool exhausted ({capacity} requests in flight)")]
    PoolExhausted { capacity: usize },

    /// The platform bus binding reported a failed transfer.
    #[error("bus transfer failed at {address:#06x} ({length} bytes): {reason}")]
    Transfer {
        address: u32,
        length: usize,
        reason: String,
    },

    /// The request flags or length are inconsistent.
    #[error("invalid bus request: {0}")]
    InvalidRequest(String),

    /// A mailbox write is longer than the mailbox window.
    #[error("write of {length} bytes exceeds mailbox window of {window} bytes")]
    WindowOverflow { length: usize, window: u32 },

    /// A block write targets an address outside every mailbox window.
    #[error("address {0:#06x} is not a mailbox window")]
    InvalidAddress(u32),

    /// The worker has been shut down.
    #[error("bus worker shut down")]
    Shutdown,
}

impl BusError {
    /// Build a [`BusError::Transfer`] from a platform failure description.
    pub fn transfer(address: u32, length: usize, reason: impl Into<String>) -> Self {
        Self::Transfer {
            address,
            length,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
