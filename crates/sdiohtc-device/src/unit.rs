use bitflags::bitflags;
use bytes::BytesMut;
use sdiohtc_frame::{Lookahead, HEADER_SIZE};

use crate::error::DeviceError;

bitflags! {
    /// Per-unit receive state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxFlags: u8 {
        /// Do not take a lookahead from this unit's trailer.
        const IGNORE_LOOKAHEAD = 1 << 0;
        /// The header was not announced by a lookahead; trust the fetched bytes.
        const REFRESH_HEADER = 1 << 1;
        /// Fetched as part of a bundle transfer.
        const PART_OF_BUNDLE = 1 << 2;
        /// The buffer must not go back to a recycling pool.
        const NO_RECYCLE = 1 << 3;
    }
}

/// Callback that takes a unit completed outside the normal delivery path.
pub type UnitCompletion = Box<dyn FnOnce(ReceiveUnit, Result<(), DeviceError>) + Send>;

/// One expected inbound message.
pub struct ReceiveUnit {
    pub buffer: BytesMut,
    /// Header plus payload, as announced or refreshed.
    pub actual_length: usize,
    pub endpoint: u8,
    /// Lookahead the fetched header must match; `None` for refreshed units.
    pub expected: Option<Lookahead>,
    pub flags: RxFlags,
    pub completion: Option<UnitCompletion>,
}

impl ReceiveUnit {
    /// A unit sized from `lookahead`, backed by `buffer`.
    pub fn new(buffer: BytesMut, lookahead: Lookahead) -> Self {
        Self {
            buffer,
            actual_length: lookahead.full_length(),
            endpoint: lookahead.endpoint(),
            expected: Some(lookahead),
            flags: RxFlags::empty(),
            completion: None,
        }
    }

    /// A later unit of a bundle: only the size of the first one is known.
    pub fn refreshed(buffer: BytesMut, lookahead: Lookahead) -> Self {
        Self {
            expected: None,
            flags: RxFlags::REFRESH_HEADER,
            ..Self::new(buffer, lookahead)
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn payload_len(&self) -> usize {
        self.actual_length.saturating_sub(HEADER_SIZE)
    }
}

impl std::fmt::Debug for ReceiveUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveUnit")
            .field("capacity", &self.capacity())
            .field("actual_length", &self.actual_length)
            .field("endpoint", &self.endpoint)
            .field("expected", &self.expected)
            .field("flags", &self.flags)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}
