use bitflags::bitflags;
use bytes::BytesMut;

use crate::error::Result;

bitflags! {
    /// Request word carried by every bus transfer.
    ///
    /// The upper 16 bits are not flags: they hold the dummy-space byte count,
    /// the number of trailing bytes the hardware pads on our behalf so a
    /// block-aligned transfer never needs an over-sized host buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SYNCHRONOUS = 1 << 2;
        const ASYNCHRONOUS = 1 << 3;
        const BYTE_BASIS = 1 << 4;
        const BLOCK_BASIS = 1 << 5;
        const FIXED_ADDRESS = 1 << 6;
        const INCREMENTAL_ADDRESS = 1 << 7;
        const DUMMY_SPACE = 0xFFFF_0000;
    }
}

const DUMMY_SPACE_SHIFT: u32 = 16;

impl RequestFlags {
    /// Synchronous block read from a fixed (FIFO) address.
    pub const READ_SYNC_BLOCK_FIX: Self = Self::READ
        .union(Self::SYNCHRONOUS)
        .union(Self::BLOCK_BASIS)
        .union(Self::FIXED_ADDRESS);

    /// Synchronous byte-wise read from incrementing register addresses.
    pub const READ_SYNC_BYTE_INC: Self = Self::READ
        .union(Self::SYNCHRONOUS)
        .union(Self::BYTE_BASIS)
        .union(Self::INCREMENTAL_ADDRESS);

    /// Synchronous byte-wise write to incrementing register addresses.
    pub const WRITE_SYNC_BYTE_INC: Self = Self::WRITE
        .union(Self::SYNCHRONOUS)
        .union(Self::BYTE_BASIS)
        .union(Self::INCREMENTAL_ADDRESS);

    /// Synchronous byte-wise write to one fixed register address.
    pub const WRITE_SYNC_BYTE_FIX: Self = Self::WRITE
        .union(Self::SYNCHRONOUS)
        .union(Self::BYTE_BASIS)
        .union(Self::FIXED_ADDRESS);

    /// Asynchronous block write walking a mailbox window.
    pub const WRITE_ASYNC_BLOCK_INC: Self = Self::WRITE
        .union(Self::ASYNCHRONOUS)
        .union(Self::BLOCK_BASIS)
        .union(Self::INCREMENTAL_ADDRESS);

    /// Number of dummy bytes the hardware appends to this transfer.
    pub fn dummy_space(self) -> u16 {
        (self.bits() >> DUMMY_SPACE_SHIFT) as u16
    }

    /// Replace the dummy-space byte count.
    pub fn with_dummy_space(self, count: u16) -> Self {
        let flags = self.bits() & !Self::DUMMY_SPACE.bits();
        Self::from_bits_retain(flags | (u32::from(count) << DUMMY_SPACE_SHIFT))
    }

    /// Flags with the synchronous bit swapped for the asynchronous one.
    pub fn into_async(self) -> Self {
        self.difference(Self::SYNCHRONOUS).union(Self::ASYNCHRONOUS)
    }

    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_block(self) -> bool {
        self.contains(Self::BLOCK_BASIS)
    }

    pub(crate) fn check(self, synchronous: bool) -> Result<()> {
        let modes = self & (Self::SYNCHRONOUS | Self::ASYNCHRONOUS);
        let expected = if synchronous {
            Self::SYNCHRONOUS
        } else {
            Self::ASYNCHRONOUS
        };
        if modes != expected {
            return Err(crate::BusError::InvalidRequest(format!(
                "mode bits {modes:?} do not match a {} submission",
                if synchronous { "synchronous" } else { "asynchronous" }
            )));
        }
        if self.contains(Self::READ) == self.contains(Self::WRITE) {
            return Err(crate::BusError::InvalidRequest(
                "exactly one of READ or WRITE must be set".to_string(),
            ));
        }
        if self.contains(Self::BYTE_BASIS) == self.contains(Self::BLOCK_BASIS) {
            return Err(crate::BusError::InvalidRequest(
                "exactly one of BYTE_BASIS or BLOCK_BASIS must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// One physical transfer handed to the queue.
///
/// For writes the buffer holds the real bytes only; `length` may exceed the
/// buffer by the dummy-space count carried in `flags`.
#[derive(Debug)]
pub struct Transfer {
    pub address: u32,
    pub buffer: BytesMut,
    pub length: usize,
    pub flags: RequestFlags,
}

impl Transfer {
    pub fn new(address: u32, buffer: BytesMut, length: usize, flags: RequestFlags) -> Self {
        Self {
            address,
            buffer,
            length,
            flags,
        }
    }

    /// A read of `length` bytes into a freshly zeroed buffer.
    pub fn read(address: u32, length: usize, flags: RequestFlags) -> Self {
        Self::new(address, BytesMut::zeroed(length), length, flags)
    }

    /// A write of every byte in `data`.
    pub fn write(address: u32, data: &[u8], flags: RequestFlags) -> Self {
        Self::new(address, BytesMut::from(data), data.len(), flags)
    }
}

/// Result of an executed transfer, handed back with the buffer.
#[derive(Debug)]
pub struct TransferOutcome {
    pub buffer: BytesMut,
    pub status: Result<()>,
}
