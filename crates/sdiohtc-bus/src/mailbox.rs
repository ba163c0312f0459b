//! Pipe ↔ mailbox mapping, mailbox windows and block arithmetic.
//!
//! Pipes come in pairs per mailbox: the even pipe carries target→host
//! traffic, the odd pipe host→target traffic. Pipes 0/1 use mailbox 0,
//! pipes 2/3 use mailbox 1.

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::request::RequestFlags;

/// Number of hardware mailboxes.
pub const MAILBOX_COUNT: usize = 4;

/// Number of mailboxes carrying HTC traffic.
pub const MAILBOX_USED_COUNT: usize = 2;

/// Base address of mailbox 0.
pub const MAILBOX_BASE_ADDRESS: u32 = 0x800;

/// Width of each legacy mailbox window.
pub const MAILBOX_WIDTH: u32 = 0x800;

/// Sentinel for "no mailbox".
pub const INVALID_MAILBOX: u8 = 0xFF;

/// Pipes handled by the mailbox layer.
pub const PIPE_COUNT: u8 = 4;

/// Host control register window: byte-basis accesses, never shifted.
const HOST_CONTROL_WINDOW: std::ops::Range<u32> = 0x800..0xC00;

/// Transfer direction of a pipe, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Host → target.
    Uplink,
    /// Target → host.
    Downlink,
}

/// Map a pipe to its `(mailbox, direction)` pair.
pub fn pipe_to_mailbox(pipe: u8) -> Option<(u8, Direction)> {
    if pipe >= PIPE_COUNT {
        return None;
    }
    let direction = if pipe % 2 == 1 {
        Direction::Uplink
    } else {
        Direction::Downlink
    };
    Some((pipe / 2, direction))
}

/// Mailbox index for a pipe, or [`INVALID_MAILBOX`].
pub fn mailbox_for_pipe(pipe: u8) -> u8 {
    pipe_to_mailbox(pipe).map_or(INVALID_MAILBOX, |(mailbox, _)| mailbox)
}

/// Inverse of [`pipe_to_mailbox`].
pub fn mailbox_to_pipe(mailbox: u8, direction: Direction) -> Option<u8> {
    if usize::from(mailbox) >= MAILBOX_USED_COUNT {
        return None;
    }
    let base = mailbox * 2;
    Some(match direction {
        Direction::Downlink => base,
        Direction::Uplink => base + 1,
    })
}

/// HTC service ids the mailbox layer knows how to route.
pub mod service {
    pub const RSVD_CTRL: u16 = 0x0001;
    pub const WMI_CONTROL: u16 = 0x0100;
    pub const WMI_DATA_BE: u16 = 0x0101;
    pub const WMI_DATA_BK: u16 = 0x0102;
    pub const WMI_DATA_VI: u16 = 0x0103;
    pub const WMI_DATA_VO: u16 = 0x0104;
    pub const HTT_DATA_MSG: u16 = 0x0300;
    pub const RAW_STREAMS: u16 = 0x0400;
}

/// Pipes used by an HTC service as `(uplink, downlink)`.
///
/// HTT data and WMI control trade mailboxes when `swap` is set.
pub fn map_service_to_pipe(service_id: u16, swap: bool) -> Option<(u8, u8)> {
    let (mailbox0, mailbox1) = ((1, 0), (3, 2));
    match service_id {
        service::HTT_DATA_MSG => Some(if swap { mailbox0 } else { mailbox1 }),
        service::WMI_CONTROL => Some(if swap { mailbox1 } else { mailbox0 }),
        service::RSVD_CTRL
        | service::RAW_STREAMS
        | service::WMI_DATA_BE
        | service::WMI_DATA_BK
        | service::WMI_DATA_VI
        | service::WMI_DATA_VO => Some(mailbox0),
        _ => None,
    }
}

/// Extended address window of one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxWindow {
    pub address: u32,
    pub size: u32,
}

/// Chip-specific placement of the extended mailbox windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxLayout {
    /// Extended address of mailbox 0.
    pub mbox0_address: u32,
    /// Size of mailbox 0's extended window.
    pub mbox0_size: u32,
    /// Size of mailbox 1's extended window.
    pub mbox1_size: u32,
    /// Gap between the two windows used for dummy-space writes.
    pub dummy_space: u32,
}

impl Default for MailboxLayout {
    fn default() -> Self {
        Self {
            mbox0_address: 0x6800,
            mbox0_size: 56 * 1024,
            mbox1_size: 36 * 1024,
            dummy_space: 2 * 1024,
        }
    }
}

impl MailboxLayout {
    /// Windows for the used mailboxes; mailbox 1 follows mailbox 0 and the
    /// dummy-space gap.
    pub fn windows(&self) -> [MailboxWindow; MAILBOX_USED_COUNT] {
        [
            MailboxWindow {
                address: self.mbox0_address,
                size: self.mbox0_size,
            },
            MailboxWindow {
                address: self.mbox0_address + self.mbox0_size + self.dummy_space,
                size: self.mbox1_size,
            },
        ]
    }
}

/// Resolved mailbox address table for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMap {
    addresses: [u32; MAILBOX_COUNT],
    windows: [MailboxWindow; MAILBOX_USED_COUNT],
    block_size: u32,
}

impl MailboxMap {
    /// Build the table. `block_size` must be a non-zero power of two.
    pub fn new(layout: &MailboxLayout, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(BusError::InvalidRequest(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        let mut addresses = [0u32; MAILBOX_COUNT];
        for (i, address) in addresses.iter_mut().enumerate() {
            *address = MAILBOX_BASE_ADDRESS + i as u32 * MAILBOX_WIDTH;
        }
        Ok(Self {
            addresses,
            windows: layout.windows(),
            block_size,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Legacy (receive) address of a mailbox.
    pub fn mailbox_address(&self, mailbox: u8) -> Option<u32> {
        self.addresses.get(usize::from(mailbox)).copied()
    }

    /// Extended window of a used mailbox.
    pub fn window(&self, mailbox: u8) -> Option<MailboxWindow> {
        self.windows.get(usize::from(mailbox)).copied()
    }

    /// Extended window address that uplink traffic for `pipe` is written to.
    pub fn send_address(&self, pipe: u8) -> Option<u32> {
        let (mailbox, _) = pipe_to_mailbox(pipe)?;
        self.window(mailbox).map(|window| window.address)
    }

    /// `n` rounded up to the block size.
    pub fn padded_length(&self, n: usize) -> usize {
        padded_length(n, self.block_size as usize)
    }

    /// Padded length and dummy-space count for a write of `n` real bytes.
    pub fn pad_write(&self, n: usize) -> Result<(usize, u16)> {
        let padded = self.padded_length(n);
        let dummy = u16::try_from(padded - n).map_err(|_| {
            BusError::InvalidRequest(format!("padding of {} bytes overflows dummy space", padded - n))
        })?;
        Ok((padded, dummy))
    }

    /// Physical address for a write request.
    ///
    /// Block writes into a mailbox are shifted so the last byte lands at the
    /// end of the window; dummy bytes extend past it into the dummy space.
    pub fn fixup_write_address(
        &self,
        address: u32,
        length: usize,
        flags: RequestFlags,
    ) -> Result<u32> {
        if !flags.is_write() || !flags.is_block() || HOST_CONTROL_WINDOW.contains(&address) {
            return Ok(address);
        }
        let window_size = if self.addresses.contains(&address) {
            MAILBOX_WIDTH
        } else if let Some(window) = self.windows.iter().find(|w| w.address == address) {
            window.size
        } else {
            return Err(BusError::InvalidAddress(address));
        };
        let length32 = u32::try_from(length).unwrap_or(u32::MAX);
        if length32 > window_size {
            return Err(BusError::WindowOverflow {
                length,
                window: window_size,
            });
        }
        Ok(address + (window_size - length32) + u32::from(flags.dummy_space()))
    }
}

/// `n` rounded up to a multiple of `block_size` (a power of two).
pub fn padded_length(n: usize, block_size: usize) -> usize {
    let mask = block_size - 1;
    (n + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> MailboxMap {
        MailboxMap::new(&MailboxLayout::default(), 256).expect("default layout should be valid")
    }

    #[test]
    fn padding_invariant_holds_for_every_block_size() {
        for block in [1usize, 4, 32, 128, 256, 512] {
            for n in 0..2048usize {
                let padded = padded_length(n, block);
                assert_eq!(padded % block, 0, "n={n} block={block}");
                assert!(padded >= n);
                assert!(padded - n < block, "n={n} block={block}");
            }
        }
    }

    #[test]
    fn pipes_map_to_mailbox_pairs() {
        assert_eq!(pipe_to_mailbox(0), Some((0, Direction::Downlink)));
        assert_eq!(pipe_to_mailbox(1), Some((0, Direction::Uplink)));
        assert_eq!(pipe_to_mailbox(2), Some((1, Direction::Downlink)));
        assert_eq!(pipe_to_mailbox(3), Some((1, Direction::Uplink)));
        assert_eq!(pipe_to_mailbox(4), None);
        assert_eq!(mailbox_for_pipe(7), INVALID_MAILBOX);
    }

    #[test]
    fn mailbox_to_pipe_inverts_pipe_to_mailbox() {
        for pipe in 0..PIPE_COUNT {
            let (mailbox, direction) = pipe_to_mailbox(pipe).expect("pipe should map");
            assert_eq!(mailbox_to_pipe(mailbox, direction), Some(pipe));
        }
        assert_eq!(mailbox_to_pipe(2, Direction::Uplink), None);
    }

    #[test]
    fn service_map_honors_swap() {
        assert_eq!(map_service_to_pipe(service::HTT_DATA_MSG, false), Some((3, 2)));
        assert_eq!(map_service_to_pipe(service::HTT_DATA_MSG, true), Some((1, 0)));
        assert_eq!(map_service_to_pipe(service::WMI_CONTROL, false), Some((1, 0)));
        assert_eq!(map_service_to_pipe(service::WMI_CONTROL, true), Some((3, 2)));
        assert_eq!(map_service_to_pipe(service::RSVD_CTRL, true), Some((1, 0)));
        assert_eq!(map_service_to_pipe(0x7777, false), None);
    }

    #[test]
    fn mailbox_one_window_follows_dummy_space() {
        let layout = MailboxLayout::default();
        let windows = layout.windows();
        assert_eq!(windows[0].address, 0x6800);
        assert_eq!(
            windows[1].address,
            0x6800 + layout.mbox0_size + layout.dummy_space
        );
        assert_eq!(map().send_address(3), Some(windows[1].address));
        assert_eq!(map().send_address(9), None);
    }

    #[test]
    fn pad_write_reports_dummy_bytes() {
        let map = MailboxMap::new(&MailboxLayout::default(), 4).expect("block size 4 is valid");
        assert_eq!(map.pad_write(10).expect("should pad"), (12, 2));
        assert_eq!(map.pad_write(12).expect("should pad"), (12, 0));
    }

    #[test]
    fn fixup_places_message_at_window_end() {
        let map = map();
        let window = map.window(0).expect("mailbox 0 window");
        let flags = RequestFlags::WRITE_ASYNC_BLOCK_INC.with_dummy_space(6);
        let address = map
            .fixup_write_address(window.address, 256, flags)
            .expect("write fits the window");
        assert_eq!(address, window.address + window.size - 256 + 6);
    }

    #[test]
    fn fixup_rejects_oversized_and_unknown_targets() {
        let map = map();
        let window = map.window(1).expect("mailbox 1 window");
        let err = map
            .fixup_write_address(window.address, window.size as usize + 1, RequestFlags::WRITE_ASYNC_BLOCK_INC)
            .expect_err("write larger than window should fail");
        assert!(matches!(err, BusError::WindowOverflow { .. }));

        let err = map
            .fixup_write_address(0x4000, 16, RequestFlags::WRITE_ASYNC_BLOCK_INC)
            .expect_err("unknown address should fail");
        assert!(matches!(err, BusError::InvalidAddress(0x4000)));
    }

    #[test]
    fn register_writes_pass_through() {
        let map = map();
        assert_eq!(
            map.fixup_write_address(0x418, 4, RequestFlags::WRITE_SYNC_BYTE_INC)
                .expect("register write"),
            0x418
        );
        assert_eq!(
            map.fixup_write_address(0x900, 256, RequestFlags::WRITE_ASYNC_BLOCK_INC)
                .expect("host control window write"),
            0x900
        );
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(MailboxMap::new(&MailboxLayout::default(), 0).is_err());
        assert!(MailboxMap::new(&MailboxLayout::default(), 48).is_err());
    }
}
