//! Target interrupt registers.
//!
//! The status block is read in one byte-incrementing transfer starting at
//! [`HOST_INT_STATUS_ADDRESS`]; the enable block is written the same way at
//! [`INT_STATUS_ENABLE_ADDRESS`].

use sdiohtc_bus::{MAILBOX_COUNT, MAILBOX_USED_COUNT};
use sdiohtc_frame::Lookahead;

pub const HOST_INT_STATUS_ADDRESS: u32 = 0x400;
pub const CPU_INT_STATUS_ADDRESS: u32 = 0x401;
pub const ERROR_INT_STATUS_ADDRESS: u32 = 0x402;
pub const COUNTER_INT_STATUS_ADDRESS: u32 = 0x403;
pub const INT_STATUS_ENABLE_ADDRESS: u32 = 0x418;
pub const COUNT_DEC_ADDRESS: u32 = 0x480;

/// host_int_status bits.
pub const HOST_INT_STATUS_MBOX_DATA_MASK: u8 = 0x0F;
pub const HOST_INT_STATUS_COUNTER: u8 = 0x10;
pub const HOST_INT_STATUS_CPU: u8 = 0x40;
pub const HOST_INT_STATUS_ERROR: u8 = 0x80;

/// error_int_status bits.
pub const ERROR_INT_STATUS_TX_OVERFLOW: u8 = 0x01;
pub const ERROR_INT_STATUS_RX_UNDERFLOW: u8 = 0x02;
pub const ERROR_INT_STATUS_WAKEUP: u8 = 0x04;
pub const ERROR_INT_STATUS_MASK: u8 = 0x0F;

/// cpu_int_status bit raised on a target assert.
pub const CPU_INT_STATUS_FATAL: u8 = 0x01;

/// Counter used by the target's debug-assert path.
pub const COUNTER_INT_DEBUG: u8 = 0x01;

/// Lookahead words per mailbox in the status block.
pub const LOOKAHEAD_WORDS_PER_MAILBOX: usize = 2;

const LOOKAHEAD_OFFSET: usize = 8;

/// Bytes read for one snapshot.
pub const SNAPSHOT_LEN: usize = LOOKAHEAD_OFFSET + 4 * LOOKAHEAD_WORDS_PER_MAILBOX * MAILBOX_COUNT;

/// One read of the interrupt status block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrqSnapshot {
    pub host_int_status: u8,
    pub cpu_int_status: u8,
    pub error_int_status: u8,
    pub counter_int_status: u8,
    pub mbox_frame: u8,
    pub rx_lookahead_valid: u8,
    pub host_int_status2: u8,
    pub gmbox_rx_avail: u8,
    pub rx_lookahead: [u32; LOOKAHEAD_WORDS_PER_MAILBOX * MAILBOX_COUNT],
}

impl IrqSnapshot {
    /// Decode a [`SNAPSHOT_LEN`]-byte status block. Missing bytes read as zero.
    pub fn parse(raw: &[u8]) -> Self {
        let byte = |i: usize| raw.get(i).copied().unwrap_or(0);
        let mut rx_lookahead = [0u32; LOOKAHEAD_WORDS_PER_MAILBOX * MAILBOX_COUNT];
        for (i, word) in rx_lookahead.iter_mut().enumerate() {
            let at = LOOKAHEAD_OFFSET + i * 4;
            *word = u32::from_le_bytes([byte(at), byte(at + 1), byte(at + 2), byte(at + 3)]);
        }
        Self {
            host_int_status: byte(0),
            cpu_int_status: byte(1),
            error_int_status: byte(2),
            counter_int_status: byte(3),
            mbox_frame: byte(4),
            rx_lookahead_valid: byte(5),
            host_int_status2: byte(6),
            gmbox_rx_avail: byte(7),
            rx_lookahead,
        }
    }

    pub fn to_bytes(&self) -> [u8; SNAPSHOT_LEN] {
        let mut out = [0u8; SNAPSHOT_LEN];
        out[..LOOKAHEAD_OFFSET].copy_from_slice(&[
            self.host_int_status,
            self.cpu_int_status,
            self.error_int_status,
            self.counter_int_status,
            self.mbox_frame,
            self.rx_lookahead_valid,
            self.host_int_status2,
            self.gmbox_rx_avail,
        ]);
        for (i, word) in self.rx_lookahead.iter().enumerate() {
            let at = LOOKAHEAD_OFFSET + i * 4;
            out[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Lookahead published for `mailbox`.
    pub fn lookahead(&self, mailbox: usize) -> Lookahead {
        Lookahead::from_word(self.rx_lookahead[LOOKAHEAD_WORDS_PER_MAILBOX * mailbox])
    }

    pub fn set_lookahead(&mut self, mailbox: usize, lookahead: Lookahead) {
        self.rx_lookahead[LOOKAHEAD_WORDS_PER_MAILBOX * mailbox] = lookahead.word();
    }
}

/// Interrupt enable block, mirrored by the device's shadow copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqEnable {
    pub int_status_enable: u8,
    pub cpu_int_status_enable: u8,
    pub error_status_enable: u8,
    pub counter_int_status_enable: u8,
}

impl IrqEnable {
    /// Everything the transport services.
    pub fn unmasked() -> Self {
        let mut mailbox_bits = 0u8;
        for mailbox in 0..MAILBOX_USED_COUNT {
            mailbox_bits |= 1 << mailbox;
        }
        Self {
            int_status_enable: HOST_INT_STATUS_ERROR
                | HOST_INT_STATUS_CPU
                | HOST_INT_STATUS_COUNTER
                | mailbox_bits,
            cpu_int_status_enable: 0x03,
            error_status_enable: ERROR_INT_STATUS_RX_UNDERFLOW | ERROR_INT_STATUS_TX_OVERFLOW,
            counter_int_status_enable: COUNTER_INT_DEBUG,
        }
    }

    pub fn masked() -> Self {
        Self::default()
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [
            self.int_status_enable,
            self.cpu_int_status_enable,
            self.error_status_enable,
            self.counter_int_status_enable,
        ]
    }

    pub fn from_bytes(raw: [u8; 4]) -> Self {
        Self {
            int_status_enable: raw[0],
            cpu_int_status_enable: raw[1],
            error_status_enable: raw[2],
            counter_int_status_enable: raw[3],
        }
    }
}
