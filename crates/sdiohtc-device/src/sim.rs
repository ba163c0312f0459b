//! In-memory target for tests and the `simulate` command.
//!
//! [`SimTarget`] models the parts of a target the transport touches: the
//! interrupt status block, the enable block, one receive stream per used
//! mailbox and the extended mailbox windows writes land in. [`SimBus`] is
//! the [`RawBus`] binding that drives it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;

use sdiohtc_bus::{
    padded_length, BusError, MailboxLayout, MailboxWindow, RawBus, RequestFlags, Result,
    MAILBOX_USED_COUNT,
};
use sdiohtc_frame::{Lookahead, LOOKAHEAD_SIZE};

use crate::device::lock;
use crate::registers::{
    IrqEnable, IrqSnapshot, COUNTER_INT_STATUS_ADDRESS, COUNT_DEC_ADDRESS,
    CPU_INT_STATUS_ADDRESS, ERROR_INT_STATUS_ADDRESS, ERROR_INT_STATUS_RX_UNDERFLOW,
    HOST_INT_STATUS_ADDRESS, HOST_INT_STATUS_COUNTER, HOST_INT_STATUS_CPU,
    HOST_INT_STATUS_ERROR, INT_STATUS_ENABLE_ADDRESS,
};

const MAILBOX_BASE: u32 = 0x800;
const MAILBOX_WIDTH: u32 = 0x800;

/// One block write captured from an extended mailbox window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
    pub mailbox: u8,
    /// Physical address after the write-address fixup.
    pub address: u32,
    /// Bytes on the bus, dummy bytes included.
    pub length: usize,
    pub dummy: u16,
    /// The real bytes written.
    pub data: Vec<u8>,
    /// Bytes the host buffer held for this write, up to `length`.
    pub supplied: usize,
}

/// Simulated target state.
#[derive(Debug)]
pub struct SimTarget {
    block_size: usize,
    windows: [MailboxWindow; MAILBOX_USED_COUNT],
    dummy_space: u32,
    cpu_int_status: u8,
    error_int_status: u8,
    counter_int_status: u8,
    enable: IrqEnable,
    rx: [VecDeque<Vec<u8>>; MAILBOX_USED_COUNT],
    rx_offset: [usize; MAILBOX_USED_COUNT],
    loopback: bool,
    fail_next: bool,
    status_reads: usize,
    read_lengths: Vec<usize>,
    mailbox_writes: Vec<SimWrite>,
    register_writes: Vec<(u32, Vec<u8>)>,
}

impl SimTarget {
    pub fn new(block_size: u32) -> Self {
        Self::with_layout(block_size, &MailboxLayout::default())
    }

    pub fn with_layout(block_size: u32, layout: &MailboxLayout) -> Self {
        Self {
            block_size: block_size.max(1) as usize,
            windows: layout.windows(),
            dummy_space: layout.dummy_space,
            cpu_int_status: 0,
            error_int_status: 0,
            counter_int_status: 0,
            enable: IrqEnable::masked(),
            rx: Default::default(),
            rx_offset: [0; MAILBOX_USED_COUNT],
            loopback: false,
            fail_next: false,
            status_reads: 0,
            read_lengths: Vec::new(),
            mailbox_writes: Vec::new(),
            register_writes: Vec::new(),
        }
    }

    /// A target ready to be shared between a [`SimBus`] and a test.
    pub fn shared(block_size: u32) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(block_size)))
    }

    /// Queue every written message back onto the mailbox it was sent to.
    pub fn set_loopback(&mut self, loopback: bool) {
        self.loopback = loopback;
    }

    /// Queue a framed message for the host on `mailbox`, padded to the block size.
    pub fn push_rx(&mut self, mailbox: usize, frame: &[u8]) {
        let mut padded = frame.to_vec();
        padded.resize(padded_length(frame.len(), self.block_size), 0);
        self.rx[mailbox].push_back(padded);
    }

    /// Messages not yet fully read on `mailbox`.
    pub fn pending_rx(&self, mailbox: usize) -> usize {
        self.rx[mailbox].len()
    }

    pub fn raise_cpu_event(&mut self, bits: u8) {
        self.cpu_int_status |= bits;
    }

    pub fn raise_error(&mut self, bits: u8) {
        self.error_int_status |= bits;
    }

    pub fn raise_debug_counter(&mut self) {
        self.counter_int_status |= 0x01;
    }

    /// Fail the next transfer of any kind.
    pub fn fail_next_transfer(&mut self) {
        self.fail_next = true;
    }

    /// The status block as the host would read it now.
    pub fn snapshot(&self) -> IrqSnapshot {
        let mut snapshot = IrqSnapshot {
            cpu_int_status: self.cpu_int_status,
            error_int_status: self.error_int_status,
            counter_int_status: self.counter_int_status,
            ..IrqSnapshot::default()
        };
        for mailbox in 0..MAILBOX_USED_COUNT {
            let Some(head) = self.rx[mailbox].front() else {
                continue;
            };
            snapshot.host_int_status |= 1 << mailbox;
            if self.rx_offset[mailbox] == 0 && head.len() >= LOOKAHEAD_SIZE {
                snapshot.rx_lookahead_valid |= 1 << mailbox;
                if let Ok(lookahead) = Lookahead::from_slice(head) {
                    snapshot.set_lookahead(mailbox, lookahead);
                }
            }
        }
        if self.cpu_int_status != 0 {
            snapshot.host_int_status |= HOST_INT_STATUS_CPU;
        }
        if self.error_int_status != 0 {
            snapshot.host_int_status |= HOST_INT_STATUS_ERROR;
        }
        if self.counter_int_status != 0 {
            snapshot.host_int_status |= HOST_INT_STATUS_COUNTER;
        }
        snapshot
    }

    pub fn irq_enable(&self) -> IrqEnable {
        self.enable
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads
    }

    /// Number of reads from the mailbox receive addresses.
    pub fn mailbox_reads(&self) -> usize {
        self.read_lengths.len()
    }

    /// Length of every mailbox read, in order.
    pub fn read_lengths(&self) -> Vec<usize> {
        self.read_lengths.clone()
    }

    pub fn mailbox_writes(&self) -> &[SimWrite] {
        &self.mailbox_writes
    }

    /// Byte-basis writes to the register space, as `(address, bytes)`.
    pub fn register_writes(&self) -> &[(u32, Vec<u8>)] {
        &self.register_writes
    }

    fn transfer(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<()> {
        if std::mem::take(&mut self.fail_next) {
            return Err(BusError::transfer(address, length, "injected fault"));
        }
        if flags.is_write() {
            self.write(address, buffer, length, flags)
        } else {
            let n = length.min(buffer.len());
            self.read(address, &mut buffer[..n])
        }
    }

    fn read(&mut self, address: u32, out: &mut [u8]) -> Result<()> {
        if address == HOST_INT_STATUS_ADDRESS {
            self.status_reads += 1;
            let raw = self.snapshot().to_bytes();
            let n = out.len().min(raw.len());
            out[..n].copy_from_slice(&raw[..n]);
            return Ok(());
        }
        if address == COUNT_DEC_ADDRESS {
            out.fill(0);
            if let Some(first) = out.first_mut() {
                *first = self.counter_int_status;
            }
            self.counter_int_status = 0;
            return Ok(());
        }
        match receive_mailbox(address) {
            Some(mailbox) => {
                self.read_lengths.push(out.len());
                self.drain(mailbox, out);
                Ok(())
            }
            None => Err(BusError::InvalidAddress(address)),
        }
    }

    fn drain(&mut self, mailbox: usize, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            let offset = self.rx_offset[mailbox];
            let Some(head) = self.rx[mailbox].front() else {
                self.error_int_status |= ERROR_INT_STATUS_RX_UNDERFLOW;
                break;
            };
            let n = (head.len() - offset).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&head[offset..offset + n]);
            let finished = offset + n == head.len();
            filled += n;
            if finished {
                self.rx[mailbox].pop_front();
                self.rx_offset[mailbox] = 0;
            } else {
                self.rx_offset[mailbox] = offset + n;
            }
        }
        out[filled..].fill(0);
    }

    fn write(
        &mut self,
        address: u32,
        buffer: &[u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<()> {
        match address {
            CPU_INT_STATUS_ADDRESS => self.cpu_int_status &= !first(buffer),
            ERROR_INT_STATUS_ADDRESS => self.error_int_status &= !first(buffer),
            COUNTER_INT_STATUS_ADDRESS => self.counter_int_status &= !first(buffer),
            INT_STATUS_ENABLE_ADDRESS => {
                let mut raw = [0u8; 4];
                let n = buffer.len().min(4);
                raw[..n].copy_from_slice(&buffer[..n]);
                self.enable = IrqEnable::from_bytes(raw);
            }
            _ => return self.write_mailbox(address, buffer, length, flags),
        }
        let n = length.min(buffer.len());
        self.register_writes.push((address, buffer[..n].to_vec()));
        Ok(())
    }

    fn write_mailbox(
        &mut self,
        address: u32,
        buffer: &[u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<()> {
        let dummy = flags.dummy_space();
        let mailbox = self
            .windows
            .iter()
            .position(|w| address >= w.address && address < w.address + w.size + self.dummy_space)
            .ok_or(BusError::InvalidAddress(address))?;
        let real = length.saturating_sub(usize::from(dummy)).min(buffer.len());
        let data = buffer[..real].to_vec();
        trace!(mailbox, address, length, dummy, "sim mailbox write");
        if self.loopback {
            self.push_rx(mailbox, &data);
        }
        self.mailbox_writes.push(SimWrite {
            mailbox: mailbox as u8,
            address,
            length,
            dummy,
            data,
            supplied: length.min(buffer.len()),
        });
        Ok(())
    }
}

fn first(buffer: &[u8]) -> u8 {
    buffer.first().copied().unwrap_or(0)
}

fn receive_mailbox(address: u32) -> Option<usize> {
    let offset = address.checked_sub(MAILBOX_BASE)?;
    let mailbox = (offset / MAILBOX_WIDTH) as usize;
    (offset % MAILBOX_WIDTH == 0 && mailbox < MAILBOX_USED_COUNT).then_some(mailbox)
}

/// [`RawBus`] binding backed by a shared [`SimTarget`].
#[derive(Debug, Clone)]
pub struct SimBus {
    target: Arc<Mutex<SimTarget>>,
}

impl SimBus {
    pub fn new(target: Arc<Mutex<SimTarget>>) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Arc<Mutex<SimTarget>> {
        &self.target
    }
}

impl RawBus for SimBus {
    fn raw_transfer(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<()> {
        lock(&self.target).transfer(address, buffer, length, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_block_reflects_pending_messages() {
        let mut target = SimTarget::new(64);
        let lookahead = Lookahead::new(3, 0, 20);
        let mut frame = vec![0u8; 28];
        frame[..4].copy_from_slice(&lookahead.0);
        target.push_rx(1, &frame);

        let snapshot = target.snapshot();
        assert_eq!(snapshot.host_int_status, 0x02);
        assert_eq!(snapshot.rx_lookahead_valid, 0x02);
        assert_eq!(snapshot.lookahead(1), lookahead);
    }

    #[test]
    fn partial_read_hides_the_lookahead() {
        let mut target = SimTarget::new(64);
        target.push_rx(0, &[1; 64]);

        let mut out = [0u8; 32];
        target
            .transfer(0x800, &mut out, 32, RequestFlags::READ_SYNC_BLOCK_FIX)
            .expect("read");
        let snapshot = target.snapshot();
        assert_eq!(snapshot.host_int_status & 0x01, 0x01);
        assert_eq!(snapshot.rx_lookahead_valid, 0);
    }

    #[test]
    fn reading_past_the_stream_flags_underflow() {
        let mut target = SimTarget::new(64);
        target.push_rx(0, &[9; 10]);

        let mut out = [0xEEu8; 128];
        target
            .transfer(0x800, &mut out, 128, RequestFlags::READ_SYNC_BLOCK_FIX)
            .expect("read");
        assert_eq!(&out[..10], &[9; 10]);
        assert!(out[10..].iter().all(|&b| b == 0));
        assert_eq!(target.snapshot().error_int_status, ERROR_INT_STATUS_RX_UNDERFLOW);
        assert_eq!(target.pending_rx(0), 0);
    }

    #[test]
    fn status_acks_clear_written_bits() {
        let mut target = SimTarget::new(64);
        target.raise_cpu_event(0x03);
        target
            .transfer(
                CPU_INT_STATUS_ADDRESS,
                &mut [0x01, 0, 0, 0],
                4,
                RequestFlags::WRITE_SYNC_BYTE_FIX,
            )
            .expect("write");
        assert_eq!(target.snapshot().cpu_int_status, 0x02);
    }

    #[test]
    fn unknown_address_is_rejected() {
        let mut target = SimTarget::new(64);
        let err = target
            .transfer(0x1234, &mut [0; 4], 4, RequestFlags::READ_SYNC_BYTE_INC)
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidAddress(0x1234)));
    }
}
