//! Interrupt dispatch.
//!
//! [`Device::dsr`] runs status passes until nothing is left to service:
//! read the status block, receive on every mailbox with a valid lookahead,
//! then acknowledge CPU, error and counter events.

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use sdiohtc_bus::{RequestFlags, Transfer, MAILBOX_USED_COUNT};
use sdiohtc_frame::Lookahead;

use crate::device::{lock, Counters, Device, DsrState};
use crate::error::{DeviceError, Result};
use crate::registers::{
    IrqSnapshot, COUNTER_INT_DEBUG, COUNT_DEC_ADDRESS, CPU_INT_STATUS_ADDRESS,
    CPU_INT_STATUS_FATAL, ERROR_INT_STATUS_ADDRESS, ERROR_INT_STATUS_MASK,
    ERROR_INT_STATUS_RX_UNDERFLOW, ERROR_INT_STATUS_TX_OVERFLOW, ERROR_INT_STATUS_WAKEUP,
    HOST_INT_STATUS_COUNTER, HOST_INT_STATUS_CPU, HOST_INT_STATUS_ERROR,
};

/// What one [`Device::dsr`] invocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DsrOutcome {
    /// Status passes run.
    pub passes: u32,
    /// Messages delivered upward.
    pub messages: usize,
    /// Whether the hardware interrupt may be acknowledged.
    pub acknowledged: bool,
    /// The receive yield count was reached before the status went quiet.
    pub yielded: bool,
}

struct PassOutcome {
    done: bool,
    messages: usize,
}

impl Device {
    /// Service pending target interrupts.
    ///
    /// On error the interrupt is left unacknowledged so it fires again.
    pub fn dsr(&self) -> Result<DsrOutcome> {
        let mut state = lock(&self.dsr);
        state.recv_count = 0;
        state.recheck = self.config.irq.recheck_count;

        let mut outcome = DsrOutcome::default();
        loop {
            let pass = self.process_pending_irqs(&mut state)?;
            outcome.passes += 1;
            outcome.messages += pass.messages;
            if pass.done {
                break;
            }
            if let Some(limit) = self.config.irq.recv_yield_count {
                if state.recv_count >= limit {
                    debug!(recv_count = state.recv_count, "receive yield reached");
                    outcome.yielded = true;
                    break;
                }
            }
        }
        // Receives run synchronously, so no work is ever left outstanding.
        outcome.acknowledged = !outcome.yielded;
        trace!(?outcome, "dsr finished");
        Ok(outcome)
    }

    fn process_pending_irqs(&self, state: &mut DsrState) -> Result<PassOutcome> {
        let enable = self.irq_enable();
        let mut pass = PassOutcome {
            done: false,
            messages: 0,
        };
        if enable.int_status_enable == 0 {
            pass.done = true;
            return Ok(pass);
        }

        let snapshot = self.read_snapshot()?;
        dump_snapshot(&snapshot);

        let mut host = snapshot.host_int_status & enable.int_status_enable;
        let mut lookaheads: Vec<(u8, Lookahead)> = Vec::new();
        for mailbox in 0..MAILBOX_USED_COUNT {
            let bit = 1u8 << mailbox;
            if host & bit == 0 {
                continue;
            }
            host &= !bit;
            if snapshot.rx_lookahead_valid & bit != 0 {
                lookaheads.push((mailbox as u8, snapshot.lookahead(mailbox)));
            }
        }

        if lookaheads.is_empty() && host == 0 {
            pass.done = true;
            return Ok(pass);
        }

        for (mailbox, lookahead) in lookaheads {
            if lookahead.is_zero() {
                continue;
            }
            let fetched = self.recv_message_pending(state, mailbox, &[lookahead])?;
            if fetched == 0 {
                state.recheck = 0;
            }
            pass.messages += fetched;
        }

        if host & HOST_INT_STATUS_CPU != 0 {
            self.service_cpu_interrupt(&snapshot, enable.cpu_int_status_enable)?;
        }
        if host & HOST_INT_STATUS_ERROR != 0 {
            self.service_error_interrupt(&snapshot)?;
        }
        if host & HOST_INT_STATUS_COUNTER != 0 {
            self.service_counter_interrupt(&snapshot, enable.counter_int_status_enable)?;
        }

        if state.recheck == 0 {
            pass.done = true;
        } else {
            state.recheck -= 1;
        }
        Ok(pass)
    }

    fn service_cpu_interrupt(&self, snapshot: &IrqSnapshot, enabled: u8) -> Result<()> {
        let cpu = snapshot.cpu_int_status & enabled;
        self.ack_register(CPU_INT_STATUS_ADDRESS, cpu)?;
        if cpu & CPU_INT_STATUS_FATAL != 0 {
            error!(cpu_int_status = cpu, "target raised a fatal event");
            Counters::bump(&self.counters.fatal_events);
            self.callbacks.fatal_event(DeviceError::TargetFailure);
        } else {
            debug!(cpu_int_status = cpu, "cpu interrupt");
        }
        Ok(())
    }

    fn service_error_interrupt(&self, snapshot: &IrqSnapshot) -> Result<()> {
        let status = snapshot.error_int_status & ERROR_INT_STATUS_MASK;
        if status == 0 {
            debug!("error interrupt with empty status");
            return Ok(());
        }
        if status & ERROR_INT_STATUS_WAKEUP != 0 {
            debug!("target wakeup");
        }
        if status & ERROR_INT_STATUS_RX_UNDERFLOW != 0 {
            error!("mailbox receive underflow");
        }
        if status & ERROR_INT_STATUS_TX_OVERFLOW != 0 {
            error!("mailbox transmit overflow");
        }
        self.ack_register(ERROR_INT_STATUS_ADDRESS, status)
    }

    fn service_counter_interrupt(&self, snapshot: &IrqSnapshot, enabled: u8) -> Result<()> {
        let counter = snapshot.counter_int_status & enabled;
        if counter & COUNTER_INT_DEBUG == 0 {
            return Ok(());
        }
        let raw = self.bus.submit_sync(Transfer::read(
            COUNT_DEC_ADDRESS,
            4,
            RequestFlags::READ_SYNC_BYTE_INC,
        ))?;
        error!(count = ?&raw[..], "target debug assert counter fired");
        Ok(())
    }

    /// Write-one-to-clear acknowledge of an interrupt status register.
    fn ack_register(&self, address: u32, bits: u8) -> Result<()> {
        self.bus.submit_sync(Transfer::write(
            address,
            &[bits, 0, 0, 0],
            RequestFlags::WRITE_SYNC_BYTE_FIX,
        ))?;
        Ok(())
    }
}

fn dump_snapshot(snapshot: &IrqSnapshot) {
    trace!(
        host = format_args!("{:#04x}", snapshot.host_int_status),
        cpu = format_args!("{:#04x}", snapshot.cpu_int_status),
        error = format_args!("{:#04x}", snapshot.error_int_status),
        counter = format_args!("{:#04x}", snapshot.counter_int_status),
        mbox_frame = snapshot.mbox_frame,
        lookahead_valid = format_args!("{:#04x}", snapshot.rx_lookahead_valid),
        lookahead0 = %snapshot.lookahead(0),
        lookahead1 = %snapshot.lookahead(1),
        "irq status"
    );
    if snapshot.host_int_status2 != 0 || snapshot.gmbox_rx_avail != 0 {
        info!(
            host_int_status2 = snapshot.host_int_status2,
            gmbox_rx_avail = snapshot.gmbox_rx_avail,
            "unserviced status bits"
        );
    }
    if snapshot.host_int_status & !snapshot.rx_lookahead_valid & 0x03 != 0 {
        warn!(
            host = snapshot.host_int_status,
            lookahead_valid = snapshot.rx_lookahead_valid,
            "mailbox data pending without a valid lookahead"
        );
    }
}
