//! Loopback against the simulated target: every message sent comes back
//! on the mailbox it went out on and is picked up by the service routine.
//!
//! Run with:
//!   cargo run --example loopback --features sim

use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

use sdiohtc::device::sim::{SimBus, SimTarget};
use sdiohtc::device::{Device, DeviceConfig, DeviceError, HostCallbacks, Outbound};
use sdiohtc::frame::{NetBuf, HEADER_SIZE};

#[derive(Default)]
struct Printer {
    sent: Mutex<usize>,
}

impl HostCallbacks for Printer {
    fn rx_completion(&self, buffer: BytesMut, pipe: u8) {
        let body = buffer.get(HEADER_SIZE..).unwrap_or(&[]);
        eprintln!(
            "pipe {pipe}: {} bytes: {}",
            buffer.len(),
            String::from_utf8_lossy(body)
        );
    }

    fn tx_completion(&self, payload: NetBuf, transfer_id: u32, status: Result<(), DeviceError>) {
        eprintln!(
            "sent #{transfer_id} ({} bytes): {}",
            payload.len(),
            if status.is_ok() { "ok" } else { "failed" }
        );
        *self.sent.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn fatal_event(&self, status: DeviceError) {
        eprintln!("target failure: {status}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DeviceConfig::default().with_block_size(64);
    let target = SimTarget::shared(config.block_size);
    target
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .set_loopback(true);

    let printer = Arc::new(Printer::default());
    let device = Device::attach(SimBus::new(target.clone()), config, printer.clone())?;
    device.start()?;

    for (id, (pipe, text)) in [(1, "hello"), (3, "over the second mailbox"), (1, "bye")]
        .into_iter()
        .enumerate()
    {
        let payload = NetBuf::with_headroom(HEADER_SIZE, text.as_bytes());
        device
            .send(Outbound::new(pipe, 1, payload).with_transfer_id(id as u32))
            .map_err(|err| err.error)?;
    }

    // Sends are asynchronous; keep servicing until everything came back.
    for _ in 0..100 {
        if device.stats().rx_messages >= 3 {
            break;
        }
        let outcome = device.dsr()?;
        if outcome.messages == 0 {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    let stats = device.stats();
    eprintln!(
        "tx_completed={} rx_messages={} rx_single_fetches={}",
        stats.tx_completed, stats.rx_messages, stats.rx_single_fetches
    );
    device.detach();
    Ok(())
}
