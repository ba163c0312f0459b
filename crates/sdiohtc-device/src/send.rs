//! Transmit path.
//!
//! A send prepends the message header, pads the write to the block size
//! and queues one asynchronous transfer at the pipe's mailbox window. The
//! caller's buffer comes back untouched through
//! [`HostCallbacks::tx_completion`], or in the [`SendError`] when the
//! transfer could not be queued.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use sdiohtc_bus::{
    pipe_to_mailbox, AsyncCompletion, Direction, RequestFlags, Transfer, TransferOutcome,
};
use sdiohtc_frame::{FrameError, FrameHeader, NetBuf, HEADER_SIZE};

use crate::callbacks::HostCallbacks;
use crate::device::{Counters, Device};
use crate::error::{DeviceError, SendError};

/// One message for the target.
#[derive(Debug)]
pub struct Outbound {
    /// Uplink pipe to send on.
    pub pipe: u8,
    /// Opaque id handed back with the completion.
    pub transfer_id: u32,
    pub endpoint: u8,
    /// Header flags, e.g. [`FLAG_NEED_CREDIT_UPDATE`](sdiohtc_frame::FLAG_NEED_CREDIT_UPDATE).
    pub flags: u8,
    pub payload: NetBuf,
}

impl Outbound {
    pub fn new(pipe: u8, endpoint: u8, payload: NetBuf) -> Self {
        Self {
            pipe,
            transfer_id: 0,
            endpoint,
            flags: 0,
            payload,
        }
    }

    pub fn with_transfer_id(mut self, transfer_id: u32) -> Self {
        self.transfer_id = transfer_id;
        self
    }
}

/// Where the header went for an in-flight send.
enum Staging {
    /// Written into the payload's own headroom, which was split off.
    /// `tail` dummy bytes were claimed from its tail room.
    InPlace { front: BytesMut, tail: usize },
    /// Written to a separate buffer; the payload was left as is.
    Copied { payload: NetBuf },
}

impl Staging {
    /// Give the caller back the payload as it was handed to `send`.
    fn restore(self, transferred: BytesMut) -> NetBuf {
        match self {
            Staging::InPlace { front, tail } => {
                let mut buf = NetBuf::rejoin(front, transferred);
                let restored = buf
                    .pull_head(HEADER_SIZE)
                    .and_then(|()| buf.trim_tail(tail));
                debug_assert!(restored.is_some(), "staged bytes surround the data");
                buf
            }
            Staging::Copied { payload } => payload,
        }
    }
}

struct TxContext {
    staging: Staging,
    transfer_id: u32,
    callbacks: Arc<dyn HostCallbacks>,
    counters: Arc<Counters>,
}

impl AsyncCompletion for TxContext {
    fn complete(self: Box<Self>, outcome: TransferOutcome) {
        let ctx = *self;
        let payload = ctx.staging.restore(outcome.buffer);
        let status = outcome.status.map_err(DeviceError::from);
        match &status {
            Ok(()) => {
                Counters::bump(&ctx.counters.tx_completed);
                trace!(transfer_id = ctx.transfer_id, "send completed");
            }
            Err(err) => {
                Counters::bump(&ctx.counters.tx_failed);
                warn!(transfer_id = ctx.transfer_id, error = %err, "send failed");
            }
        }
        ctx.callbacks.tx_completion(payload, ctx.transfer_id, status);
    }
}

impl Device {
    /// Queue `msg` for transmission and return once it is pending.
    ///
    /// The payload is handed back through
    /// [`HostCallbacks::tx_completion`] once the transfer ran.
    pub fn send(&self, msg: Outbound) -> Result<(), SendError> {
        let Outbound {
            pipe,
            transfer_id,
            endpoint,
            flags,
            payload,
        } = msg;

        let fail = |error: DeviceError, payload: NetBuf| {
            Counters::bump(&self.counters.tx_failed);
            debug!(pipe, transfer_id, error = %error, "send rejected");
            Err(SendError { error, payload })
        };

        let address = match pipe_to_mailbox(pipe) {
            Some((_, Direction::Uplink)) => match self.mailbox_map().send_address(pipe) {
                Some(address) => address,
                None => return fail(DeviceError::InvalidPipe(pipe), payload),
            },
            _ => return fail(DeviceError::InvalidPipe(pipe), payload),
        };
        if endpoint >= self.config.endpoint_max {
            let error = FrameError::InvalidEndpoint {
                endpoint,
                max: self.config.endpoint_max,
            };
            return fail(error.into(), payload);
        }
        if payload.len() > self.config.max_payload_len {
            let error = FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_len,
            };
            return fail(error.into(), payload);
        }

        let mut header = FrameHeader::new(endpoint, payload.len() as u16);
        header.flags = flags;
        let nbytes = HEADER_SIZE + payload.len();
        let (padded, dummy) = match self.mailbox_map().pad_write(nbytes) {
            Ok(padding) => padding,
            Err(err) => return fail(err.into(), payload),
        };
        let request_flags = RequestFlags::WRITE_ASYNC_BLOCK_INC.with_dummy_space(dummy);

        let (staging, region) = stage(header, payload, padded - nbytes);
        let ctx = TxContext {
            staging,
            transfer_id,
            callbacks: self.callbacks.clone(),
            counters: self.counters.clone(),
        };
        trace!(
            pipe,
            endpoint,
            address,
            nbytes,
            padded,
            dummy,
            "queueing send"
        );

        match self
            .bus
            .submit_async(Transfer::new(address, region, padded, request_flags), ctx)
        {
            Ok(()) => {
                Counters::bump(&self.counters.tx_submitted);
                Ok(())
            }
            Err(rejected) => {
                let payload = rejected.completion.staging.restore(rejected.transfer.buffer);
                fail(rejected.error.into(), payload)
            }
        }
    }
}

/// Put the header in front of the payload: in place when the buffer has
/// the headroom, otherwise in a fresh buffer.
///
/// In place, the `pad` dummy bytes are written too when the tail room
/// holds them.
fn stage(header: FrameHeader, mut payload: NetBuf, pad: usize) -> (Staging, BytesMut) {
    if payload.headroom() >= HEADER_SIZE {
        let tail = if payload.tailroom() >= pad { pad } else { 0 };
        let written = payload
            .push_head(HEADER_SIZE)
            .is_some_and(|slot| header.write_to(slot).is_ok());
        let padded = payload.push_tail(tail).is_some();
        debug_assert!(written && padded, "room was checked");
        let (front, region) = payload.split_region();
        return (Staging::InPlace { front, tail }, region);
    }
    let mut region = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut region);
    region.extend_from_slice(payload.as_slice());
    (Staging::Copied { payload }, region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use sdiohtc_bus::BusError;

    use crate::config::DeviceConfig;
    use crate::device::lock;
    use crate::sim::{SimBus, SimTarget};

    #[derive(Default)]
    struct Collect {
        tx: Mutex<Vec<(NetBuf, u32, bool)>>,
    }

    impl HostCallbacks for Collect {
        fn rx_completion(&self, _: BytesMut, _: u8) {}

        fn tx_completion(&self, payload: NetBuf, transfer_id: u32, status: Result<(), DeviceError>) {
            lock(&self.tx).push((payload, transfer_id, status.is_ok()));
        }

        fn fatal_event(&self, _: DeviceError) {}
    }

    fn attach(config: DeviceConfig) -> (Device, Arc<Mutex<SimTarget>>, Arc<Collect>) {
        let target = SimTarget::shared(config.block_size);
        let callbacks = Arc::new(Collect::default());
        let device = Device::attach(SimBus::new(target.clone()), config, callbacks.clone())
            .expect("attach should succeed");
        (device, target, callbacks)
    }

    fn wait_for_completion(device: &Device) {
        // The bus worker runs completions before taking the next request.
        device
            .bus
            .submit_sync(Transfer::read(0x400, 4, RequestFlags::READ_SYNC_BYTE_INC))
            .expect("sync read should succeed");
    }

    #[test]
    fn send_pads_to_block_and_restores_payload() {
        let (device, target, callbacks) = attach(DeviceConfig::default().with_block_size(4));
        let payload = NetBuf::with_headroom(HEADER_SIZE, &[0x11; 10]);

        device
            .send(Outbound::new(1, 2, payload).with_transfer_id(7))
            .expect("send should queue");
        wait_for_completion(&device);

        let target = lock(&target);
        let write = &target.mailbox_writes()[0];
        // 8-byte header + 10 bytes, padded to 20 with two dummy bytes.
        assert_eq!(write.length, 20);
        assert_eq!(write.dummy, 2);
        assert_eq!(write.data.len(), 18);
        assert_eq!(write.supplied, 18);
        assert_eq!(write.mailbox, 0);
        let header = FrameHeader::parse(&write.data).expect("header");
        assert_eq!(header.endpoint, 2);
        assert_eq!(header.payload_len, 10);
        assert_eq!(&write.data[HEADER_SIZE..], &[0x11; 10]);

        let tx = lock(&callbacks.tx);
        assert_eq!(tx.len(), 1);
        let (returned, id, ok) = &tx[0];
        assert!(ok);
        assert_eq!(*id, 7);
        assert_eq!(returned.as_slice(), &[0x11; 10]);
        assert_eq!(returned.headroom(), HEADER_SIZE);
        assert_eq!(device.stats().tx_completed, 1);
    }

    #[test]
    fn tail_room_carries_the_dummy_bytes() {
        let (device, target, callbacks) = attach(DeviceConfig::default().with_block_size(4));
        let payload = NetBuf::with_room(HEADER_SIZE, &[0x22; 10], 8);

        device
            .send(Outbound::new(1, 2, payload).with_transfer_id(3))
            .expect("send should queue");
        wait_for_completion(&device);

        let target = lock(&target);
        let write = &target.mailbox_writes()[0];
        assert_eq!(write.length, 20);
        assert_eq!(write.dummy, 2);
        assert_eq!(write.supplied, 20);
        assert_eq!(&write.data[HEADER_SIZE..], &[0x22; 10]);

        let tx = lock(&callbacks.tx);
        let (returned, id, ok) = &tx[0];
        assert!(ok);
        assert_eq!(*id, 3);
        assert_eq!(returned.as_slice(), &[0x22; 10]);
        assert_eq!(returned.headroom(), HEADER_SIZE);
    }

    #[test]
    fn payload_without_headroom_is_staged_in_a_copy() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        let payload = NetBuf::from_slice(b"no room");

        device
            .send(Outbound::new(3, 1, payload))
            .expect("send should queue");
        wait_for_completion(&device);

        let target = lock(&target);
        let write = &target.mailbox_writes()[0];
        assert_eq!(write.mailbox, 1);
        assert_eq!(write.length, 256);
        assert_eq!(&write.data[HEADER_SIZE..], b"no room");
        let tx = lock(&callbacks.tx);
        assert_eq!(tx[0].0.as_slice(), b"no room");
        assert_eq!(tx[0].0.headroom(), 0);
    }

    #[test]
    fn downlink_or_unknown_pipe_is_rejected_with_payload() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());

        for pipe in [0, 2, 9] {
            let err = device
                .send(Outbound::new(pipe, 1, NetBuf::from_slice(b"abc")))
                .unwrap_err();
            assert!(matches!(err.error, DeviceError::InvalidPipe(p) if p == pipe));
            assert_eq!(err.payload.as_slice(), b"abc");
        }
        assert_eq!(device.stats().tx_failed, 3);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());
        let payload = NetBuf::from_slice(&vec![0; 5000]);

        let err = device.send(Outbound::new(1, 1, payload)).unwrap_err();
        assert!(matches!(
            err.error,
            DeviceError::Frame(FrameError::PayloadTooLarge { size: 5000, .. })
        ));
        assert_eq!(err.payload.len(), 5000);
    }

    #[test]
    fn failed_transfer_completes_with_error() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        lock(&target).fail_next_transfer();

        device
            .send(Outbound::new(1, 1, NetBuf::with_headroom(HEADER_SIZE, b"lost")))
            .expect("send should queue");
        wait_for_completion(&device);

        let tx = lock(&callbacks.tx);
        let (payload, _, ok) = &tx[0];
        assert!(!ok);
        assert_eq!(payload.as_slice(), b"lost");
        assert_eq!(device.stats().tx_failed, 1);
    }

    #[test]
    fn send_after_detach_hands_payload_back() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());
        device.bus.shutdown();

        let err = device
            .send(Outbound::new(1, 1, NetBuf::with_headroom(HEADER_SIZE, b"late")))
            .unwrap_err();
        assert!(matches!(err.error, DeviceError::Bus(BusError::Shutdown)));
        assert_eq!(err.payload.as_slice(), b"late");
        assert_eq!(err.payload.headroom(), HEADER_SIZE);
    }
}
