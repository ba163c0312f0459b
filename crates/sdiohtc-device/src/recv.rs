//! Receive framing engine.
//!
//! One call drains what a set of lookaheads announced on one mailbox:
//! buffers are allocated per announced message, fetched singly or as a
//! bundle, validated in order and delivered upward. The trailer of the last
//! validated message may announce more, which starts another round.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use tracing::{debug, error, trace, warn};

use sdiohtc_bus::{mailbox_to_pipe, Direction, RequestFlags, Transfer};
use sdiohtc_frame::{FrameError, Lookahead};

use crate::device::{Counters, Device, DsrState};
use crate::error::{DeviceError, Result};
use crate::unit::{ReceiveUnit, RxFlags};
use crate::validate::validate_unit;

impl Device {
    /// Fetch and deliver everything `lookaheads` announced on `mailbox`.
    ///
    /// Returns the number of messages delivered. An `Ok` with fewer
    /// messages than announced means buffers ran out; see
    /// [`Device::waiting_for_buffers`].
    pub(crate) fn recv_message_pending(
        &self,
        state: &mut DsrState,
        mailbox: u8,
        lookaheads: &[Lookahead],
    ) -> Result<usize> {
        let max = self.config.bundle.max_messages;
        if lookaheads.len() > max {
            return Err(FrameError::TooManyLookaheads {
                count: lookaheads.len(),
                max,
            }
            .into());
        }
        let address = self
            .mailbox_map()
            .mailbox_address(mailbox)
            .ok_or(DeviceError::InvalidMailbox(mailbox))?;
        let pipe = mailbox_to_pipe(mailbox, Direction::Downlink)
            .ok_or(DeviceError::InvalidMailbox(mailbox))?;

        let mut seeds = lookaheads.to_vec();
        let mut delivered = 0;

        while !seeds.is_empty() {
            let mut queue = match self.prepare_units(&seeds) {
                Ok(queue) => queue,
                Err(err) => return Err(self.abort_pass(err)),
            };
            if queue.is_empty() {
                break;
            }
            seeds.clear();

            let mut partial = false;
            while !queue.is_empty() {
                let mut fetched = Vec::new();
                if queue.len() > 1 && self.bundling_enabled() {
                    match self.fetch_bundle(address, &mut queue, &mut partial) {
                        Ok(units) => fetched = units,
                        Err(err) => return Err(self.abort_pass(err)),
                    }
                }
                if fetched.is_empty() {
                    let Some(unit) = next_single(&mut queue) else {
                        break;
                    };
                    match self.fetch_single(address, unit) {
                        Ok(Some(unit)) => fetched.push(unit),
                        Ok(None) => {}
                        Err(err) => return Err(self.abort_pass(err)),
                    }
                }
                state.recv_count += 1;

                for mut unit in fetched {
                    let next = match validate_unit(
                        &mut unit,
                        self.config.block_size as usize,
                        self.config.endpoint_max,
                        max,
                    ) {
                        Ok(next) => next,
                        Err(err) => return Err(self.abort_pass(err)),
                    };
                    // Only the most recent message knows what follows it.
                    seeds = next;
                    self.deliver(unit, pipe);
                    delivered += 1;
                }
            }
            if !seeds.is_empty() {
                trace!(count = seeds.len(), "trailer announced more messages");
            }
        }

        Ok(delivered)
    }

    /// Allocate one receive unit per announced message.
    ///
    /// Stops early, without error, when the host has no buffer to give.
    fn prepare_units(&self, seeds: &[Lookahead]) -> Result<VecDeque<ReceiveUnit>> {
        let mut queue = VecDeque::new();
        self.waiting_for_buffers.store(false, Ordering::Relaxed);

        'seeds: for &lookahead in seeds {
            if lookahead.endpoint() >= self.config.endpoint_max {
                return Err(FrameError::InvalidEndpoint {
                    endpoint: lookahead.endpoint(),
                    max: self.config.endpoint_max,
                }
                .into());
            }
            let payload = usize::from(lookahead.payload_len());
            if payload > self.config.max_payload_len {
                return Err(FrameError::PayloadTooLarge {
                    size: payload,
                    max: self.config.max_payload_len,
                }
                .into());
            }

            let needed = self.mailbox_map().padded_length(lookahead.full_length());
            for index in 0..lookahead.message_count() {
                let Some(mut buffer) = self.callbacks.alloc_rx_buffer(self.config.rx_buffer_size)
                else {
                    self.waiting_for_buffers.store(true, Ordering::Relaxed);
                    Counters::bump(&self.counters.rx_buffer_waits);
                    debug!(allocated = queue.len(), "no receive buffer, waiting");
                    break 'seeds;
                };
                let capacity = buffer.capacity();
                buffer.resize(capacity, 0);
                if needed > capacity {
                    return Err(DeviceError::BufferTooSmall { needed, capacity });
                }
                let unit = if index == 0 {
                    ReceiveUnit::new(buffer, lookahead)
                } else {
                    // Bundled followers share the first message's padded
                    // size; their headers are only known once fetched.
                    ReceiveUnit::refreshed(buffer, lookahead)
                };
                queue.push_back(unit);
            }
        }
        Ok(queue)
    }

    /// Read one unit with its own transfer.
    ///
    /// A unit whose padded length does not fit its buffer is handed to its
    /// completion with an error when it has one; otherwise the pass fails.
    fn fetch_single(&self, address: u32, mut unit: ReceiveUnit) -> Result<Option<ReceiveUnit>> {
        let padded = self.mailbox_map().padded_length(unit.actual_length);
        if padded > unit.capacity() {
            let capacity = unit.capacity();
            if let Some(completion) = unit.completion.take() {
                completion(
                    unit,
                    Err(DeviceError::InvalidArgument(format!(
                        "padded length {padded} exceeds buffer capacity {capacity}"
                    ))),
                );
                return Ok(None);
            }
            return Err(DeviceError::BufferTooSmall {
                needed: padded,
                capacity,
            });
        }

        let buffer = std::mem::take(&mut unit.buffer);
        unit.buffer = self.bus.submit_sync(Transfer::new(
            address,
            buffer,
            padded,
            RequestFlags::READ_SYNC_BLOCK_FIX,
        ))?;
        Counters::bump(&self.counters.rx_single_fetches);
        trace!(address, padded, endpoint = unit.endpoint, "single fetch");
        Ok(Some(unit))
    }

    fn deliver(&self, mut unit: ReceiveUnit, pipe: u8) {
        unit.buffer.truncate(unit.actual_length);
        trace!(
            pipe,
            endpoint = unit.endpoint,
            len = unit.actual_length,
            "delivering message"
        );
        Counters::bump(&self.counters.rx_messages);
        self.callbacks.rx_completion(unit.buffer, pipe);
    }

    fn abort_pass(&self, err: DeviceError) -> DeviceError {
        Counters::bump(&self.counters.rx_aborted_passes);
        if err.is_protocol_violation() {
            error!(error = %err, "receive pass aborted");
        } else {
            warn!(error = %err, "receive pass failed");
        }
        err
    }
}

/// Take the next unit for a single fetch.
///
/// Units still queued behind it were already announced, so a trailer
/// lookahead on this one would point at them again.
fn next_single(queue: &mut VecDeque<ReceiveUnit>) -> Option<ReceiveUnit> {
    let mut unit = queue.pop_front()?;
    if !queue.is_empty() {
        unit.flags |= RxFlags::IGNORE_LOOKAHEAD;
    }
    Some(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use bytes::BytesMut;
    use sdiohtc_frame::{FrameBuilder, LookaheadReport, NetBuf};

    use crate::callbacks::HostCallbacks;
    use crate::config::DeviceConfig;
    use crate::device::lock;
    use crate::sim::{SimBus, SimTarget};

    #[derive(Default)]
    struct Collect {
        rx: Mutex<Vec<(BytesMut, u8)>>,
        buffers_left: Mutex<Option<usize>>,
        bundle_scratch: Mutex<bool>,
    }

    impl HostCallbacks for Collect {
        fn rx_completion(&self, buffer: BytesMut, pipe: u8) {
            lock(&self.rx).push((buffer, pipe));
        }

        fn tx_completion(&self, _: NetBuf, _: u32, _: std::result::Result<(), DeviceError>) {}

        fn fatal_event(&self, _: DeviceError) {}

        fn alloc_rx_buffer(&self, capacity: usize) -> Option<BytesMut> {
            let mut left = lock(&self.buffers_left);
            match left.as_mut() {
                Some(0) => None,
                Some(n) => {
                    *n -= 1;
                    Some(BytesMut::zeroed(capacity))
                }
                None => Some(BytesMut::zeroed(capacity)),
            }
        }

        fn alloc_bundle_buffer(&self, capacity: usize) -> Option<BytesMut> {
            if *lock(&self.bundle_scratch) {
                None
            } else {
                Some(BytesMut::zeroed(capacity))
            }
        }
    }

    fn attach(config: DeviceConfig) -> (Device, Arc<Mutex<SimTarget>>, Arc<Collect>) {
        let target = SimTarget::shared(config.block_size);
        let callbacks = Arc::new(Collect::default());
        let device = Device::attach(SimBus::new(target.clone()), config, callbacks.clone())
            .expect("attach should succeed");
        (device, target, callbacks)
    }

    #[test]
    fn single_message_is_fetched_and_truncated() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        let frame = FrameBuilder::new(2).payload(&[0xAB; 100]).build().expect("frame");
        lock(&target).push_rx(0, &frame);

        let mut state = DsrState::default();
        let lookahead = Lookahead::from_slice(&frame).expect("lookahead");
        let delivered = device
            .recv_message_pending(&mut state, 0, &[lookahead])
            .expect("receive should succeed");

        assert_eq!(delivered, 1);
        let rx = lock(&callbacks.rx);
        assert_eq!(rx[0].0.len(), 108);
        assert_eq!(&rx[0].0[..], &frame[..]);
        assert_eq!(rx[0].1, 0);
        assert_eq!(state.recv_count, 1);
    }

    #[test]
    fn trailer_lookahead_chains_into_next_message() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        let second = FrameBuilder::new(3).payload(b"second").build().expect("frame");
        let first = FrameBuilder::new(2)
            .payload(b"first")
            .lookahead(LookaheadReport::fresh(
                Lookahead::from_slice(&second).expect("lookahead"),
                0x33,
            ))
            .expect("record")
            .build()
            .expect("frame");
        {
            let mut target = lock(&target);
            target.push_rx(0, &first);
            target.push_rx(0, &second);
        }

        let mut state = DsrState::default();
        let delivered = device
            .recv_message_pending(
                &mut state,
                0,
                &[Lookahead::from_slice(&first).expect("lookahead")],
            )
            .expect("receive should succeed");

        assert_eq!(delivered, 2);
        let rx = lock(&callbacks.rx);
        assert_eq!(&rx[1].0[..], &second[..]);
    }

    #[test]
    fn invalid_endpoint_in_lookahead_aborts_before_any_fetch() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        let mut state = DsrState::default();

        let err = device
            .recv_message_pending(&mut state, 0, &[Lookahead::new(0xFF, 0, 16)])
            .unwrap_err();

        assert!(matches!(
            err,
            DeviceError::Frame(FrameError::InvalidEndpoint { endpoint: 0xFF, .. })
        ));
        assert!(lock(&callbacks.rx).is_empty());
        assert_eq!(lock(&target).mailbox_reads(), 0);
        assert_eq!(device.stats().rx_aborted_passes, 1);
    }

    #[test]
    fn oversized_payload_in_lookahead_is_rejected() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());
        let mut state = DsrState::default();

        let err = device
            .recv_message_pending(&mut state, 0, &[Lookahead::new(1, 0, 5000)])
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Frame(FrameError::PayloadTooLarge { size: 5000, .. })
        ));
    }

    #[test]
    fn too_many_lookaheads_are_rejected() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());
        let mut state = DsrState::default();
        let seeds = vec![Lookahead::new(1, 0, 8); 17];

        let err = device
            .recv_message_pending(&mut state, 0, &seeds)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Frame(FrameError::TooManyLookaheads { count: 17, .. })
        ));
    }

    #[test]
    fn buffer_exhaustion_stops_without_error() {
        let (device, target, callbacks) =
            attach(DeviceConfig::default().with_bundling(false));
        *lock(&callbacks.buffers_left) = Some(1);
        let frames: Vec<BytesMut> = (0..3)
            .map(|i| {
                FrameBuilder::new(2)
                    .bundle_count(if i == 0 { 2 } else { 0 })
                    .payload(&[i; 24])
                    .build()
                    .expect("frame")
            })
            .collect();
        for frame in &frames {
            lock(&target).push_rx(0, frame);
        }

        let mut state = DsrState::default();
        let delivered = device
            .recv_message_pending(
                &mut state,
                0,
                &[Lookahead::from_slice(&frames[0]).expect("lookahead")],
            )
            .expect("running out of buffers is not an error");

        assert_eq!(delivered, 1);
        assert!(device.waiting_for_buffers());
        assert_eq!(device.stats().rx_buffer_waits, 1);
    }

    #[test]
    fn undersized_host_buffer_fails_the_pass() {
        let mut config = DeviceConfig::default().with_block_size(64);
        config.rx_buffer_size = 64;
        let (device, _target, callbacks) = attach(config);

        let mut state = DsrState::default();
        let err = device
            .recv_message_pending(&mut state, 0, &[Lookahead::new(1, 0, 100)])
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BufferTooSmall {
                needed: 128,
                capacity: 64
            }
        ));
        assert!(lock(&callbacks.rx).is_empty());
    }

    #[test]
    fn unit_with_completion_is_handed_back_when_too_large() {
        let (device, _target, _callbacks) = attach(DeviceConfig::default());
        let mut unit = ReceiveUnit::new(BytesMut::zeroed(128), Lookahead::new(1, 0, 200));
        let returned = Arc::new(Mutex::new(None));
        let slot = returned.clone();
        unit.completion = Some(Box::new(move |unit, status| {
            *lock(&slot) = Some((unit.capacity(), status.is_err()));
        }));

        let address = device.mailbox_map().mailbox_address(0).expect("mailbox 0");
        let fetched = device
            .fetch_single(address, unit)
            .expect("completion takes the failure");
        assert!(fetched.is_none());
        assert_eq!(*lock(&returned), Some((128, true)));
    }

    #[test]
    fn exhaustion_mid_burst_delivers_what_was_allocated() {
        let (device, target, callbacks) = attach(DeviceConfig::default());
        *lock(&callbacks.buffers_left) = Some(2);
        let frames: Vec<BytesMut> = (0..3)
            .map(|i| {
                FrameBuilder::new(2)
                    .bundle_count(if i == 0 { 2 } else { 0 })
                    .payload(&[i; 24])
                    .build()
                    .expect("frame")
            })
            .collect();
        for frame in &frames {
            lock(&target).push_rx(0, frame);
        }

        let mut state = DsrState::default();
        let delivered = device
            .recv_message_pending(
                &mut state,
                0,
                &[Lookahead::from_slice(&frames[0]).expect("lookahead")],
            )
            .expect("running out of buffers is not an error");

        assert_eq!(delivered, 2);
        assert!(device.waiting_for_buffers());
        assert_eq!(lock(&target).pending_rx(0), 1);
        let rx = lock(&callbacks.rx);
        assert_eq!(&rx[0].0[..], &frames[0][..]);
        assert_eq!(&rx[1].0[..], &frames[1][..]);
        assert_eq!(device.stats().rx_buffer_waits, 1);
    }

    #[test]
    fn only_the_last_single_keeps_its_lookahead() {
        let lookahead = Lookahead::new(2, 0, 16);
        let mut queue: VecDeque<ReceiveUnit> = (0..3)
            .map(|_| ReceiveUnit::new(BytesMut::zeroed(128), lookahead))
            .collect();

        let mut flags = Vec::new();
        while let Some(unit) = next_single(&mut queue) {
            flags.push(unit.flags.contains(RxFlags::IGNORE_LOOKAHEAD));
        }
        assert_eq!(flags, vec![true, true, false]);
        assert!(next_single(&mut queue).is_none());
    }
}
