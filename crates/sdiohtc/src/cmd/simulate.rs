use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use sdiohtc_device::sim::{SimBus, SimTarget};
use sdiohtc_device::{Device, DeviceConfig, DeviceError, HostCallbacks};
use sdiohtc_frame::{FrameBuilder, LookaheadReport, NetBuf, HEADER_SIZE};

use crate::cmd::{parse_duration, SimulateArgs};
use crate::exit::{device_error, frame_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, USAGE};
use crate::output::{message_output, message_payload, print_message, print_stats, OutputFormat};

/// Space reserved at the end of each payload for a lookahead trailer record.
const TRAILER_ROOM: usize = 8;

/// Pre-valid marker stamped on generated lookahead reports.
const PRE_VALID: u8 = 0x5A;

/// Collects what the engine hands up.
#[derive(Default)]
struct Sink {
    received: Mutex<Vec<(u8, BytesMut)>>,
    fatal: Mutex<Option<DeviceError>>,
}

impl Sink {
    fn take_received(&self) -> Vec<(u8, BytesMut)> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn take_fatal(&self) -> Option<DeviceError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl HostCallbacks for Sink {
    fn rx_completion(&self, buffer: BytesMut, pipe: u8) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pipe, buffer));
    }

    fn tx_completion(&self, _payload: NetBuf, transfer_id: u32, status: Result<(), DeviceError>) {
        if let Err(err) = status {
            warn!(transfer_id, error = %err, "send failed");
        }
    }

    fn fatal_event(&self, status: DeviceError) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }
}

pub fn run(args: SimulateArgs, format: OutputFormat, config: DeviceConfig) -> CliResult<i32> {
    check_args(&args, &config)?;
    let interval = parse_duration(&args.interval)?;

    let target = Arc::new(Mutex::new(SimTarget::with_layout(
        config.block_size,
        &config.mailbox,
    )));
    let sink = Arc::new(Sink::default());
    let device = Device::attach(SimBus::new(target.clone()), config, sink.clone())
        .map_err(|err| device_error("attach failed", err))?;
    device
        .start()
        .map_err(|err| device_error("unmask failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    if args.follow {
        install_ctrlc_handler(running.clone())?;
    }

    let mut burst = 0u64;
    let result = loop {
        if let Err(err) = inject_burst(&target, &args, burst) {
            break Err(err);
        }
        if let Err(err) = drain(&device, &target, usize::from(args.mailbox), args.messages) {
            break Err(err);
        }
        for (pipe, message) in sink.take_received() {
            let out = message_output(burst, pipe, &message);
            print_message(&out, message_payload(&message), format);
        }
        if let Some(fatal) = sink.take_fatal() {
            break Err(CliError::new(FAILURE, format!("target reported a fatal event: {fatal}")));
        }
        burst += 1;
        if !args.follow || !sleep_while_running(&running, interval) {
            break Ok(SUCCESS);
        }
    };

    let stats = device.stats();
    device.detach();
    info!(bursts = burst, messages = stats.rx_messages, "simulation finished");
    if result.is_ok() {
        print_stats(&stats, format);
    }
    result
}

fn check_args(args: &SimulateArgs, config: &DeviceConfig) -> CliResult<()> {
    if args.messages == 0 {
        return Err(CliError::new(USAGE, "--messages must be at least 1"));
    }
    if args.mailbox > 1 {
        return Err(CliError::new(
            USAGE,
            format!("--mailbox {} is not 0 or 1", args.mailbox),
        ));
    }
    if args.endpoint >= config.endpoint_max {
        return Err(CliError::new(
            USAGE,
            format!(
                "--endpoint {} is not below {}",
                args.endpoint, config.endpoint_max
            ),
        ));
    }
    let payload = args.payload_size + TRAILER_ROOM;
    if payload > config.max_payload_len || HEADER_SIZE + payload > config.rx_buffer_size {
        return Err(CliError::new(
            USAGE,
            format!("--payload-size {} does not fit a receive buffer", args.payload_size),
        ));
    }
    Ok(())
}

/// Queue one burst of `args.messages` messages on the target.
fn inject_burst(target: &Mutex<SimTarget>, args: &SimulateArgs, burst: u64) -> CliResult<()> {
    let frames = if args.bundle {
        bundled_burst(args, burst)?
    } else {
        chained_burst(args, burst)?
    };
    let mut target = target.lock().unwrap_or_else(PoisonError::into_inner);
    for frame in &frames {
        target.push_rx(usize::from(args.mailbox), frame);
    }
    debug!(burst, frames = frames.len(), "burst queued");
    Ok(())
}

fn payload(args: &SimulateArgs, burst: u64, index: usize) -> Vec<u8> {
    let mut payload = format!("burst {burst} message {index} ").into_bytes();
    payload.resize(args.payload_size, b'.');
    payload
}

/// Each message's trailer announces the one after it.
fn chained_burst(args: &SimulateArgs, burst: u64) -> CliResult<Vec<BytesMut>> {
    let mut frames = Vec::with_capacity(args.messages);
    let mut next = None;
    for index in (0..args.messages).rev() {
        let mut builder = FrameBuilder::new(args.endpoint).payload(&payload(args, burst, index));
        if let Some(lookahead) = next {
            builder = builder
                .lookahead(LookaheadReport::fresh(lookahead, PRE_VALID))
                .map_err(|err| frame_error("building trailer failed", err))?;
        }
        next = Some(builder.peek_lookahead());
        frames.push(
            builder
                .build()
                .map_err(|err| frame_error("building message failed", err))?,
        );
    }
    frames.reverse();
    Ok(frames)
}

/// Messages grouped into bundles announced by the first header of each group.
fn bundled_burst(args: &SimulateArgs, burst: u64) -> CliResult<Vec<BytesMut>> {
    let group = sdiohtc_frame::MAX_BUNDLE_MESSAGES;
    let mut frames = Vec::with_capacity(args.messages);
    for start in (0..args.messages).step_by(group) {
        let count = group.min(args.messages - start);
        for index in start..start + count {
            let mut builder = FrameBuilder::new(args.endpoint).payload(&payload(args, burst, index));
            if index == start {
                let following = u8::try_from(count - 1)
                    .map_err(|_| CliError::new(INTERNAL, "bundle group too large"))?;
                builder = builder.bundle_count(following);
            }
            frames.push(
                builder
                    .build()
                    .map_err(|err| frame_error("building message failed", err))?,
            );
        }
    }
    Ok(frames)
}

/// Run the service routine until the target has nothing left on `mailbox`.
fn drain(
    device: &Device,
    target: &Mutex<SimTarget>,
    mailbox: usize,
    expected: usize,
) -> CliResult<()> {
    // Every invocation makes progress on a healthy target.
    let limit = expected * 2 + 4;
    for _ in 0..limit {
        let outcome = device.dsr().map_err(|err| device_error("dsr failed", err))?;
        debug!(?outcome, "dsr");
        let pending = target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_rx(mailbox);
        if pending == 0 {
            return Ok(());
        }
        if device.waiting_for_buffers() {
            warn!(pending, "receive stalled waiting for buffers");
        }
    }
    Err(CliError::new(
        FAILURE,
        format!("target still has messages queued after {limit} service calls"),
    ))
}

/// Sleep for `interval`; false once Ctrl-C was pressed.
fn sleep_while_running(running: &AtomicBool, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
    false
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sdiohtc_frame::{decode_frame, parse_trailer, DEFAULT_MAX_PAYLOAD, MAX_BUNDLE_MESSAGES};

    fn args(messages: usize, bundle: bool) -> SimulateArgs {
        SimulateArgs {
            messages,
            payload_size: 32,
            endpoint: 2,
            mailbox: 0,
            bundle,
            follow: false,
            interval: "1s".to_string(),
        }
    }

    #[test]
    fn chained_burst_links_each_message_to_the_next() {
        let frames = chained_burst(&args(3, false), 0).expect("burst");
        assert_eq!(frames.len(), 3);
        for pair in frames.windows(2) {
            let frame = decode_frame(&Bytes::copy_from_slice(&pair[0]), DEFAULT_MAX_PAYLOAD)
                .expect("frame");
            let summary = parse_trailer(&frame.trailer, MAX_BUNDLE_MESSAGES).expect("trailer");
            assert_eq!(summary.lookaheads.len(), 1);
            assert_eq!(&summary.lookaheads[0].0[..], &pair[1][..4]);
        }
        let last = decode_frame(&Bytes::copy_from_slice(&frames[2]), DEFAULT_MAX_PAYLOAD)
            .expect("frame");
        assert!(last.trailer.is_empty());
    }

    #[test]
    fn bundled_burst_splits_into_groups() {
        let frames = bundled_burst(&args(MAX_BUNDLE_MESSAGES + 2, true), 1).expect("burst");
        assert_eq!(frames.len(), MAX_BUNDLE_MESSAGES + 2);
        let first = sdiohtc_frame::FrameHeader::parse(&frames[0]).expect("header");
        assert_eq!(usize::from(first.bundle_count()), MAX_BUNDLE_MESSAGES - 1);
        let second = sdiohtc_frame::FrameHeader::parse(&frames[MAX_BUNDLE_MESSAGES]).expect("header");
        assert_eq!(second.bundle_count(), 1);
        let member = sdiohtc_frame::FrameHeader::parse(&frames[1]).expect("header");
        assert_eq!(member.bundle_count(), 0);
    }

    #[test]
    fn check_args_rejects_bad_mailbox_and_endpoint() {
        let config = DeviceConfig::default();
        let mut bad = args(1, false);
        bad.mailbox = 2;
        assert_eq!(check_args(&bad, &config).unwrap_err().code, USAGE);

        let mut bad = args(1, false);
        bad.endpoint = config.endpoint_max;
        assert_eq!(check_args(&bad, &config).unwrap_err().code, USAGE);

        let mut bad = args(1, false);
        bad.payload_size = config.rx_buffer_size;
        assert_eq!(check_args(&bad, &config).unwrap_err().code, USAGE);

        assert!(check_args(&args(4, true), &config).is_ok());
    }

    #[test]
    fn burst_drains_through_the_engine() {
        for bundle in [false, true] {
            let config = DeviceConfig::default().with_block_size(64);
            let target = SimTarget::shared(config.block_size);
            let sink = Arc::new(Sink::default());
            let device = Device::attach(SimBus::new(target.clone()), config, sink.clone())
                .expect("attach");
            device.start().expect("start");

            let args = args(5, bundle);
            inject_burst(&target, &args, 0).expect("inject");
            drain(&device, &target, 0, args.messages).expect("drain");

            let received = sink.take_received();
            assert_eq!(received.len(), 5, "bundle={bundle}");
            assert!(received.iter().all(|(pipe, _)| *pipe == 0));
            assert!(received[4].1[HEADER_SIZE..].starts_with(b"burst 0 message 4"));
            device.detach();
        }
    }

    #[test]
    fn interrupted_sleep_reports_stop() {
        let running = AtomicBool::new(false);
        assert!(!sleep_while_running(&running, Duration::from_secs(5)));
        let running = AtomicBool::new(true);
        assert!(sleep_while_running(&running, Duration::from_millis(1)));
    }
}
