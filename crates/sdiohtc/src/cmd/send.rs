use std::fs;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use sdiohtc_device::sim::{SimBus, SimTarget, SimWrite};
use sdiohtc_device::{Device, DeviceConfig, DeviceError, HostCallbacks, Outbound};
use sdiohtc_frame::{NetBuf, FLAG_NEED_CREDIT_UPDATE, HEADER_SIZE};

use crate::cmd::SendArgs;
use crate::exit::{device_error, send_error, CliError, CliResult, INTERNAL, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_write, OutputFormat, WriteOutput};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSFER_ID: u32 = 1;

/// Forwards send completions to the waiting command.
struct TxWaiter {
    done: Mutex<Sender<(u32, Result<(), DeviceError>)>>,
}

impl HostCallbacks for TxWaiter {
    fn rx_completion(&self, buffer: BytesMut, pipe: u8) {
        debug!(pipe, len = buffer.len(), "unexpected receive ignored");
    }

    fn tx_completion(&self, _payload: NetBuf, transfer_id: u32, status: Result<(), DeviceError>) {
        let _ = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send((transfer_id, status));
    }

    fn fatal_event(&self, status: DeviceError) {
        debug!(error = %status, "fatal event during send");
    }
}

pub fn run(args: SendArgs, format: OutputFormat, config: DeviceConfig) -> CliResult<i32> {
    let data = resolve_payload(&args)?;

    let target = Arc::new(Mutex::new(SimTarget::with_layout(
        config.block_size,
        &config.mailbox,
    )));
    let (done, completions) = mpsc::channel();
    let callbacks = Arc::new(TxWaiter {
        done: Mutex::new(done),
    });
    let device = Device::attach(SimBus::new(target.clone()), config, callbacks)
        .map_err(|err| device_error("attach failed", err))?;

    let mut message = Outbound::new(
        args.pipe,
        args.endpoint,
        NetBuf::with_headroom(HEADER_SIZE, &data),
    )
    .with_transfer_id(TRANSFER_ID);
    if args.need_credit_update {
        message.flags |= FLAG_NEED_CREDIT_UPDATE;
    }

    let result = device
        .send(message)
        .map_err(|err| send_error("send failed", err))
        .and_then(|()| wait_for_completion(&completions, COMPLETION_TIMEOUT));
    device.detach();
    result?;

    let write = target
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .mailbox_writes()
        .last()
        .cloned()
        .ok_or_else(|| CliError::new(INTERNAL, "target saw no mailbox write"))?;
    print_write(&write_output(args.pipe, &write), format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

fn wait_for_completion(
    completions: &Receiver<(u32, Result<(), DeviceError>)>,
    timeout: Duration,
) -> CliResult<()> {
    match completions.recv_timeout(timeout) {
        Ok((TRANSFER_ID, Ok(()))) => Ok(()),
        Ok((TRANSFER_ID, Err(err))) => Err(device_error("transfer failed", err)),
        Ok((id, _)) => Err(CliError::new(
            INTERNAL,
            format!("completion for unknown transfer {id}"),
        )),
        Err(RecvTimeoutError::Timeout) => Err(CliError::new(
            TRANSPORT_ERROR,
            format!("no completion within {}ms", timeout.as_millis()),
        )),
        Err(RecvTimeoutError::Disconnected) => {
            Err(CliError::new(INTERNAL, "completion channel closed"))
        }
    }
}

fn write_output(pipe: u8, write: &SimWrite) -> WriteOutput {
    let header = write.data.get(..HEADER_SIZE).unwrap_or(&write.data);
    WriteOutput {
        pipe,
        mailbox: write.mailbox,
        address: format!("{:#x}", write.address),
        length: write.length,
        dummy: write.dummy,
        header: hex::encode(header),
        completed: true,
    }
}
