use std::fmt;
use std::io;

use sdiohtc_bus::BusError;
use sdiohtc_device::{DeviceError, SendError};
use sdiohtc_frame::FrameError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => USAGE,
        io::ErrorKind::InvalidData => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn bus_error(context: &str, err: BusError) -> CliError {
    let code = match err {
        BusError::Transfer { .. } | BusError::PoolExhausted { .. } | BusError::Shutdown => {
            TRANSPORT_ERROR
        }
        BusError::WindowOverflow { .. } => DATA_INVALID,
        BusError::InvalidRequest(_) | BusError::InvalidAddress(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn device_error(context: &str, err: DeviceError) -> CliError {
    match err {
        DeviceError::Bus(err) => bus_error(context, err),
        DeviceError::Frame(err) => frame_error(context, err),
        DeviceError::InvalidPipe(_)
        | DeviceError::InvalidMailbox(_)
        | DeviceError::InvalidArgument(_)
        | DeviceError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        DeviceError::TargetFailure => CliError::new(FAILURE, format!("{context}: {err}")),
        other if other.is_protocol_violation() => {
            CliError::new(DATA_INVALID, format!("{context}: {other}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn send_error(context: &str, err: SendError) -> CliError {
    device_error(context, err.error)
}
