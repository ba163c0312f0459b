use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use sdiohtc_device::DeviceConfig;

use crate::exit::{device_error, io_error, CliError, CliResult, DATA_INVALID};
use crate::output::OutputFormat;

pub mod config;
pub mod decode;
pub mod send;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive the receive engine against a simulated target.
    Simulate(SimulateArgs),
    /// Send one message and show the mailbox write the target saw.
    Send(SendArgs),
    /// Decode a hex-encoded HTC message.
    Decode(DecodeArgs),
    /// Print the effective device configuration as JSON.
    Config(ConfigArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: Option<&Path>) -> CliResult<i32> {
    match command {
        Command::Simulate(args) => simulate::run(args, format, load_config(config)?),
        Command::Send(args) => send::run(args, format, load_config(config)?),
        Command::Decode(args) => decode::run(args, format),
        Command::Config(args) => config::run(args, load_config(config)?),
        Command::Version(args) => version::run(args),
    }
}

/// Defaults, overridden by a JSON file when one is given.
pub fn load_config(path: Option<&Path>) -> CliResult<DeviceConfig> {
    let Some(path) = path else {
        return Ok(DeviceConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    let config: DeviceConfig = serde_json::from_str(&text).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("{} is not a valid device config: {err}", path.display()),
        )
    })?;
    config
        .validate()
        .map_err(|err| device_error("invalid device config", err))?;
    Ok(config)
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Messages per burst.
    #[arg(long, short = 'n', default_value = "4")]
    pub messages: usize,
    /// Payload bytes per message.
    #[arg(long, default_value = "64")]
    pub payload_size: usize,
    /// Endpoint the messages are addressed to.
    #[arg(long, default_value = "1")]
    pub endpoint: u8,
    /// Mailbox the target queues messages on (0 or 1).
    #[arg(long, default_value = "0")]
    pub mailbox: u8,
    /// Announce each burst as one bundle instead of chaining trailer lookaheads.
    #[arg(long)]
    pub bundle: bool,
    /// Keep injecting bursts until Ctrl-C.
    #[arg(long)]
    pub follow: bool,
    /// Delay between bursts with --follow (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub interval: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Uplink pipe to send on (odd: 1 or 3).
    #[arg(long, short = 'p', default_value = "1")]
    pub pipe: u8,
    /// Endpoint id written into the header.
    #[arg(long, short = 'e', default_value = "1")]
    pub endpoint: u8,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Request a credit update from the target.
    #[arg(long)]
    pub need_credit_update: bool,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded message, header first. Whitespace is ignored.
    pub hex: String,
    /// Largest payload accepted.
    #[arg(long, default_value_t = sdiohtc_frame::DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Print on one line.
    #[arg(long)]
    pub compact: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<std::time::Duration> {
    use std::time::Duration;

    use crate::exit::USAGE;

    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }
    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
