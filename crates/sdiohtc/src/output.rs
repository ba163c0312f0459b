use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use sdiohtc_device::DeviceStats;
use sdiohtc_frame::{endpoint_name, FrameHeader, HEADER_SIZE};

const SCHEMA_BASE: &str = "https://schemas.3leaps.dev/sdiohtc/cli/v1";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A message the engine delivered upward.
#[derive(Debug, Clone, Serialize)]
pub struct MessageOutput {
    pub burst: u64,
    pub pipe: u8,
    pub endpoint: u8,
    pub endpoint_name: &'static str,
    /// Header plus payload.
    pub length: usize,
    pub payload: String,
}

/// The physical write a send produced.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutput {
    pub pipe: u8,
    pub mailbox: u8,
    pub address: String,
    pub length: usize,
    pub dummy: u16,
    pub header: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordOutput {
    pub id: u8,
    pub kind: &'static str,
    pub length: usize,
    /// Lookahead reports only: whether the pre/post markers agree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    pub detail: String,
}

/// A decoded message.
#[derive(Debug, Clone, Serialize)]
pub struct DecodeOutput {
    pub endpoint: u8,
    pub endpoint_name: &'static str,
    pub flags: u8,
    pub payload_len: u16,
    pub bundle_count: u8,
    pub lookahead: String,
    pub trailer_len: usize,
    pub records: Vec<RecordOutput>,
    pub payload: String,
}

#[derive(Serialize)]
struct Tagged<'a, T: Serialize> {
    schema_id: String,
    #[serde(flatten)]
    body: &'a T,
}

fn print_json<T: Serialize>(schema: &str, body: &T) {
    let out = Tagged {
        schema_id: format!("{SCHEMA_BASE}/{schema}.schema.json"),
        body,
    };
    println!(
        "{}",
        serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
    );
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_message(message: &MessageOutput, body: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("message-received", message),
        OutputFormat::Table => {
            let mut table = table(vec!["BURST", "PIPE", "ENDPOINT", "LENGTH", "PAYLOAD"]);
            table.add_row(vec![
                message.burst.to_string(),
                message.pipe.to_string(),
                format!("{} ({})", message.endpoint, message.endpoint_name),
                message.length.to_string(),
                message.payload.clone(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "burst={} pipe={} endpoint={} ({}) length={} payload={}",
                message.burst,
                message.pipe,
                message.endpoint,
                message.endpoint_name,
                message.length,
                message.payload
            );
        }
        OutputFormat::Raw => print_raw(body),
    }
}

pub fn print_stats(stats: &DeviceStats, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("device-stats", stats),
        OutputFormat::Table | OutputFormat::Pretty => {
            let rows = [
                ("rx_messages", stats.rx_messages),
                ("rx_bundles", stats.rx_bundles),
                ("rx_single_fetches", stats.rx_single_fetches),
                ("rx_aborted_passes", stats.rx_aborted_passes),
                ("rx_buffer_waits", stats.rx_buffer_waits),
                ("tx_submitted", stats.tx_submitted),
                ("tx_completed", stats.tx_completed),
                ("tx_failed", stats.tx_failed),
                ("fatal_events", stats.fatal_events),
                ("bus_executed", stats.bus.executed),
                ("bus_failed", stats.bus.failed),
                ("bus_pool_exhausted", stats.bus.pool_exhausted),
            ];
            if matches!(format, OutputFormat::Pretty) {
                let line: Vec<String> = rows.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{}", line.join(" "));
                return;
            }
            let mut table = table(vec!["COUNTER", "VALUE"]);
            for (name, value) in rows {
                table.add_row(vec![name.to_string(), value.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Raw => {}
    }
}

pub fn print_write(write: &WriteOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("mailbox-write", write),
        OutputFormat::Table => {
            let mut table = table(vec!["PIPE", "MAILBOX", "ADDRESS", "LENGTH", "DUMMY", "HEADER"]);
            table.add_row(vec![
                write.pipe.to_string(),
                write.mailbox.to_string(),
                write.address.clone(),
                write.length.to_string(),
                write.dummy.to_string(),
                write.header.clone(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "pipe={} mailbox={} address={} length={} dummy={} header={} completed={}",
                write.pipe,
                write.mailbox,
                write.address,
                write.length,
                write.dummy,
                write.header,
                write.completed
            );
        }
    }
}

pub fn print_decoded(decoded: &DecodeOutput, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("frame-decoded", decoded),
        OutputFormat::Table => {
            let mut header = table(vec!["FIELD", "VALUE"]);
            header.add_row(vec![
                "endpoint".to_string(),
                format!("{} ({})", decoded.endpoint, decoded.endpoint_name),
            ]);
            header.add_row(vec!["flags".to_string(), format!("{:#04x}", decoded.flags)]);
            header.add_row(vec!["payload_len".to_string(), decoded.payload_len.to_string()]);
            header.add_row(vec!["bundle_count".to_string(), decoded.bundle_count.to_string()]);
            header.add_row(vec!["lookahead".to_string(), decoded.lookahead.clone()]);
            header.add_row(vec!["trailer_len".to_string(), decoded.trailer_len.to_string()]);
            header.add_row(vec!["payload".to_string(), decoded.payload.clone()]);
            println!("{header}");
            if !decoded.records.is_empty() {
                let mut records = table(vec!["RECORD", "KIND", "LENGTH", "VALID", "DETAIL"]);
                for record in &decoded.records {
                    records.add_row(vec![
                        record.id.to_string(),
                        record.kind.to_string(),
                        record.length.to_string(),
                        record.valid.map_or("-".to_string(), |v| v.to_string()),
                        record.detail.clone(),
                    ]);
                }
                println!("{records}");
            }
        }
        OutputFormat::Pretty => {
            println!(
                "endpoint={} ({}) flags={:#04x} payload_len={} bundle_count={} lookahead={} trailer_len={}",
                decoded.endpoint,
                decoded.endpoint_name,
                decoded.flags,
                decoded.payload_len,
                decoded.bundle_count,
                decoded.lookahead,
                decoded.trailer_len
            );
            for record in &decoded.records {
                println!(
                    "  record id={} kind={} length={} {}",
                    record.id, record.kind, record.length, record.detail
                );
            }
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Application payload of a delivered message, without header or trailer.
pub fn message_payload(message: &[u8]) -> &[u8] {
    let trailer = FrameHeader::parse(message)
        .ok()
        .and_then(|header| header.trailer_len())
        .unwrap_or(0);
    let end = message.len().saturating_sub(trailer).max(HEADER_SIZE);
    message.get(HEADER_SIZE..end).unwrap_or(&[])
}

pub fn message_output(burst: u64, pipe: u8, message: &[u8]) -> MessageOutput {
    let endpoint = message.first().copied().unwrap_or(0);
    let body = message_payload(message);
    MessageOutput {
        burst,
        pipe,
        endpoint,
        endpoint_name: endpoint_name(endpoint),
        length: message.len(),
        payload: payload_preview(body),
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("<binary {} bytes>", payload.len()),
    }
}
