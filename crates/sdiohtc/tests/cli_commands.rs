#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::{Command, Output};

fn sdiohtc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sdiohtc"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("sdiohtc should run")
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line should be JSON"))
        .collect()
}

fn temp_file(tag: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "sdiohtc-{tag}-{}-{}.json",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::write(&path, contents).expect("temp file should be writable");
    path
}

#[test]
fn version_prints_package_version() {
    let output = sdiohtc(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("sdiohtc {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn config_reflects_file_overrides() {
    let path = temp_file("config", r#"{"block_size": 128, "bundle": {"enabled": false}}"#);
    let output = sdiohtc(&["--config", path.to_str().expect("utf8 path"), "config", "--compact"]);
    let _ = std::fs::remove_file(&path);

    assert!(output.status.success());
    let config: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("config should be JSON");
    assert_eq!(config["block_size"], 128);
    assert_eq!(config["bundle"]["enabled"], false);
    assert_eq!(config["bundle"]["max_messages"], 16);
}

#[test]
fn invalid_config_is_rejected_with_usage_code() {
    let path = temp_file("badconfig", r#"{"block_size": 100}"#);
    let output = sdiohtc(&["--config", path.to_str().expect("utf8 path"), "config"]);
    let _ = std::fs::remove_file(&path);

    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("power of two"));
}

#[test]
fn decode_reports_header_and_trailer() {
    // Endpoint 2, trailer flag, 12-byte payload: "data" then a stale lookahead record.
    let output = sdiohtc(&[
        "--format",
        "json",
        "decode",
        "02020c0008000000 64617461 0206 01 02002000 01",
    ]);
    assert!(output.status.success());
    let lines = json_lines(&output);
    assert_eq!(lines.len(), 1);
    let decoded = &lines[0];
    assert!(decoded["schema_id"]
        .as_str()
        .expect("schema_id")
        .ends_with("frame-decoded.schema.json"));
    assert_eq!(decoded["endpoint"], 2);
    assert_eq!(decoded["payload"], "data");
    assert_eq!(decoded["trailer_len"], 8);
    assert_eq!(decoded["records"][0]["kind"], "lookahead");
    assert_eq!(decoded["records"][0]["valid"], false);
}

#[test]
fn decode_rejects_bad_hex_with_data_invalid() {
    let output = sdiohtc(&["decode", "not-hex"]);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn simulate_delivers_every_message() {
    for mode in [None, Some("--bundle")] {
        let mut args = vec!["--format", "json", "simulate", "-n", "6", "--payload-size", "40"];
        args.extend(mode);
        let output = sdiohtc(&args);
        assert!(output.status.success(), "mode {mode:?}");

        let lines = json_lines(&output);
        let messages: Vec<_> = lines
            .iter()
            .filter(|line| {
                line["schema_id"]
                    .as_str()
                    .is_some_and(|id| id.ends_with("message-received.schema.json"))
            })
            .collect();
        assert_eq!(messages.len(), 6);
        assert!(messages.iter().all(|m| m["pipe"] == 0 && m["endpoint"] == 1));

        let stats = lines.last().expect("stats line");
        assert_eq!(stats["rx_messages"], 6);
        if mode.is_some() {
            assert!(stats["rx_bundles"].as_u64().expect("rx_bundles") >= 1);
        }
    }
}

#[test]
fn simulate_on_second_mailbox_uses_pipe_two() {
    let output = sdiohtc(&["--format", "json", "simulate", "-n", "2", "--mailbox", "1"]);
    assert!(output.status.success());
    let lines = json_lines(&output);
    assert_eq!(lines[0]["pipe"], 2);
}

#[test]
fn send_reports_padded_mailbox_write() {
    let output = sdiohtc(&[
        "--format", "json", "send", "--pipe", "3", "--endpoint", "2", "--data", "hello",
    ]);
    assert!(output.status.success());
    let lines = json_lines(&output);
    let write = &lines[0];
    assert_eq!(write["mailbox"], 1);
    assert_eq!(write["length"], 256);
    assert_eq!(write["header"], "0200050000000000");
}

#[test]
fn send_on_downlink_pipe_is_a_usage_error() {
    let output = sdiohtc(&["send", "--pipe", "0", "--data", "x"]);
    assert_eq!(output.status.code(), Some(64));
}
