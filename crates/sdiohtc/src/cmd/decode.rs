use bytes::Bytes;

use sdiohtc_frame::trailer::{
    CreditReport, LookaheadReport, TrailerRecord, CREDIT_REPORT_SIZE, RECORD_CREDITS,
    RECORD_LOOKAHEAD, RECORD_LOOKAHEAD_BUNDLE, RECORD_NULL,
};
use sdiohtc_frame::{
    decode_frame, endpoint_name, parse_trailer, Frame, Lookahead, RecordIter, LOOKAHEAD_SIZE,
    MAX_BUNDLE_MESSAGES,
};

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{payload_preview, print_decoded, DecodeOutput, OutputFormat, RecordOutput};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let raw = parse_hex(&args.hex)?;
    let frame = decode_frame(&raw, args.max_payload)
        .map_err(|err| frame_error("decode failed", err))?;
    let decoded = describe(&frame)?;
    print_decoded(&decoded, &frame.payload, format);
    Ok(SUCCESS)
}

fn parse_hex(input: &str) -> CliResult<Bytes> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.strip_prefix("0x").unwrap_or(&compact);
    hex::decode(compact)
        .map(Bytes::from)
        .map_err(|err| CliError::new(DATA_INVALID, format!("input is not valid hex: {err}")))
}

fn describe(frame: &Frame) -> CliResult<DecodeOutput> {
    let mut records = Vec::new();
    for record in RecordIter::new(&frame.trailer) {
        let record = record.map_err(|err| frame_error("bad trailer record", err))?;
        records.push(describe_record(record));
    }
    // Same checks the receive path applies.
    parse_trailer(&frame.trailer, MAX_BUNDLE_MESSAGES)
        .map_err(|err| frame_error("trailer rejected", err))?;

    let header = frame.header;
    Ok(DecodeOutput {
        endpoint: header.endpoint,
        endpoint_name: endpoint_name(header.endpoint),
        flags: header.flags,
        payload_len: header.payload_len,
        bundle_count: header.bundle_count(),
        lookahead: header.lookahead().to_string(),
        trailer_len: frame.trailer.len(),
        records,
        payload: payload_preview(&frame.payload),
    })
}

fn describe_record(record: TrailerRecord<'_>) -> RecordOutput {
    let (kind, valid, detail) = match record.id {
        RECORD_NULL => ("null", None, String::new()),
        RECORD_CREDITS => {
            let grants: Vec<String> = record
                .payload
                .chunks_exact(CREDIT_REPORT_SIZE)
                .map(|c| CreditReport {
                    endpoint: c[0],
                    credits: c[1],
                })
                .map(|r| format!("ep{}+{}", r.endpoint, r.credits))
                .collect();
            ("credits", None, grants.join(" "))
        }
        RECORD_LOOKAHEAD => match LookaheadReport::parse(record.payload) {
            Ok(report) => (
                "lookahead",
                Some(report.is_valid()),
                report.lookahead.to_string(),
            ),
            Err(err) => ("lookahead", Some(false), err.to_string()),
        },
        RECORD_LOOKAHEAD_BUNDLE => {
            let groups: Vec<String> = record
                .payload
                .chunks_exact(LOOKAHEAD_SIZE)
                .filter_map(|chunk| Lookahead::from_slice(chunk).ok())
                .map(|lookahead| lookahead.to_string())
                .collect();
            ("lookahead-bundle", None, groups.join(" "))
        }
        _ => ("unknown", None, hex::encode(record.payload)),
    };
    RecordOutput {
        id: record.id,
        kind,
        length: record.payload.len(),
        valid,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdiohtc_frame::{CreditReport, FrameBuilder, DEFAULT_MAX_PAYLOAD};

    fn decode_hex(text: &str) -> CliResult<DecodeOutput> {
        let raw = parse_hex(text)?;
        let frame = decode_frame(&raw, DEFAULT_MAX_PAYLOAD)
            .map_err(|err| frame_error("decode failed", err))?;
        describe(&frame)
    }

    #[test]
    fn plain_message_decodes() {
        let out = decode_hex("01 00 02 00 00 00 00 00 6869").expect("decode");
        assert_eq!(out.endpoint, 1);
        assert_eq!(out.payload_len, 2);
        assert_eq!(out.payload, "hi");
        assert_eq!(out.lookahead, "0x00020001");
        assert!(out.records.is_empty());
    }

    #[test]
    fn trailer_records_are_listed() {
        let next = Lookahead::new(2, 0, 32);
        let bytes = FrameBuilder::new(2)
            .payload(b"data")
            .credits(&[CreditReport {
                endpoint: 2,
                credits: 3,
            }])
            .expect("credits")
            .lookahead(LookaheadReport {
                pre_valid: 1,
                lookahead: next,
                post_valid: 1,
            })
            .expect("lookahead")
            .build()
            .expect("build");

        let out = decode_hex(&hex::encode(&bytes)).expect("decode");
        assert_eq!(out.payload, "data");
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].kind, "credits");
        assert_eq!(out.records[0].detail, "ep2+3");
        assert_eq!(out.records[1].kind, "lookahead");
        assert_eq!(out.records[1].valid, Some(false));
        assert_eq!(out.records[1].detail, next.to_string());
    }

    #[test]
    fn bad_hex_is_invalid_data() {
        assert_eq!(parse_hex("zz").unwrap_err().code, DATA_INVALID);
        assert_eq!(parse_hex("0x0102").expect("prefix").as_ref(), &[1, 2]);
    }

    #[test]
    fn truncated_message_is_invalid_data() {
        let err = decode_hex("01000a00").unwrap_err();
        assert_eq!(err.code, DATA_INVALID);
    }
}
