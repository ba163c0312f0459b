use tracing::{error, trace};

use sdiohtc_frame::{
    parse_trailer, trailer_bounds, FrameError, FrameHeader, Lookahead, HEADER_SIZE,
};

use crate::error::{DeviceError, Result};
use crate::unit::{ReceiveUnit, RxFlags};

/// Check a fetched unit against what announced it and collect the
/// lookaheads its trailer carries for the next pass.
///
/// Returns no lookaheads when the unit was flagged
/// [`IGNORE_LOOKAHEAD`](RxFlags::IGNORE_LOOKAHEAD).
pub(crate) fn validate_unit(
    unit: &mut ReceiveUnit,
    block_size: usize,
    endpoint_max: u8,
    max_bundle: usize,
) -> Result<Vec<Lookahead>> {
    let result = check_unit(unit, block_size, endpoint_max, max_bundle);
    if let Err(err) = &result {
        let shown = unit.actual_length.min(unit.buffer.len()).min(64);
        error!(
            error = %err,
            endpoint = unit.endpoint,
            flags = ?unit.flags,
            head = ?&unit.buffer[..shown],
            "bad receive unit"
        );
    }
    result
}

fn check_unit(
    unit: &mut ReceiveUnit,
    block_size: usize,
    endpoint_max: u8,
    max_bundle: usize,
) -> Result<Vec<Lookahead>> {
    let header = FrameHeader::parse(&unit.buffer)?;
    let actual = Lookahead::from_slice(&unit.buffer)?;

    if unit.flags.contains(RxFlags::REFRESH_HEADER) {
        unit.expected = Some(actual);
        unit.actual_length = header.full_length();
        let needed = sdiohtc_bus::padded_length(unit.actual_length, block_size);
        if needed > unit.capacity() {
            let capacity = unit.capacity();
            unit.actual_length = unit.actual_length.min(capacity);
            return Err(DeviceError::BufferTooSmall { needed, capacity });
        }
        if header.endpoint != unit.endpoint {
            return Err(DeviceError::EndpointMismatch {
                expected: unit.endpoint,
                actual: header.endpoint,
            });
        }
    }

    if header.endpoint >= endpoint_max {
        return Err(FrameError::InvalidEndpoint {
            endpoint: header.endpoint,
            max: endpoint_max,
        }
        .into());
    }

    if let Some(expected) = unit.expected {
        if expected != actual {
            return Err(DeviceError::LookaheadMismatch { expected, actual });
        }
    }

    let trailer_len = trailer_bounds(&header)?;
    if trailer_len == 0 {
        return Ok(Vec::new());
    }

    let end = HEADER_SIZE + usize::from(header.payload_len);
    let trailer = unit
        .buffer
        .get(end - trailer_len..end)
        .ok_or(FrameError::Truncated {
            needed: end,
            available: unit.buffer.len(),
        })?;
    let summary = parse_trailer(trailer, max_bundle)?;
    trace!(
        endpoint = header.endpoint,
        lookaheads = summary.lookaheads.len(),
        credits = summary.credits.len(),
        "trailer processed"
    );

    if unit.flags.contains(RxFlags::IGNORE_LOOKAHEAD) {
        return Ok(Vec::new());
    }
    Ok(summary.lookaheads)
}
