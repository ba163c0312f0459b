//! Trailer records carried at the end of a message payload.
//!
//! A trailer is a sequence of `{id: u8, len: u8, payload: [u8; len]}`
//! records. Credit reports belong to the flow-control layer above; lookahead
//! reports seed the next receive pass.

use tracing::{debug, trace};

use crate::codec::{Lookahead, LOOKAHEAD_SIZE};
use crate::error::{FrameError, Result};

/// Record header: id (1) + length (1).
pub const RECORD_HEADER_SIZE: usize = 2;

pub const RECORD_NULL: u8 = 0;
pub const RECORD_CREDITS: u8 = 1;
pub const RECORD_LOOKAHEAD: u8 = 2;
pub const RECORD_LOOKAHEAD_BUNDLE: u8 = 3;

/// Lookahead report: pre_valid (1) + lookahead (4) + post_valid (1).
pub const LOOKAHEAD_REPORT_SIZE: usize = 6;

/// One credit report entry: endpoint (1) + credits (1).
pub const CREDIT_REPORT_SIZE: usize = 2;

/// One trailer record, borrowed from the message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerRecord<'a> {
    pub id: u8,
    pub payload: &'a [u8],
}

/// Iterator over the records of a trailer.
///
/// Yields an error and stops when a record header or body runs past the end
/// of the trailer.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(trailer: &'a [u8]) -> Self {
        Self {
            buf: trailer,
            failed: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<TrailerRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < RECORD_HEADER_SIZE {
            self.failed = true;
            return Some(Err(FrameError::Truncated {
                needed: RECORD_HEADER_SIZE,
                available: self.buf.len(),
            }));
        }
        let id = self.buf[0];
        let declared = usize::from(self.buf[1]);
        let rest = &self.buf[RECORD_HEADER_SIZE..];
        if declared > rest.len() {
            self.failed = true;
            return Some(Err(FrameError::RecordOverrun {
                id,
                declared,
                remaining: rest.len(),
            }));
        }
        let (payload, tail) = rest.split_at(declared);
        self.buf = tail;
        Some(Ok(TrailerRecord { id, payload }))
    }
}

/// A single lookahead report with its freshness markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookaheadReport {
    pub pre_valid: u8,
    pub lookahead: Lookahead,
    pub post_valid: u8,
}

impl LookaheadReport {
    /// A report the target would consider fresh.
    pub fn fresh(lookahead: Lookahead, pre_valid: u8) -> Self {
        Self {
            pre_valid,
            lookahead,
            post_valid: !pre_valid,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < LOOKAHEAD_REPORT_SIZE {
            return Err(FrameError::RecordTooShort {
                id: RECORD_LOOKAHEAD,
                len: payload.len(),
                min: LOOKAHEAD_REPORT_SIZE,
            });
        }
        Ok(Self {
            pre_valid: payload[0],
            lookahead: Lookahead::from_slice(&payload[1..1 + LOOKAHEAD_SIZE])?,
            post_valid: payload[1 + LOOKAHEAD_SIZE],
        })
    }

    /// The target writes `post_valid` last as the complement of `pre_valid`.
    pub fn is_valid(&self) -> bool {
        self.pre_valid == !self.post_valid
    }

    pub fn to_bytes(&self) -> [u8; LOOKAHEAD_REPORT_SIZE] {
        let la = self.lookahead.0;
        [self.pre_valid, la[0], la[1], la[2], la[3], self.post_valid]
    }
}

/// Decode a bundled lookahead report into its lookahead groups.
pub fn parse_bundled_lookaheads(payload: &[u8], max: usize) -> Result<Vec<Lookahead>> {
    let count = payload.len() / LOOKAHEAD_SIZE;
    if count > max {
        return Err(FrameError::TooManyLookaheads { count, max });
    }
    payload
        .chunks_exact(LOOKAHEAD_SIZE)
        .map(Lookahead::from_slice)
        .collect()
}

/// Credit grant reported for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditReport {
    pub endpoint: u8,
    pub credits: u8,
}

/// What a trailer told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailerSummary {
    /// Lookaheads of the messages that follow; empty when none were fresh.
    pub lookaheads: Vec<Lookahead>,
    /// Credit reports, left for the flow-control layer.
    pub credits: Vec<CreditReport>,
    /// Records skipped because their id is unknown.
    pub unknown_records: usize,
}

/// Parse every record of `trailer`.
///
/// `max_bundle` bounds the number of groups in a bundled lookahead report.
/// A later lookahead record replaces an earlier one.
pub fn parse_trailer(trailer: &[u8], max_bundle: usize) -> Result<TrailerSummary> {
    let mut summary = TrailerSummary::default();
    for record in RecordIter::new(trailer) {
        let record = record?;
        match record.id {
            RECORD_NULL => {}
            RECORD_CREDITS => {
                summary.credits.extend(
                    record
                        .payload
                        .chunks_exact(CREDIT_REPORT_SIZE)
                        .map(|c| CreditReport {
                            endpoint: c[0],
                            credits: c[1],
                        }),
                );
            }
            RECORD_LOOKAHEAD => {
                let report = LookaheadReport::parse(record.payload)?;
                if report.is_valid() {
                    trace!(lookahead = %report.lookahead, "lookahead report");
                    summary.lookaheads = vec![report.lookahead];
                } else {
                    debug!(
                        pre_valid = report.pre_valid,
                        post_valid = report.post_valid,
                        "stale lookahead report ignored"
                    );
                }
            }
            RECORD_LOOKAHEAD_BUNDLE => {
                summary.lookaheads = parse_bundled_lookaheads(record.payload, max_bundle)?;
                trace!(count = summary.lookaheads.len(), "bundled lookahead report");
            }
            id => {
                debug!(id, len = record.payload.len(), "skipping unknown trailer record");
                summary.unknown_records += 1;
            }
        }
    }
    Ok(summary)
}
