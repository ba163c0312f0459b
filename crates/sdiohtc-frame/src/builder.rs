//! Builder for target-side messages.
//!
//! The host never appends trailers, but simulators, tools and tests need to
//! produce exactly what a target would put in a mailbox.

use bytes::{BufMut, BytesMut};

use crate::codec::{
    encode_frame, Lookahead, BUNDLE_COUNT_MASK, BUNDLE_COUNT_SHIFT, FLAG_NEED_CREDIT_UPDATE,
    MAX_BUNDLE_MESSAGES,
};
use crate::error::{FrameError, Result};
use crate::trailer::{
    CreditReport, LookaheadReport, RECORD_CREDITS, RECORD_HEADER_SIZE, RECORD_LOOKAHEAD,
    RECORD_LOOKAHEAD_BUNDLE,
};

/// Builds one HTC message with optional trailer records.
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder {
    endpoint: u8,
    flags: u8,
    payload: BytesMut,
    trailer: BytesMut,
}

impl FrameBuilder {
    pub fn new(endpoint: u8) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload.put_slice(payload);
        self
    }

    /// Announce `following` more messages in the same bundle.
    pub fn bundle_count(mut self, following: u8) -> Self {
        self.flags = (self.flags & !BUNDLE_COUNT_MASK) | ((following << BUNDLE_COUNT_SHIFT) & BUNDLE_COUNT_MASK);
        self
    }

    pub fn need_credit_update(mut self) -> Self {
        self.flags |= FLAG_NEED_CREDIT_UPDATE;
        self
    }

    /// Append a raw record.
    pub fn record(mut self, id: u8, payload: &[u8]) -> Result<Self> {
        let len = u8::try_from(payload.len()).map_err(|_| FrameError::RecordOverrun {
            id,
            declared: payload.len(),
            remaining: usize::from(u8::MAX),
        })?;
        self.trailer.reserve(RECORD_HEADER_SIZE + payload.len());
        self.trailer.put_u8(id);
        self.trailer.put_u8(len);
        self.trailer.put_slice(payload);
        Ok(self)
    }

    pub fn credits(self, reports: &[CreditReport]) -> Result<Self> {
        let payload: Vec<u8> = reports
            .iter()
            .flat_map(|r| [r.endpoint, r.credits])
            .collect();
        self.record(RECORD_CREDITS, &payload)
    }

    pub fn lookahead(self, report: LookaheadReport) -> Result<Self> {
        self.record(RECORD_LOOKAHEAD, &report.to_bytes())
    }

    pub fn bundled_lookaheads(self, lookaheads: &[Lookahead]) -> Result<Self> {
        if lookaheads.len() > MAX_BUNDLE_MESSAGES {
            return Err(FrameError::TooManyLookaheads {
                count: lookaheads.len(),
                max: MAX_BUNDLE_MESSAGES,
            });
        }
        let payload: Vec<u8> = lookaheads.iter().flat_map(|l| l.0).collect();
        self.record(RECORD_LOOKAHEAD_BUNDLE, &payload)
    }

    /// Lookahead a host would see for the built message.
    pub fn peek_lookahead(&self) -> Lookahead {
        let mut flags = self.flags;
        if !self.trailer.is_empty() {
            flags |= crate::codec::FLAG_TRAILER_PRESENT;
        }
        let len = (self.payload.len() + self.trailer.len()) as u16;
        Lookahead::new(self.endpoint, flags, len)
    }

    pub fn build(self) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        encode_frame(self.endpoint, self.flags, &self.payload, &self.trailer, &mut out)?;
        Ok(out)
    }
}
