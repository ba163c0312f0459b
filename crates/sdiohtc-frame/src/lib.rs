//! HTC message framing for the SDIO mailbox transport.
//!
//! Every message starts with an 8-byte header:
//! - endpoint id and flags (trailer present, bundle count)
//! - a 2-byte little-endian payload length
//! - two control bytes; the first holds the trailer length
//!
//! The first four bytes double as the *lookahead* the target publishes so
//! the host can size a fetch. Trailers at the end of the payload carry
//! credit reports and the lookaheads of the messages that follow.

pub mod builder;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod netbuf;
pub mod trailer;

pub use builder::FrameBuilder;
pub use codec::{
    decode_frame, encode_frame, trailer_bounds, Frame, FrameHeader, Lookahead,
    DEFAULT_MAX_PAYLOAD, FLAG_NEED_CREDIT_UPDATE, FLAG_TRAILER_PRESENT, HEADER_SIZE,
    LOOKAHEAD_SIZE, MAX_BUNDLE_MESSAGES, MAX_MESSAGE_SIZE,
};
pub use endpoint::{endpoint_name, CONTROL, ENDPOINT_MAX};
pub use error::{FrameError, Result};
pub use netbuf::NetBuf;
pub use trailer::{
    parse_trailer, CreditReport, LookaheadReport, RecordIter, TrailerRecord, TrailerSummary,
};
