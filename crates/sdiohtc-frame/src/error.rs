/// Errors that can occur while decoding headers and trailers.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer ends before the structure being decoded.
    #[error("truncated frame (need {needed} bytes, have {available})")]
    Truncated { needed: usize, available: usize },

    /// The endpoint id is outside the valid range.
    #[error("invalid endpoint {endpoint} (max {max})")]
    InvalidEndpoint { endpoint: u8, max: u8 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The trailer length in the control byte is inconsistent with the payload.
    #[error("invalid trailer length {trailer} for payload of {payload} bytes")]
    TrailerLength { trailer: usize, payload: usize },

    /// A trailer record claims more bytes than remain in the trailer.
    #[error("trailer record {id} declares {declared} bytes, only {remaining} remain")]
    RecordOverrun {
        id: u8,
        declared: usize,
        remaining: usize,
    },

    /// A trailer record is shorter than its report structure.
    #[error("trailer record {id} too short ({len} bytes, need {min})")]
    RecordTooShort { id: u8, len: usize, min: usize },

    /// A bundled lookahead report holds more groups than a bundle can carry.
    #[error("bundled lookahead report has {count} entries (max {max})")]
    TooManyLookaheads { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
