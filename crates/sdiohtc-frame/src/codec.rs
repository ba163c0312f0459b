use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: endpoint (1) + flags (1) + length (2) + control (2) + reserved (2).
pub const HEADER_SIZE: usize = 8;

/// Size of a lookahead word: the first four header bytes.
pub const LOOKAHEAD_SIZE: usize = 4;

/// Largest message the target sends, header included.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Default maximum payload size.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// The target wants a credit report back.
pub const FLAG_NEED_CREDIT_UPDATE: u8 = 0x01;

/// The last `control[0]` bytes of the payload are a trailer.
pub const FLAG_TRAILER_PRESENT: u8 = 0x02;

/// Bundle count sub-field: messages following this one in the same bundle.
pub const BUNDLE_COUNT_MASK: u8 = 0xF0;
pub const BUNDLE_COUNT_SHIFT: u8 = 4;

/// Largest bundle the header can describe.
pub const MAX_BUNDLE_MESSAGES: usize = (BUNDLE_COUNT_MASK >> BUNDLE_COUNT_SHIFT) as usize + 1;

/// The first four bytes of a pending message, as reported by the target.
///
/// Carries the endpoint, the flags and the payload length, which is enough
/// to size a fetch before reading the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Lookahead(pub [u8; LOOKAHEAD_SIZE]);

impl Lookahead {
    pub fn new(endpoint: u8, flags: u8, payload_len: u16) -> Self {
        let len = payload_len.to_le_bytes();
        Self([endpoint, flags, len[0], len[1]])
    }

    /// Build from a little-endian register word.
    pub fn from_word(word: u32) -> Self {
        Self(word.to_le_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let word: [u8; LOOKAHEAD_SIZE] = bytes
            .get(..LOOKAHEAD_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(FrameError::Truncated {
                needed: LOOKAHEAD_SIZE,
                available: bytes.len(),
            })?;
        Ok(Self(word))
    }

    pub fn word(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn endpoint(self) -> u8 {
        self.0[0]
    }

    pub fn flags(self) -> u8 {
        self.0[1]
    }

    pub fn payload_len(self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    /// Header plus payload.
    pub fn full_length(self) -> usize {
        HEADER_SIZE + usize::from(self.payload_len())
    }

    pub fn bundle_count(self) -> u8 {
        (self.flags() & BUNDLE_COUNT_MASK) >> BUNDLE_COUNT_SHIFT
    }

    /// Messages announced by this lookahead: itself plus the bundle count.
    pub fn message_count(self) -> usize {
        usize::from(self.bundle_count()) + 1
    }

    pub fn is_zero(self) -> bool {
        self.0 == [0; LOOKAHEAD_SIZE]
    }
}

impl std::fmt::Display for Lookahead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.word())
    }
}

/// Wire header of one HTC message.
///
/// ```text
/// ┌──────────┬───────┬──────────────┬───────────┬───────────┬──────────┐
/// │ Endpoint │ Flags │ Payload len  │ Control 0 │ Control 1 │ Reserved │
/// │ (1B)     │ (1B)  │ (2B LE)      │ (1B)      │ (1B)      │ (2B)     │
/// └──────────┴───────┴──────────────┴───────────┴───────────┴──────────┘
/// ```
///
/// Control byte 0 holds the trailer length when the trailer flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub endpoint: u8,
    pub flags: u8,
    pub payload_len: u16,
    pub control: [u8; 2],
}

impl FrameHeader {
    pub fn new(endpoint: u8, payload_len: u16) -> Self {
        Self {
            endpoint,
            payload_len,
            ..Self::default()
        }
    }

    /// Decode the header at the start of `src`.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: src.len(),
            });
        }
        Ok(Self {
            endpoint: src[0],
            flags: src[1],
            payload_len: u16::from_le_bytes([src[2], src[3]]),
            control: [src[4], src[5]],
        })
    }

    /// Append the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.endpoint);
        dst.put_u8(self.flags);
        dst.put_u16_le(self.payload_len);
        dst.put_slice(&self.control);
        dst.put_u16_le(0);
    }

    /// Write the encoded header into the first [`HEADER_SIZE`] bytes of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) -> Result<()> {
        let available = dst.len();
        let slot = dst.get_mut(..HEADER_SIZE).ok_or(FrameError::Truncated {
            needed: HEADER_SIZE,
            available,
        })?;
        let len = self.payload_len.to_le_bytes();
        slot.copy_from_slice(&[
            self.endpoint,
            self.flags,
            len[0],
            len[1],
            self.control[0],
            self.control[1],
            0,
            0,
        ]);
        Ok(())
    }

    pub fn lookahead(&self) -> Lookahead {
        Lookahead::new(self.endpoint, self.flags, self.payload_len)
    }

    pub fn has_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER_PRESENT != 0
    }

    /// Trailer length, if the trailer flag is set.
    pub fn trailer_len(&self) -> Option<usize> {
        self.has_trailer().then_some(usize::from(self.control[0]))
    }

    pub fn bundle_count(&self) -> u8 {
        (self.flags & BUNDLE_COUNT_MASK) >> BUNDLE_COUNT_SHIFT
    }

    /// Header plus payload.
    pub fn full_length(&self) -> usize {
        HEADER_SIZE + usize::from(self.payload_len)
    }
}

impl From<Lookahead> for FrameHeader {
    /// The control bytes are not part of a lookahead and come back zeroed.
    fn from(lookahead: Lookahead) -> Self {
        Self {
            endpoint: lookahead.endpoint(),
            flags: lookahead.flags(),
            payload_len: lookahead.payload_len(),
            control: [0; 2],
        }
    }
}

/// A decoded message: header, application payload and raw trailer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    /// Payload without the trailer.
    pub payload: Bytes,
    /// Trailer records, empty when the trailer flag is clear.
    pub trailer: Bytes,
}

impl Frame {
    pub fn endpoint(&self) -> u8 {
        self.header.endpoint
    }

    /// The total wire size of this frame (header + payload + trailer).
    pub fn wire_size(&self) -> usize {
        self.header.full_length()
    }
}

/// Encode a message into the wire format.
///
/// The trailer is appended to the payload and its length recorded in the
/// first control byte.
pub fn encode_frame(
    endpoint: u8,
    flags: u8,
    payload: &[u8],
    trailer: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let total = payload.len() + trailer.len();
    if total > usize::from(u16::MAX) {
        return Err(FrameError::PayloadTooLarge {
            size: total,
            max: usize::from(u16::MAX),
        });
    }
    let trailer_len = u8::try_from(trailer.len()).map_err(|_| FrameError::TrailerLength {
        trailer: trailer.len(),
        payload: total,
    })?;

    let mut header = FrameHeader::new(endpoint, total as u16);
    header.flags = flags & !FLAG_TRAILER_PRESENT;
    if !trailer.is_empty() {
        header.flags |= FLAG_TRAILER_PRESENT;
        header.control[0] = trailer_len;
    }

    dst.reserve(HEADER_SIZE + total);
    header.encode(dst);
    dst.put_slice(payload);
    dst.put_slice(trailer);
    Ok(())
}

/// Decode one complete message from `src`.
///
/// `src` may be longer than the message (block padding); the extra bytes
/// are ignored.
pub fn decode_frame(src: &Bytes, max_payload: usize) -> Result<Frame> {
    let header = FrameHeader::parse(src)?;
    let payload_len = usize::from(header.payload_len);
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: src.len(),
        });
    }

    let trailer_len = trailer_bounds(&header)?;
    let body = src.slice(HEADER_SIZE..total);
    let split = payload_len - trailer_len;
    Ok(Frame {
        header,
        payload: body.slice(..split),
        trailer: body.slice(split..),
    })
}

/// Validated trailer length of `header` (zero when there is no trailer).
pub fn trailer_bounds(header: &FrameHeader) -> Result<usize> {
    let Some(trailer_len) = header.trailer_len() else {
        return Ok(0);
    };
    let payload = usize::from(header.payload_len);
    if trailer_len < crate::trailer::RECORD_HEADER_SIZE || trailer_len > payload {
        return Err(FrameError::TrailerLength {
            trailer: trailer_len,
            payload,
        });
    }
    Ok(trailer_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_through_lookahead() {
        let mut header = FrameHeader::new(3, 0x0180);
        header.flags = 0x20 | FLAG_NEED_CREDIT_UPDATE;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let parsed = FrameHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);

        let lookahead = Lookahead::from_slice(&buf).unwrap();
        assert_eq!(lookahead, header.lookahead());
        assert_eq!(lookahead.endpoint(), 3);
        assert_eq!(lookahead.payload_len(), 0x0180);
        assert_eq!(lookahead.bundle_count(), 2);
        assert_eq!(lookahead.message_count(), 3);
        assert_eq!(lookahead.full_length(), 0x0188);
    }

    #[test]
    fn lookahead_word_is_little_endian() {
        let lookahead = Lookahead::new(1, 0x02, 0x0100);
        assert_eq!(lookahead.word(), 0x0100_0201);
        assert_eq!(Lookahead::from_word(0x0100_0201), lookahead);
        assert_eq!(lookahead.to_string(), "0x01000201");
    }

    #[test]
    fn write_to_matches_encode() {
        let mut header = FrameHeader::new(9, 77);
        header.control = [6, 1];
        let mut encoded = BytesMut::new();
        header.encode(&mut encoded);

        let mut raw = [0xAAu8; 10];
        header.write_to(&mut raw).unwrap();
        assert_eq!(&raw[..HEADER_SIZE], &encoded[..]);
        assert_eq!(raw[8..], [0xAA, 0xAA]);

        let mut short = [0u8; 4];
        assert!(header.write_to(&mut short).is_err());
    }

    #[test]
    fn encode_decode_roundtrip_with_trailer() {
        let trailer = [0x02, 0x06, 0x55, 1, 0, 0x10, 0, 0xAA];
        let mut buf = BytesMut::new();
        encode_frame(4, 0, b"hello", &trailer, &mut buf).unwrap();
        buf.resize(256, 0);

        let frame = decode_frame(&buf.freeze(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.endpoint(), 4);
        assert!(frame.header.has_trailer());
        assert_eq!(frame.header.payload_len as usize, 5 + trailer.len());
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(frame.trailer.as_ref(), &trailer);
        assert_eq!(frame.wire_size(), HEADER_SIZE + 13);
    }

    #[test]
    fn decode_without_trailer_keeps_whole_payload() {
        let mut buf = BytesMut::new();
        encode_frame(1, FLAG_TRAILER_PRESENT, b"abc", &[], &mut buf).unwrap();
        let frame = decode_frame(&buf.freeze(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(!frame.header.has_trailer());
        assert_eq!(frame.payload.as_ref(), b"abc");
        assert!(frame.trailer.is_empty());
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let header = FrameHeader::new(1, 5000);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let err = decode_frame(&buf.freeze(), DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 5000, .. }));
    }

    #[test]
    fn decode_rejects_truncated_message() {
        let mut buf = BytesMut::new();
        encode_frame(1, 0, &[0u8; 32], &[], &mut buf).unwrap();
        buf.truncate(20);
        let err = decode_frame(&buf.freeze(), DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { needed: 40, available: 20 }));
    }

    #[test]
    fn trailer_length_must_fit_payload_and_hold_a_record() {
        let mut header = FrameHeader::new(1, 4);
        header.flags = FLAG_TRAILER_PRESENT;
        header.control[0] = 1;
        assert!(matches!(
            trailer_bounds(&header),
            Err(FrameError::TrailerLength { trailer: 1, payload: 4 })
        ));
        header.control[0] = 5;
        assert!(trailer_bounds(&header).is_err());
        header.control[0] = 4;
        assert_eq!(trailer_bounds(&header).unwrap(), 4);
    }
}
