use bytes::BytesMut;

/// An owned buffer with reserved room around the data.
///
/// Lower layers prepend their headers into the headroom, and pad into the
/// tail room, instead of copying the payload. The region can be split off for a transfer and rejoined
/// afterwards without moving the data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetBuf {
    buf: BytesMut,
    head: usize,
}

impl NetBuf {
    /// A buffer with `headroom` free bytes before `data` and `tailroom` after.
    pub fn with_room(headroom: usize, data: &[u8], tailroom: usize) -> Self {
        let mut buf = BytesMut::with_capacity(headroom + data.len() + tailroom);
        buf.resize(headroom, 0);
        buf.extend_from_slice(data);
        Self {
            buf,
            head: headroom,
        }
    }

    pub fn with_headroom(headroom: usize, data: &[u8]) -> Self {
        Self::with_room(headroom, data, 0)
    }

    /// A buffer with no headroom.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::with_room(0, data, 0)
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Claim `n` bytes of headroom as the new start of the data.
    ///
    /// Returns `None` when the headroom is too small.
    pub fn push_head(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.head {
            return None;
        }
        self.head -= n;
        Some(&mut self.buf[self.head..self.head + n])
    }

    /// Give the first `n` data bytes back to the headroom.
    pub fn pull_head(&mut self, n: usize) -> Option<()> {
        if n > self.len() {
            return None;
        }
        self.head += n;
        Some(())
    }

    /// Claim `n` bytes of tailroom at the end of the data.
    pub fn push_tail(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.tailroom() {
            return None;
        }
        let end = self.buf.len();
        self.buf.resize(end + n, 0);
        Some(&mut self.buf[end..])
    }

    /// Drop the last `n` data bytes.
    pub fn trim_tail(&mut self, n: usize) -> Option<()> {
        if n > self.len() {
            return None;
        }
        self.buf.truncate(self.buf.len() - n);
        Some(())
    }

    /// Split into `(headroom, data)` so the data can be handed out alone.
    pub fn split_region(mut self) -> (BytesMut, BytesMut) {
        let front = self.buf.split_to(self.head);
        (front, self.buf)
    }

    /// Undo [`split_region`](Self::split_region).
    pub fn rejoin(mut front: BytesMut, data: BytesMut) -> Self {
        let head = front.len();
        front.unsplit(data);
        Self { buf: front, head }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_head_uses_headroom_in_place() {
        let mut buf = NetBuf::with_headroom(8, b"payload");
        assert_eq!(buf.headroom(), 8);

        let header = buf.push_head(8).expect("headroom should fit the header");
        header.copy_from_slice(b"HDRHDRHD");
        assert_eq!(buf.headroom(), 0);
        assert_eq!(buf.as_slice(), b"HDRHDRHDpayload");

        buf.pull_head(8).unwrap();
        assert_eq!(buf.as_slice(), b"payload");
    }

    #[test]
    fn push_head_without_room_fails() {
        let mut buf = NetBuf::with_headroom(4, b"abc");
        assert!(buf.push_head(8).is_none());
        assert_eq!(buf.as_slice(), b"abc");
        assert!(NetBuf::from_slice(b"abc").push_head(1).is_none());
    }

    #[test]
    fn tail_room_can_be_claimed_and_trimmed() {
        let mut buf = NetBuf::with_room(0, b"ab", 4);
        assert!(buf.tailroom() >= 4);
        buf.push_tail(2).unwrap().copy_from_slice(b"cd");
        assert_eq!(buf.as_slice(), b"abcd");
        buf.trim_tail(3).unwrap();
        assert_eq!(buf.as_slice(), b"a");
        assert!(buf.trim_tail(2).is_none());
    }

    #[test]
    fn split_and_rejoin_preserves_layout() {
        let mut buf = NetBuf::with_headroom(16, b"data");
        buf.push_head(4).unwrap().copy_from_slice(b"HEAD");

        let (front, region) = buf.split_region();
        assert_eq!(front.len(), 12);
        assert_eq!(&region[..], b"HEADdata");

        let mut back = NetBuf::rejoin(front, region);
        assert_eq!(back.headroom(), 12);
        back.pull_head(4).unwrap();
        assert_eq!(back.as_slice(), b"data");
    }
}
