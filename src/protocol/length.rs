use std::borrow::Cow;

use super::{Frame, Protocol};

const HEADER_LEN: usize = 4;

/// `[u32 big-endian length][payload]` frames. The payload handed to the
/// application excludes the header.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    max_frame: usize,
}

impl LengthPrefixed {
    pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_FRAME)
    }
}

impl Protocol for LengthPrefixed {
    fn check(&self, input: &[u8]) -> Frame {
        let Some(header) = input.get(..HEADER_LEN) else {
            return Frame::NeedMore;
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame {
            return Frame::Reject(Vec::new());
        }
        Frame::Complete(HEADER_LEN + len)
    }

    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[HEADER_LEN.min(frame.len())..]
    }

    fn encode<'a>(&self, payload: &'a [u8]) -> Cow<'a, [u8]> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        Cow::Owned(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        let protocol = LengthPrefixed::default();
        assert_eq!(protocol.check(&[]), Frame::NeedMore);
        assert_eq!(protocol.check(&[0, 0, 0]), Frame::NeedMore);
        assert_eq!(protocol.check(&[0, 0, 0, 5]), Frame::Complete(9));
        assert_eq!(protocol.check(&[0, 0, 1, 0, 1, 2]), Frame::Complete(260));
        assert_eq!(protocol.check(&[0, 0, 0, 0]), Frame::Complete(4));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let protocol = LengthPrefixed::new(8);
        assert_eq!(protocol.check(&[0, 0, 0, 9]), Frame::Reject(Vec::new()));
        assert_eq!(protocol.check(&[0, 0, 0, 8]), Frame::Complete(12));
    }

    #[test]
    fn test_encode_then_payload() {
        let protocol = LengthPrefixed::default();
        let framed = protocol.encode(b"abc");
        assert_eq!(framed.as_ref(), &[0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(protocol.payload(&framed), b"abc");
    }
}
