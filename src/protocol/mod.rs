//! Application-level framing.
//!
//! A [`Protocol`] looks at the bytes buffered on a connection and says where
//! the first message ends. The connection never interprets bytes itself: the
//! same read/buffer/dispatch path serves line protocols, length-prefixed RPC
//! and HTTP by swapping the protocol.
//!
//! ```text
//!   inbound buffer: [ frame 1 ][ frame 2 ][ partial...
//!                   └ check ─▶ Complete(n) ─▶ payload(frame) ─▶ on_message
//! ```

mod http;
mod length;
mod line;

use std::borrow::Cow;

use tracing::warn;

pub use http::HttpFraming;
pub use length::LengthPrefixed;
pub use line::LineDelimited;

/// Outcome of inspecting a buffered prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Not enough bytes to tell where the first message ends.
    NeedMore,
    /// The first `n` bytes are exactly one message, separators included.
    Complete(usize),
    /// The input breaks the framing rules; the bytes are a final reply to
    /// send before closing (possibly empty).
    Reject(Vec<u8>),
}

pub trait Protocol: Send + Sync + 'static {
    /// Must be pure: the same prefix always yields the same answer.
    fn check(&self, input: &[u8]) -> Frame;

    /// The part of a complete frame handed to the message callback.
    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        frame
    }

    /// Wraps an outgoing payload in this protocol's framing.
    fn encode<'a>(&self, payload: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(payload)
    }
}

impl<F> Protocol for F
where
    F: Fn(&[u8]) -> Frame + Send + Sync + 'static,
{
    fn check(&self, input: &[u8]) -> Frame {
        self(input)
    }
}

/// Result of asking the [`Framer`] for the next message.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Vec<u8>),
    Incomplete,
    Reject(Vec<u8>),
}

/// Applies a protocol to a growing buffer, remembering the length of a frame
/// whose end is known but whose bytes have not all arrived yet.
#[derive(Debug, Default, Clone)]
pub struct Framer {
    expected: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the frame being waited for; 0 when unknown.
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn next(&mut self, protocol: &dyn Protocol, buffer: &mut Vec<u8>) -> Decoded {
        if self.expected == 0 {
            if buffer.is_empty() {
                return Decoded::Incomplete;
            }
            match protocol.check(buffer) {
                Frame::NeedMore => return Decoded::Incomplete,
                Frame::Reject(reply) => return Decoded::Reject(reply),
                Frame::Complete(0) => {
                    warn!("protocol reported an empty frame");
                    return Decoded::Reject(Vec::new());
                }
                Frame::Complete(n) => self.expected = n,
            }
        }

        if buffer.len() < self.expected {
            return Decoded::Incomplete;
        }
        let frame: Vec<u8> = buffer.drain(..self.expected).collect();
        self.expected = 0;
        Decoded::Frame(frame)
    }

    pub fn reset(&mut self) {
        self.expected = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(protocol: &dyn Protocol, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut framer = Framer::new();
        let mut buffer = Vec::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buffer.extend_from_slice(chunk);
            while let Decoded::Frame(frame) = framer.next(protocol, &mut buffer) {
                out.push(protocol.payload(&frame).to_vec());
            }
        }
        out
    }

    fn stream() -> Vec<u8> {
        let mut bytes = vec![0, 0, 0, 5];
        bytes.extend_from_slice(b"hello");
        bytes.extend_from_slice(&[0, 0, 0, 3]);
        bytes.extend_from_slice(b"abc");
        bytes
    }

    #[test]
    fn test_two_frames_in_any_split() {
        let protocol = LengthPrefixed::default();
        let bytes = stream();
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(
                frames(&protocol, &[a, b]),
                vec![b"hello".to_vec(), b"abc".to_vec()],
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_one_shot() {
        let protocols: Vec<(Box<dyn Protocol>, Vec<u8>)> = vec![
            (Box::new(LengthPrefixed::default()), stream()),
            (
                Box::new(LineDelimited::default()),
                b"one\r\ntwo\nthree\n".to_vec(),
            ),
            (
                Box::new(HttpFraming::default()),
                b"GET / HTTP/1.1\r\nHost: a\r\n\r\nPOST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc"
                    .to_vec(),
            ),
        ];
        for (protocol, bytes) in protocols {
            let one_shot = frames(protocol.as_ref(), &[&bytes]);
            let singles: Vec<&[u8]> = bytes.chunks(1).collect();
            assert_eq!(frames(protocol.as_ref(), &singles), one_shot);
            assert!(!one_shot.is_empty());
        }
    }

    #[test]
    fn test_closure_protocol() {
        let fixed = |input: &[u8]| {
            if input.len() >= 2 {
                Frame::Complete(2)
            } else {
                Frame::NeedMore
            }
        };
        assert_eq!(
            frames(&fixed, &[b"abcde"]),
            vec![b"ab".to_vec(), b"cd".to_vec()]
        );
    }

    #[test]
    fn test_expected_length_is_cached() {
        let protocol = LengthPrefixed::default();
        let mut framer = Framer::new();
        let mut buffer = vec![0, 0, 0, 4, b'a'];
        assert_eq!(framer.next(&protocol, &mut buffer), Decoded::Incomplete);
        assert_eq!(framer.expected(), 8);
        buffer.extend_from_slice(b"bcd");
        assert_eq!(
            framer.next(&protocol, &mut buffer),
            Decoded::Frame(vec![0, 0, 0, 4, b'a', b'b', b'c', b'd'])
        );
        assert_eq!(framer.expected(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let zero = |_: &[u8]| Frame::Complete(0);
        let mut buffer = b"x".to_vec();
        assert_eq!(
            Framer::new().next(&zero, &mut buffer),
            Decoded::Reject(Vec::new())
        );
    }

    #[test]
    fn test_reject_passes_reply_through() {
        let refuse = |_: &[u8]| Frame::Reject(b"nope".to_vec());
        let mut buffer = b"x".to_vec();
        assert_eq!(
            Framer::new().next(&refuse, &mut buffer),
            Decoded::Reject(b"nope".to_vec())
        );
    }
}
