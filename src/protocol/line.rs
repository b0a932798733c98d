use std::borrow::Cow;

use super::{Frame, Protocol};

/// Newline-terminated text. The terminator belongs to the frame; the payload
/// has `\n` or `\r\n` stripped.
#[derive(Debug, Clone, Copy)]
pub struct LineDelimited {
    max_line: usize,
}

impl LineDelimited {
    pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }
}

impl Default for LineDelimited {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LINE)
    }
}

impl Protocol for LineDelimited {
    fn check(&self, input: &[u8]) -> Frame {
        match input.iter().position(|b| *b == b'\n') {
            Some(pos) if pos <= self.max_line => Frame::Complete(pos + 1),
            Some(_) => Frame::Reject(Vec::new()),
            None if input.len() > self.max_line => Frame::Reject(Vec::new()),
            None => Frame::NeedMore,
        }
    }

    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        let line = frame.strip_suffix(b"\n").unwrap_or(frame);
        line.strip_suffix(b"\r").unwrap_or(line)
    }

    fn encode<'a>(&self, payload: &'a [u8]) -> Cow<'a, [u8]> {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.extend_from_slice(payload);
        out.push(b'\n');
        Cow::Owned(out)
    }
}
