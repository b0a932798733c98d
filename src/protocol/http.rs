use super::{Frame, Protocol};

const HEADER_END: &[u8] = b"\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\n\r\n";

/// Finds HTTP/1.x request boundaries: the header block, plus a
/// `Content-Length` body for methods that carry one.
#[derive(Debug, Clone, Copy)]
pub struct HttpFraming {
    max_header: usize,
    max_body: Option<usize>,
}

impl HttpFraming {
    pub const DEFAULT_MAX_HEADER: usize = 16384;

    pub fn new(max_header: usize, max_body: Option<usize>) -> Self {
        Self {
            max_header,
            max_body,
        }
    }
}

impl Default for HttpFraming {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_HEADER, None)
    }
}

impl Protocol for HttpFraming {
    fn check(&self, input: &[u8]) -> Frame {
        let Some(header_end) = find(input, HEADER_END) else {
            if input.len() >= self.max_header {
                return Frame::Reject(TOO_LARGE.to_vec());
            }
            return Frame::NeedMore;
        };
        let head_len = header_end + HEADER_END.len();

        let method = input
            .iter()
            .position(|b| *b == b' ')
            .map(|pos| &input[..pos])
            .unwrap_or(&[]);
        match method {
            b"GET" | b"HEAD" | b"DELETE" | b"OPTIONS" | b"TRACE" => Frame::Complete(head_len),
            b"POST" | b"PUT" | b"PATCH" => match content_length(&input[..header_end]) {
                Some(body) if self.max_body.is_some_and(|max| body > max) => {
                    Frame::Reject(TOO_LARGE.to_vec())
                }
                Some(body) => match head_len.checked_add(body) {
                    Some(total) => Frame::Complete(total),
                    None => Frame::Reject(TOO_LARGE.to_vec()),
                },
                None => Frame::Reject(BAD_REQUEST.to_vec()),
            },
            _ => Frame::Reject(BAD_REQUEST.to_vec()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Value of the first `Content-Length` header line, matched case-insensitively.
fn content_length(header: &[u8]) -> Option<usize> {
    const NAME: &[u8] = b"content-length:";
    header
        .split(|b| *b == b'\n')
        .skip(1)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .find(|line| line.len() >= NAME.len() && line[..NAME.len()].eq_ignore_ascii_case(NAME))
        .and_then(|line| {
            let value = std::str::from_utf8(&line[NAME.len()..]).ok()?.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            value.parse().ok()
        })
}
