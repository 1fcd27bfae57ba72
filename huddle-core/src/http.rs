//! HTTP/1.1 request assembly over incremental socket reads.
//!
//! Only the header bytes (everything before the first CRLFCRLF) are ever
//! inspected as text; bodies stay raw byte vectors, since uploads carry
//! arbitrary binary data.

use crate::error::ProtocolError;

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 64;

/// Cap on accumulated bytes before the header terminator shows up.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// One parsed request. Headers keep their original casing; lookup is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.header("Upgrade")
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Multipart boundary token from the Content-Type header, if any.
    pub fn multipart_boundary(&self) -> Option<String> {
        let value = self.header("Content-Type")?;
        if !value.to_ascii_lowercase().contains("multipart/form-data") {
            return None;
        }
        let boundary = value.split("boundary=").nth(1)?;
        Some(boundary.trim().trim_matches('"').to_string())
    }

    /// Value of a cookie from the Cookie header, if present.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let cookies = self.header("Cookie")?;
        cookies.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name).then_some(v.trim())
        })
    }
}

/// Accumulates socket reads until one complete request can be parsed.
///
/// A POST with `Content-Length` is held back until the body is complete.
/// A POST without `Content-Length` parses immediately with whatever body
/// bytes have arrived; callers cannot distinguish a short body from a
/// complete one in that case. Other methods parse as soon as the header
/// terminator is seen.
#[derive(Debug)]
pub struct RequestAssembler {
    buf: Vec<u8>,
    max_header_bytes: usize,
}

impl Default for RequestAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAssembler {
    pub fn new() -> Self {
        Self::with_header_cap(DEFAULT_MAX_HEADER_BYTES)
    }

    pub fn with_header_cap(max_header_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_header_bytes,
        }
    }

    /// Append newly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to parse one complete request from everything pushed so far.
    /// `Ok(None)` means more bytes are needed.
    pub fn try_parse(&self) -> Result<Option<Request>, ProtocolError> {
        let header_end = match find(&self.buf, HEADER_END) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > self.max_header_bytes {
                    return Err(ProtocolError::HeadersTooLarge(self.max_header_bytes));
                }
                return Ok(None);
            }
        };
        if header_end > self.max_header_bytes {
            return Err(ProtocolError::HeadersTooLarge(self.max_header_bytes));
        }

        let header_bytes = &self.buf[..header_end + HEADER_END.len()];
        let body_bytes = &self.buf[header_end + HEADER_END.len()..];

        let (method, path, headers) = parse_header_block(header_bytes)?;

        let body = if method == "POST" {
            let content_length = headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok());
            match content_length {
                Some(n) if body_bytes.len() < n => return Ok(None),
                Some(n) => body_bytes[..n].to_vec(),
                // No Content-Length: take what arrived. Known limitation.
                None => body_bytes.to_vec(),
            }
        } else {
            body_bytes.to_vec()
        };

        Ok(Some(Request {
            method,
            path,
            headers,
            body,
        }))
    }
}

type HeaderBlock = (String, String, Vec<(String, String)>);

/// Parse the request line and headers from the isolated header bytes.
fn parse_header_block(header_bytes: &[u8]) -> Result<HeaderBlock, ProtocolError> {
    // The request line needs at least a method and a path.
    let line_end = find(header_bytes, b"\r\n").unwrap_or(header_bytes.len());
    let request_line = std::str::from_utf8(&header_bytes[..line_end])
        .map_err(|_| ProtocolError::MalformedRequestLine)?;
    if request_line.split_whitespace().count() < 2 {
        return Err(ProtocolError::MalformedRequestLine);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(header_bytes)
        .map_err(|_| ProtocolError::MalformedHeaders)?;
    if !status.is_complete() {
        return Err(ProtocolError::MalformedHeaders);
    }

    let method = req.method.ok_or(ProtocolError::MalformedRequestLine)?;
    let path = req.path.ok_or(ProtocolError::MalformedRequestLine)?;
    let parsed = req
        .headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| ProtocolError::MalformedHeaders)?
                .trim()
                .to_string();
            Ok((h.name.to_string(), value))
        })
        .collect::<Result<Vec<_>, ProtocolError>>()?;
    Ok((method.to_string(), path.to_string(), parsed))
}

/// First occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
