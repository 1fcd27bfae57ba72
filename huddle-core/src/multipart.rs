//! Binary-safe extraction of the single file part from a
//! multipart/form-data body. Part headers are textual by construction; the
//! payload is arbitrary bytes and is never decoded.

use crate::error::ProtocolError;
use crate::http::find;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// The file carried by an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Extract the one file part delimited by `boundary`. Exactly one part per
/// request is supported; a missing boundary or an empty payload is an error.
pub fn extract(body: &[u8], boundary: &str) -> Result<FilePart, ProtocolError> {
    let boundary_bytes = boundary.as_bytes();
    let first = find(body, boundary_bytes).ok_or(ProtocolError::BoundaryNotFound)?;
    let after_boundary = &body[first + boundary_bytes.len()..];

    let header_end = find(after_boundary, HEADER_END).ok_or(ProtocolError::MalformedPart)?;
    let header_text = std::str::from_utf8(&after_boundary[..header_end])
        .map_err(|_| ProtocolError::MalformedPart)?;

    let filename = parse_filename(header_text).ok_or(ProtocolError::MalformedPart)?;
    let mime_type = parse_content_type(header_text)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| mime_for_name(&filename).to_string());

    let payload = &after_boundary[header_end + HEADER_END.len()..];
    let terminator = [b"\r\n", boundary_bytes].concat();
    let data = match find(payload, &terminator) {
        Some(end) => payload[..end].to_vec(),
        None => trim_trailing_boundary(payload, boundary_bytes.len()),
    };

    if data.is_empty() {
        return Err(ProtocolError::EmptyFilePart);
    }

    Ok(FilePart {
        filename,
        mime_type,
        data,
    })
}

fn parse_filename(headers: &str) -> Option<String> {
    let disposition = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-disposition:"))?;
    let from = disposition.split("filename=\"").nth(1)?;
    let end = from.find('"')?;
    Some(from[..end].to_string())
}

fn parse_content_type(headers: &str) -> Option<String> {
    headers.lines().find_map(|l| {
        let (name, value) = l.split_once(':')?;
        name.eq_ignore_ascii_case("content-type")
            .then(|| value.trim().to_string())
    })
}

/// No closing boundary found: keep everything, then strip a trailing
/// boundary artifact if one sits at the end of the payload.
fn trim_trailing_boundary(payload: &[u8], boundary_len: usize) -> Vec<u8> {
    let window = boundary_len + 10;
    if payload.len() <= window {
        return payload.to_vec();
    }
    let tail_start = payload.len() - window;
    match find(&payload[tail_start..], b"\r\n--") {
        Some(pos) => payload[..tail_start + pos].to_vec(),
        None => payload.to_vec(),
    }
}

/// MIME type from a file name extension. Shared by upload inference and
/// file serving.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----WebKitFormBoundaryX7eqSsJ2";

    fn build_body(headers: &str, payload: &[u8], closed: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--");
        body.extend_from_slice(BOUNDARY.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(headers.as_bytes());
        body.extend_from_slice(b"\r\n\r\n");
        body.extend_from_slice(payload);
        if closed {
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(BOUNDARY.as_bytes());
            body.extend_from_slice(b"--\r\n");
        }
        body
    }

    #[test]
    fn binary_payload_survives_byte_for_byte() {
        // Payload deliberately contains CRLFCRLF and boundary-ish bytes.
        let mut payload = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', b'\r', b'\n'];
        payload.extend_from_slice(&[0u8, 255, 13, 10, 13, 10, 42]);
        let body = build_body(
            "Content-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n\
             Content-Type: image/png",
            &payload,
            true,
        );

        let part = extract(&body, BOUNDARY).unwrap();
        assert_eq!(part.filename, "a.png");
        assert_eq!(part.mime_type, "image/png");
        assert_eq!(part.data, payload);
    }

    #[test]
    fn mime_inferred_from_extension_when_header_absent() {
        let body = build_body(
            "Content-Disposition: form-data; name=\"file\"; filename=\"notes.pdf\"",
            b"%PDF-1.4 content",
            true,
        );
        let part = extract(&body, BOUNDARY).unwrap();
        assert_eq!(part.mime_type, "application/pdf");
    }

    #[test]
    fn content_type_header_match_is_case_insensitive() {
        let body = build_body(
            "content-disposition: form-data; name=\"file\"; filename=\"x.bin\"\r\n\
             content-type: application/x-custom",
            b"\x00\x01\x02",
            true,
        );
        let part = extract(&body, BOUNDARY).unwrap();
        assert_eq!(part.mime_type, "application/x-custom");
    }

    #[test]
    fn unterminated_payload_falls_back_to_remaining_bytes() {
        let payload = vec![7u8; 64];
        let body = build_body(
            "Content-Disposition: form-data; name=\"file\"; filename=\"raw.bin\"",
            &payload,
            false,
        );
        let part = extract(&body, BOUNDARY).unwrap();
        assert_eq!(part.data, payload);
    }

    #[test]
    fn missing_boundary_rejected() {
        assert_eq!(
            extract(b"no boundary here", BOUNDARY).unwrap_err(),
            ProtocolError::BoundaryNotFound
        );
    }

    #[test]
    fn empty_payload_rejected() {
        let body = build_body(
            "Content-Disposition: form-data; name=\"file\"; filename=\"empty.txt\"",
            b"",
            true,
        );
        assert_eq!(
            extract(&body, BOUNDARY).unwrap_err(),
            ProtocolError::EmptyFilePart
        );
    }

    #[test]
    fn missing_filename_rejected() {
        let body = build_body("Content-Type: image/png", b"data", true);
        assert_eq!(
            extract(&body, BOUNDARY).unwrap_err(),
            ProtocolError::MalformedPart
        );
    }
}
