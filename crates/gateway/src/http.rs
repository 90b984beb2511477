#![forbid(unsafe_code)]

//! Just enough HTTP/1.1 for one request and one response per connection.

use std::io::{Read, Write};

const MAX_HEADER_BYTES: usize = 16 * 1024;
pub(crate) const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

struct Head {
    start_line: String,
    headers: Vec<(String, String)>,
    /// Body bytes that arrived together with the head.
    rest: Vec<u8>,
}

/// Reads up to the blank line ending the head. `None` when the peer sent nothing.
fn read_head<S: Read>(stream: &mut S) -> std::io::Result<Option<Head>> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::<u8>::new();
    loop {
        let read = match stream.read(&mut buf) {
            Ok(read) => read,
            Err(err) if is_timeout(&err) => break,
            Err(err) => return Err(err),
        };
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
    if data.is_empty() {
        return Ok(None);
    }

    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(data.len());
    let rest = data[header_end..].to_vec();
    let header_text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = header_text.split("\r\n");
    let start_line = lines.next().unwrap_or("").to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    Ok(Some(Head {
        start_line,
        headers,
        rest,
    }))
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    header_value(headers, "content-length").and_then(|v| v.parse::<usize>().ok())
}

/// Reads until `body` holds `len` bytes or the stream ends.
fn read_body<S: Read>(stream: &mut S, body: &mut Vec<u8>, len: usize) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    while body.len() < len {
        let read = match stream.read(&mut buf) {
            Ok(read) => read,
            Err(err) if is_timeout(&err) => break,
            Err(err) => return Err(err),
        };
        if read == 0 {
            break;
        }
        let take = read.min(len - body.len());
        body.extend_from_slice(&buf[..take]);
    }
    body.truncate(len);
    Ok(())
}

/// Oversized requests fail with `InvalidData` so the caller can answer 413.
pub(crate) fn read_request<S: Read>(stream: &mut S) -> std::io::Result<Option<HttpRequest>> {
    let Some(head) = read_head(stream)? else {
        return Ok(None);
    };
    let mut parts = head.start_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let length = content_length(&head.headers).unwrap_or(0);
    if length > MAX_BODY_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request body too large",
        ));
    }
    let mut body = head.rest;
    read_body(stream, &mut body, length)?;

    Ok(Some(HttpRequest {
        method,
        path,
        headers: head.headers,
        body,
    }))
}

pub(crate) fn write_response<S: Write>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()> {
    let mut headers = String::new();
    headers.push_str("HTTP/1.1 ");
    headers.push_str(status);
    headers.push_str("\r\n");
    headers.push_str("Content-Type: ");
    headers.push_str(content_type);
    headers.push_str("\r\n");
    headers.push_str("Cache-Control: no-store\r\n");
    headers.push_str("Connection: close\r\n");
    headers.push_str("Content-Length: ");
    headers.push_str(&body.len().to_string());
    headers.push_str("\r\n\r\n");

    stream.write_all(headers.as_bytes())?;
    if !head_only {
        stream.write_all(body)?;
    }
    stream.flush()
}

pub(crate) fn write_request<S: Write>(
    stream: &mut S,
    host: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let mut head = format!("POST {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("Content-Type: ");
    head.push_str(content_type);
    head.push_str("\r\nContent-Length: ");
    head.push_str(&body.len().to_string());
    head.push_str("\r\n\r\n");

    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Reads the status and body. Without `Content-Length` the body runs to end of stream.
pub(crate) fn read_response<S: Read>(stream: &mut S) -> std::io::Result<HttpResponse> {
    let Some(head) = read_head(stream)? else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a response",
        ));
    };
    let status = head
        .start_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line {:?}", head.start_line),
            )
        })?;

    let mut body = head.rest;
    match content_length(&head.headers) {
        Some(len) if len > MAX_BODY_BYTES => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response body too large",
            ));
        }
        Some(len) => read_body(stream, &mut body, len)?,
        None => read_body(stream, &mut body, MAX_BODY_BYTES)?,
    }
    Ok(HttpResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_with_body_split_across_reads() {
        let raw = b"POST /execute HTTP/1.1\r\nX-Auth-Token: abc\r\nContent-Length: 11\r\n\r\nhello world";
        let request = read_request(&mut Cursor::new(&raw[..]))
            .expect("read")
            .expect("request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/execute");
        assert_eq!(request.header("x-auth-token"), Some("abc"));
        assert_eq!(request.body, b"hello world");
    }

    #[test]
    fn empty_stream_is_no_request() {
        assert!(read_request(&mut Cursor::new(Vec::new())).expect("read").is_none());
    }

    #[test]
    fn oversized_body_is_refused() {
        let raw = format!(
            "POST /execute HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        let err = read_request(&mut Cursor::new(raw.into_bytes()))
            .err()
            .expect("too large");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn response_written_then_read_back() {
        let mut wire = Vec::new();
        write_response(&mut wire, "401 Unauthorized", "application/json", b"{}", false)
            .expect("write");
        let response = read_response(&mut Cursor::new(wire)).expect("read");
        assert_eq!(response.status, 401);
        assert_eq!(response.body, b"{}");
    }

    #[test]
    fn head_only_response_has_length_but_no_body() {
        let mut wire = Vec::new();
        write_response(&mut wire, "200 OK", "text/plain", b"abc", true).expect("write");
        let text = String::from_utf8(wire).expect("utf8");
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
