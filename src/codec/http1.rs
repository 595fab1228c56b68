//! Raw HTTP/1.1 request/response framing.
//!
//! The request parser is deliberately hand-rolled: the proxy tolerates
//! malformed header lines (they are skipped, not fatal) and needs exact
//! control over body framing. Upstream response heads go through `httparse`.

use crate::models::{HeaderEntry, ParsedRequest, UpstreamResponse};
use std::collections::VecDeque;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on a header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
/// Largest declared body we will buffer.
const MAX_BODY_BYTES: u64 = i32::MAX as u64;

/// Headers that are meaningful only to the immediate connection and must not
/// be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("HTTP headers exceed {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed response head")]
    MalformedResponse,
    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),
    #[error("declared body of {0} bytes exceeds supported maximum")]
    BodyTooLarge(u64),
    #[error("connection closed before message completed")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Target of a CONNECT request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub authority: String,
}

/// Stream reader with a pushback buffer, so bytes read past the header
/// terminator are not lost to the body reader.
struct BufferedStream<'a, S> {
    stream: &'a mut S,
    buffer: VecDeque<u8>,
}

impl<'a, S: AsyncRead + Unpin> BufferedStream<'a, S> {
    fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            buffer: VecDeque::new(),
        }
    }

    fn with_leftover(stream: &'a mut S, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            buffer: leftover.into(),
        }
    }

    async fn fill(&mut self) -> Result<(), ParseError> {
        let mut temp = [0u8; 4096];
        let read = self.stream.read(&mut temp).await?;
        if read == 0 {
            return Err(ParseError::UnexpectedEof);
        }
        self.buffer.extend(&temp[..read]);
        Ok(())
    }

    /// Read one line up to CRLF; the terminator is consumed and stripped.
    async fn read_line(&mut self) -> Result<Vec<u8>, ParseError> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                let mut line = Vec::with_capacity(pos);
                for _ in 0..pos {
                    line.push(self.buffer.pop_front().unwrap_or(0));
                }
                self.buffer.pop_front();
                self.buffer.pop_front();
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(len.min(64 * 1024));
        while out.len() < len {
            while out.len() < len {
                match self.buffer.pop_front() {
                    Some(b) => out.push(b),
                    None => break,
                }
            }
            if out.len() < len {
                self.fill().await?;
            }
        }
        Ok(out)
    }

    async fn read_to_eof(&mut self, cap: u64) -> Result<Vec<u8>, ParseError> {
        let mut out: Vec<u8> = self.buffer.drain(..).collect();
        let mut temp = [0u8; 8192];
        loop {
            let read = self.stream.read(&mut temp).await?;
            if read == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&temp[..read]);
            if out.len() as u64 > cap {
                return Err(ParseError::BodyTooLarge(out.len() as u64));
            }
        }
    }
}

fn find_crlf(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Read raw bytes until the CRLFCRLF terminator. Returns `(head, leftover)`;
/// `Ok(None)` means the peer closed cleanly before sending anything.
async fn read_head<S>(stream: &mut S) -> Result<Option<(Vec<u8>, Vec<u8>)>, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let read = stream.read(&mut temp).await?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(ParseError::UnexpectedEof);
        }
        buffer.extend_from_slice(&temp[..read]);

        if let Some(pos) = find_header_end(&buffer) {
            let leftover = buffer.split_off(pos);
            return Ok(Some((buffer, leftover)));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(ParseError::HeadersTooLarge);
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse one request off the stream. `Ok(None)` signals a clean EOF before
/// any byte was read (idle connection closed).
pub async fn parse_request<S>(stream: &mut S) -> Result<Option<ParsedRequest>, ParseError>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = match read_head(stream).await? {
        Some(parts) => parts,
        None => return Ok(None),
    };

    let head_text = String::from_utf8_lossy(&head);
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let tokens: Vec<&str> = request_line.split_whitespace().collect();
    if tokens.len() != 3 {
        return Err(ParseError::MalformedRequestLine(request_line.to_string()));
    }
    let (method, target, version) = (tokens[0], tokens[1], tokens[2]);

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // Lines without a colon are skipped rather than failing the request.
        if let Some((name, value)) = line.split_once(':') {
            headers.push(HeaderEntry::new(name.trim(), value.trim()));
        }
    }

    let body = read_body(stream, leftover, &headers).await?;

    Ok(Some(ParsedRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body,
    }))
}

/// Resolve and read the body per framing priority: chunked, then
/// Content-Length, then empty.
async fn read_body<S>(
    stream: &mut S,
    leftover: Vec<u8>,
    headers: &[HeaderEntry],
) -> Result<Vec<u8>, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = BufferedStream::with_leftover(stream, leftover);

    if is_chunked(headers) {
        return read_chunked_body(&mut buffered).await;
    }

    if let Some(length) = declared_content_length(headers)? {
        if length == 0 {
            return Ok(Vec::new());
        }
        return buffered.read_exact(length as usize).await;
    }

    Ok(Vec::new())
}

fn is_chunked(headers: &[HeaderEntry]) -> bool {
    crate::models::session::header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn declared_content_length(headers: &[HeaderEntry]) -> Result<Option<u64>, ParseError> {
    let value = match crate::models::session::header_value(headers, "content-length") {
        Some(v) => v,
        None => return Ok(None),
    };
    match value.trim().parse::<u64>() {
        Ok(len) if len > MAX_BODY_BYTES => Err(ParseError::BodyTooLarge(len)),
        Ok(len) => Ok(Some(len)),
        Err(_) => Ok(None),
    }
}

async fn read_chunked_body<S>(buffered: &mut BufferedStream<'_, S>) -> Result<Vec<u8>, ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = buffered.read_line().await?;
        let size_token = String::from_utf8_lossy(&line);
        let size_token = size_token.split(';').next().unwrap_or("").trim().to_string();
        let chunk_size = usize::from_str_radix(&size_token, 16)
            .map_err(|_| ParseError::InvalidChunkSize(size_token.clone()))?;

        if chunk_size == 0 {
            // Trailer lines end with a blank line.
            loop {
                let trailer = buffered.read_line().await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        if (body.len() + chunk_size) as u64 > MAX_BODY_BYTES {
            return Err(ParseError::BodyTooLarge((body.len() + chunk_size) as u64));
        }

        let chunk = buffered.read_exact(chunk_size).await?;
        body.extend_from_slice(&chunk);

        let crlf = buffered.read_exact(2).await?;
        if crlf != b"\r\n" {
            return Err(ParseError::InvalidChunkSize(
                String::from_utf8_lossy(&crlf).to_string(),
            ));
        }
    }
}

/// Read a full upstream response, including its body.
pub async fn read_response<S>(stream: &mut S) -> Result<UpstreamResponse, ParseError>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = read_head(stream).await?.ok_or(ParseError::UnexpectedEof)?;
    let (status_code, reason, headers) = parse_response_head(&head)?;

    let body = if status_code < 200 || status_code == 204 || status_code == 304 {
        Vec::new()
    } else if is_chunked(&headers) {
        let mut buffered = BufferedStream::with_leftover(stream, leftover);
        read_chunked_body(&mut buffered).await?
    } else if let Some(length) = declared_content_length(&headers)? {
        let mut buffered = BufferedStream::with_leftover(stream, leftover);
        buffered.read_exact(length as usize).await?
    } else {
        // No framing headers: the server signals the end by closing.
        let mut buffered = BufferedStream::with_leftover(stream, leftover);
        buffered.read_to_eof(MAX_BODY_BYTES).await?
    };

    Ok(UpstreamResponse {
        status_code,
        reason,
        headers,
        body,
    })
}

/// Read only the raw response header block, leaving the body on the wire.
/// Used by the WebSocket upgrade path, which forwards the head verbatim.
pub async fn read_raw_response_head<S>(
    stream: &mut S,
) -> Result<(Vec<u8>, Vec<u8>, u16), ParseError>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = read_head(stream).await?.ok_or(ParseError::UnexpectedEof)?;
    let (status_code, _, _) = parse_response_head(&head)?;
    Ok((head, leftover, status_code))
}

pub(crate) fn parse_response_head(
    head: &[u8],
) -> Result<(u16, Option<String>, Vec<HeaderEntry>), ParseError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut res = httparse::Response::new(&mut header_storage);
    let status = res.parse(head).map_err(|_| ParseError::MalformedResponse)?;
    if status.is_partial() {
        return Err(ParseError::MalformedResponse);
    }

    let status_code = res.code.ok_or(ParseError::MalformedResponse)?;
    let reason = res.reason.filter(|r| !r.is_empty()).map(str::to_string);
    let headers = res
        .headers
        .iter()
        .map(|h| HeaderEntry::new(h.name, String::from_utf8_lossy(h.value)))
        .collect();

    Ok((status_code, reason, headers))
}

/// Parse the authority from a CONNECT request line. Accepts `[host]:port`,
/// `host:port` (a single colon only) and a bare host defaulting to 443.
pub fn parse_connect_target(authority: &str) -> Option<ConnectTarget> {
    let trimmed = authority.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = if after.is_empty() {
            443
        } else {
            parse_port(after.strip_prefix(':')?)?
        };
        return Some(ConnectTarget {
            host: host.to_string(),
            port,
            authority: trimmed.to_string(),
        });
    }

    match trimmed.matches(':').count() {
        0 => Some(ConnectTarget {
            host: trimmed.to_string(),
            port: 443,
            authority: trimmed.to_string(),
        }),
        1 => {
            let (host, port) = trimmed.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some(ConnectTarget {
                host: host.to_string(),
                port: parse_port(port)?,
                authority: trimmed.to_string(),
            })
        }
        // Ambiguous bare IPv6 literal; brackets are required.
        _ => None,
    }
}

fn parse_port(input: &str) -> Option<u16> {
    let port: u32 = input.parse().ok()?;
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

/// Serialize a response with explicit framing: hop-by-hop headers and any
/// prior Content-Length are dropped, `Content-Length` is recomputed, and the
/// connection is always marked close. Never emits chunked bodies.
pub fn serialize_response(response: &UpstreamResponse) -> Vec<u8> {
    let reason = response.reason.as_deref().unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status_code, reason).into_bytes();
    for header in &response.headers {
        if is_hop_by_hop(&header.name) || header.matches_name("content-length") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Serialize a request for one serial upstream exchange (origin-form path,
/// explicit Content-Length, `Connection: close`).
pub fn serialize_request(method: &str, path: &str, headers: &[HeaderEntry], body: &[u8]) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", method, path).into_bytes();
    for header in headers {
        if is_hop_by_hop(&header.name) || header.matches_name("content-length") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

/// Serialize a request byte-for-byte as received, headers untouched. Used to
/// forward WebSocket upgrade requests upstream.
pub fn serialize_request_verbatim(request: &ParsedRequest, path: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", request.method, path, request.version).into_bytes();
    for header in &request.headers {
        out.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn parse_bytes(bytes: &[u8]) -> Result<Option<ParsedRequest>, ParseError> {
        let (mut reader, mut writer) = duplex(128 * 1024);
        writer.write_all(bytes).await.unwrap();
        drop(writer);
        parse_request(&mut reader).await
    }

    #[tokio::test]
    async fn parses_simple_request_with_body() {
        let req = parse_bytes(
            b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/submit");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.body, b"hello");
        assert_eq!(
            crate::models::session::header_value(&req.headers, "host"),
            Some("example.com")
        );
    }

    #[tokio::test]
    async fn clean_eof_before_any_byte_is_none() {
        let result = parse_bytes(b"").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn request_line_must_have_three_tokens() {
        let err = parse_bytes(b"GET /\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequestLine(_)));
    }

    #[tokio::test]
    async fn malformed_header_lines_are_skipped() {
        let req = parse_bytes(b"GET / HTTP/1.1\r\nHost: a\r\nbogusline\r\nX-Ok: 1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers[1].name, "X-Ok");
    }

    #[tokio::test]
    async fn oversized_headers_are_rejected() {
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        bytes.extend_from_slice(format!("X-Fill: {}\r\n", "a".repeat(70_000)).as_bytes());
        bytes.extend_from_slice(b"\r\n");
        let err = parse_bytes(&bytes).await.unwrap_err();
        assert!(matches!(err, ParseError::HeadersTooLarge));
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let err = parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn chunked_body_decodes_wikipedia() {
        let req = parse_bytes(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(req.body, b"Wikipedia");
        assert_eq!(req.body.len(), 9);
    }

    #[tokio::test]
    async fn chunked_body_consumes_trailers() {
        let req = parse_bytes(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(req.body, b"abc");
    }

    #[tokio::test]
    async fn invalid_chunk_size_is_an_error() {
        let err = parse_bytes(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunkSize(_)));
    }

    #[tokio::test]
    async fn excessive_content_length_is_rejected() {
        let err = parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: 3000000000\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::BodyTooLarge(_)));
    }

    #[test]
    fn connect_target_host_and_port() {
        let target = parse_connect_target("example.com:443").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn connect_target_bracketed_ipv6() {
        let target = parse_connect_target("[::1]:8443").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn connect_target_defaults_to_443() {
        let target = parse_connect_target("example.com").unwrap();
        assert_eq!(target.port, 443);
    }

    #[test]
    fn connect_target_rejects_ambiguous_colons() {
        assert!(parse_connect_target("a:b:c").is_none());
    }

    #[test]
    fn connect_target_validates_port_range() {
        assert!(parse_connect_target("example.com:0").is_none());
        assert!(parse_connect_target("example.com:65536").is_none());
        assert!(parse_connect_target("example.com:65535").is_some());
    }

    #[test]
    fn serialized_response_has_explicit_framing() {
        let response = UpstreamResponse {
            status_code: 200,
            reason: Some("OK".into()),
            headers: vec![
                HeaderEntry::new("Content-Type", "text/plain"),
                HeaderEntry::new("Transfer-Encoding", "chunked"),
                HeaderEntry::new("Content-Length", "999"),
                HeaderEntry::new("Connection", "keep-alive"),
            ],
            body: b"hello".to_vec(),
        };
        let bytes = serialize_response(&response);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(!text.contains("keep-alive"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn response_without_framing_reads_to_eof() {
        let (mut reader, mut writer) = duplex(4096);
        tokio::spawn(async move {
            writer
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed")
                .await
                .unwrap();
        });
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"streamed");
    }
}
