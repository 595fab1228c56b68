//! Body preview decoding
//!
//! Turns captured body bytes into something human-readable: undoes
//! gzip/deflate content codings, decodes text with the declared charset and
//! truncates to the configured capture limit.

use crate::models::session::header_value;
use crate::models::HeaderEntry;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;

/// Result of undoing the declared content codings. `bytes == None` means the
/// body could not be decoded; `message` then explains why. Callers must treat
/// that as "undecodable", not as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    pub bytes: Option<Vec<u8>>,
    pub message: Option<String>,
}

/// Undo `Content-Encoding` codings in reverse declared order
/// (last-applied-first). Supports gzip/x-gzip and deflate; `identity` tokens
/// are ignored.
pub fn decode_for_preview(body: &[u8], headers: &[HeaderEntry]) -> DecodedBody {
    let codings: Vec<String> = header_value(headers, "content-encoding")
        .map(|v| {
            v.split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty() && c != "identity")
                .collect()
        })
        .unwrap_or_default();

    if codings.is_empty() {
        return DecodedBody {
            bytes: Some(body.to_vec()),
            message: None,
        };
    }

    let mut decoded = body.to_vec();
    for coding in codings.iter().rev() {
        let result = match coding.as_str() {
            "gzip" | "x-gzip" => gunzip(&decoded),
            "deflate" => inflate(&decoded),
            other => {
                return DecodedBody {
                    bytes: None,
                    message: Some(format!("unsupported content encoding {:?}", other)),
                }
            }
        };
        decoded = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                return DecodedBody {
                    bytes: None,
                    message: Some(format!("failed to decode {}: {}", coding, err)),
                }
            }
        };
    }

    DecodedBody {
        bytes: Some(decoded),
        message: Some(format!("decoded {}", codings.join(", "))),
    }
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

fn inflate(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    // RFC 2616 deflate is zlib-wrapped, but some servers send a raw stream.
    match ZlibDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) => {
            let mut raw = Vec::new();
            DeflateDecoder::new(body).read_to_end(&mut raw)?;
            Ok(raw)
        }
    }
}

/// Render a text preview of the body: decoded, charset-converted, truncated
/// to `max_bytes`, with decode/truncation notices appended.
pub fn build_body_preview(body: &[u8], headers: &[HeaderEntry], max_bytes: usize) -> String {
    let decoded = decode_for_preview(body, headers);
    let bytes = match decoded.bytes {
        Some(bytes) => bytes,
        None => {
            let message = decoded
                .message
                .unwrap_or_else(|| "body could not be decoded".to_string());
            return format!("[{}]", message);
        }
    };

    let truncated = bytes.len() > max_bytes;
    let shown = &bytes[..bytes.len().min(max_bytes)];
    let (text, _, _) = charset_for(headers).decode(shown);
    let mut preview = text.into_owned();

    if let Some(message) = decoded.message {
        preview.push_str(&format!("\n[{}]", message));
    }
    if truncated {
        preview.push_str(&format!("\n[truncated to {} bytes]", max_bytes));
    }
    preview
}

/// Return decoded image bytes verbatim when the content type is an image and
/// the decoded size fits the capture limit; `None` otherwise (the UI shows a
/// placeholder).
pub fn build_image_preview_bytes(
    body: &[u8],
    headers: &[HeaderEntry],
    max_bytes: usize,
) -> Option<Vec<u8>> {
    let content_type = header_value(headers, "content-type")?;
    if !content_type.trim().to_ascii_lowercase().starts_with("image/") {
        return None;
    }
    let decoded = decode_for_preview(body, headers).bytes?;
    if decoded.len() > max_bytes {
        return None;
    }
    Some(decoded)
}

/// Charset from the `Content-Type` `charset=` parameter; UTF-8 by default and
/// on unknown labels.
fn charset_for(headers: &[HeaderEntry]) -> &'static Encoding {
    let content_type = match header_value(headers, "content-type") {
        Some(v) => v,
        None => return UTF_8,
    };
    let lowered = content_type.to_ascii_lowercase();
    let Some(idx) = lowered.find("charset=") else {
        return UTF_8;
    };
    let label = content_type[idx + "charset=".len()..]
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"');
    Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn passthrough_without_content_encoding() {
        let decoded = decode_for_preview(b"plain", &[]);
        assert_eq!(decoded.bytes.as_deref(), Some(b"plain".as_ref()));
        assert!(decoded.message.is_none());
    }

    #[test]
    fn gzip_body_preview_is_decoded_with_notice() {
        let headers = vec![HeaderEntry::new("Content-Encoding", "gzip")];
        let preview = build_body_preview(&gzip(b"hello"), &headers, 1024);
        assert!(preview.starts_with("hello"));
        assert!(preview.contains("decoded gzip"));
    }

    #[test]
    fn deflate_body_is_decoded() {
        let headers = vec![HeaderEntry::new("Content-Encoding", "deflate")];
        let decoded = decode_for_preview(&zlib(b"squeezed"), &headers);
        assert_eq!(decoded.bytes.as_deref(), Some(b"squeezed".as_ref()));
    }

    #[test]
    fn stacked_codings_decode_in_reverse_order() {
        let inner = zlib(b"layered");
        let outer = gzip(&inner);
        let headers = vec![HeaderEntry::new("Content-Encoding", "deflate, gzip")];
        let decoded = decode_for_preview(&outer, &headers);
        assert_eq!(decoded.bytes.as_deref(), Some(b"layered".as_ref()));
    }

    #[test]
    fn identity_tokens_are_stripped() {
        let headers = vec![HeaderEntry::new("Content-Encoding", "identity")];
        let decoded = decode_for_preview(b"as-is", &headers);
        assert_eq!(decoded.bytes.as_deref(), Some(b"as-is".as_ref()));
        assert!(decoded.message.is_none());
    }

    #[test]
    fn unsupported_coding_yields_no_bytes_and_a_message() {
        let headers = vec![HeaderEntry::new("Content-Encoding", "br")];
        let decoded = decode_for_preview(b"\x00\x01", &headers);
        assert!(decoded.bytes.is_none());
        assert!(decoded.message.unwrap().contains("br"));
    }

    #[test]
    fn corrupt_gzip_yields_no_bytes_and_a_message() {
        let headers = vec![HeaderEntry::new("Content-Encoding", "gzip")];
        let decoded = decode_for_preview(b"not gzip at all", &headers);
        assert!(decoded.bytes.is_none());
        assert!(decoded.message.unwrap().contains("gzip"));
    }

    #[test]
    fn preview_truncates_and_notes_it() {
        let preview = build_body_preview(&[b'a'; 100], &[], 10);
        assert!(preview.starts_with("aaaaaaaaaa\n"));
        assert!(preview.contains("[truncated to 10 bytes]"));
    }

    #[test]
    fn charset_parameter_controls_text_decoding() {
        // "héllo" in ISO-8859-1
        let body = [b'h', 0xe9, b'l', b'l', b'o'];
        let headers = vec![HeaderEntry::new(
            "Content-Type",
            "text/plain; charset=iso-8859-1",
        )];
        let preview = build_body_preview(&body, &headers, 1024);
        assert!(preview.starts_with("héllo"));
    }

    #[test]
    fn unknown_charset_falls_back_to_utf8() {
        let headers = vec![HeaderEntry::new(
            "Content-Type",
            "text/plain; charset=no-such-charset",
        )];
        let preview = build_body_preview(b"fallback", &headers, 1024);
        assert!(preview.starts_with("fallback"));
    }

    #[test]
    fn image_preview_returns_bytes_within_limit() {
        let headers = vec![HeaderEntry::new("Content-Type", "image/png")];
        let bytes = build_image_preview_bytes(b"\x89PNG", &headers, 1024);
        assert_eq!(bytes.as_deref(), Some(b"\x89PNG".as_ref()));
    }

    #[test]
    fn oversized_or_non_image_preview_is_none() {
        let headers = vec![HeaderEntry::new("Content-Type", "image/png")];
        assert!(build_image_preview_bytes(&[0u8; 64], &headers, 16).is_none());
        let text_headers = vec![HeaderEntry::new("Content-Type", "text/plain")];
        assert!(build_image_preview_bytes(b"abc", &text_headers, 16).is_none());
    }
}
