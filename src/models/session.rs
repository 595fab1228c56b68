//! Captured session models
//!
//! Represents one intercepted request/response pair (or CONNECT tunnel, or
//! WebSocket conversation) recorded for inspection.

use crate::models::rule::AppliedRuleTrace;
use crate::models::websocket::WebSocketMessage;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single HTTP header. Order is preserved and duplicate names are allowed;
/// name comparison is case-insensitive, value comparison is exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Find the first header with the given name (case-insensitive).
pub fn header_value<'a>(headers: &'a [HeaderEntry], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.matches_name(name))
        .map(|h| h.value.as_str())
}

/// A fully buffered inbound HTTP request as read off the client socket.
/// Immutable once built; the rule engine produces a new value when mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    /// Request path without the query string, used for rule matching.
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        match target.split_once('?') {
            Some((path, _)) => path,
            None => target,
        }
    }
}

/// A fully buffered upstream response. Same immutability contract as
/// [`ParsedRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status_code: u16,
    pub reason: Option<String>,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
}

/// Request half of a captured session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<HeaderEntry>,
    pub body_preview: Option<String>,
}

/// Response half of a captured session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status_code: u16,
    pub reason: Option<String>,
    pub headers: Vec<HeaderEntry>,
    pub body_preview: Option<String>,
}

/// One logically captured exchange, owned by the in-memory session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedSession {
    /// Unique identifier (UUID v4); the store upserts by this key.
    pub id: String,
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub error: Option<String>,
    pub duration_millis: u64,
    /// Millisecond timestamp of when the exchange started.
    pub started_at: i64,
    pub applied_rules: Vec<AppliedRuleTrace>,
    pub web_socket_messages: Vec<WebSocketMessage>,
}

impl CapturedSession {
    pub fn new(request: CapturedRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            response: None,
            error: None,
            duration_millis: 0,
            started_at: Utc::now().timestamp_millis(),
            applied_rules: Vec::new(),
            web_socket_messages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = vec![HeaderEntry::new("Content-Type", "text/html")];
        assert_eq!(header_value(&headers, "content-type"), Some("text/html"));
        assert_eq!(header_value(&headers, "missing"), None);
    }

    #[test]
    fn path_strips_the_query_string() {
        let request = ParsedRequest {
            method: "GET".to_string(),
            target: "/search?q=rust".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        assert_eq!(request.path(), "/search");
    }

    #[test]
    fn sessions_round_trip_through_json() {
        let session = CapturedSession::new(CapturedRequest {
            method: "GET".to_string(),
            url: "http://example.com/".to_string(),
            headers: vec![HeaderEntry::new("Accept", "*/*")],
            body_preview: None,
        });
        let json = serde_json::to_string(&session).unwrap();
        let back: CapturedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.request.method, "GET");
    }
}
