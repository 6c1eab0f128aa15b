//! Core email message type used throughout the outbound pipeline.
//!
//! [`EmailMessage`] keeps structured [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322)
//! headers next to a cached serialization. The serialization is only rebuilt
//! when a transformer changes the message, so a message that passes through
//! the pipeline untouched is dispatched byte-for-byte as it was received.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    is_content_header, is_mime_valid, normalize_line_endings, parse_address_list,
    parse_raw_headers,
};

/// Represents an outbound email message.
///
/// Headers are stored as an ordered `Vec` (preserving RFC 5322 order and
/// supporting duplicate headers such as `Received`). A cached `raw` field
/// holds the full serialized form; call [`rebuild`](Self::rebuild) after
/// modifying headers so that [`raw`](Self::raw) reflects the changes.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Unique message identifier, RFC 5322 message-id format.
    pub message_id: String,

    /// Envelope sender address.
    pub from: String,

    /// Envelope recipient addresses, in submission order.
    pub recipients: Vec<String>,

    /// Ordered list of MIME headers (case-preserved keys, trimmed values).
    headers: Vec<(String, String)>,

    /// Message body after the blank-line separator (RFC 5322 body).
    body: String,

    /// Cached full serialization (headers + blank line + body).
    raw: String,

    /// Recipients the transport reported as failed on the last send.
    failed_recipients: Vec<String>,
}

impl EmailMessage {
    pub fn new(from: String, recipients: Vec<String>, raw: String) -> Self {
        let (headers, content) = parse_raw_headers(&raw);
        let message_id = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Message-ID"))
            .map(|(_, v)| v.trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            message_id,
            from,
            recipients,
            body: content.to_string(),
            headers,
            raw,
            failed_recipients: Vec::new(),
        }
    }

    pub fn from_raw(from: &str, recipients: &[&str], raw: &str) -> Self {
        Self::new(
            from.to_string(),
            recipients.iter().map(|r| r.to_string()).collect(),
            raw.to_string(),
        )
    }

    /// Builds a message from its serialized form alone, taking the envelope
    /// sender from `From` and the recipients from `To` and `Cc`.
    pub fn parse(raw: &str) -> Self {
        let (headers, _) = parse_raw_headers(raw);
        let from = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("From"))
            .and_then(|(_, v)| parse_address_list(v).into_iter().next())
            .unwrap_or_default();
        let recipients = headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("To") || k.eq_ignore_ascii_case("Cc"))
            .flat_map(|(_, v)| parse_address_list(v))
            .collect();
        Self::new(from, recipients, raw.to_string())
    }

    /// Composes a minimal single-part message.
    ///
    /// The body is sent as `text/html` when it starts with a tag and as
    /// `text/plain` otherwise.
    pub fn compose(from: &str, recipients: &[&str], subject: &str, body: &str) -> Self {
        let message_id = Uuid::new_v4().to_string();
        let domain = from.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost");
        let content_type = if body.trim_start().starts_with('<') {
            "text/html; charset=utf-8"
        } else {
            "text/plain; charset=utf-8"
        };
        let headers = vec![
            ("From".to_string(), from.to_string()),
            ("To".to_string(), recipients.join(", ")),
            ("Subject".to_string(), subject.to_string()),
            ("Date".to_string(), Utc::now().to_rfc2822()),
            ("Message-ID".to_string(), format!("<{message_id}@{domain}>")),
            ("MIME-Version".to_string(), "1.0".to_string()),
            ("Content-Type".to_string(), content_type.to_string()),
        ];
        let mut message = Self {
            message_id: format!("{message_id}@{domain}"),
            from: from.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            headers,
            body: normalize_line_endings(body),
            raw: String::new(),
            failed_recipients: Vec::new(),
        };
        message.rebuild();
        message
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the email subject (convenience for `header("Subject")`).
    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or_default()
    }

    /// Returns the full serialized email (headers + blank line + content).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the message body after the header section (RFC 5322 body).
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns whether the message has any MIME headers.
    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Sets a header, replacing every existing occurrence of `name`.
    ///
    /// The cached [`raw`](Self::raw) field is **not** updated automatically,
    /// call [`rebuild`](Self::rebuild) once all modifications are done.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.headers[index].1 = value.to_string();
                let mut seen = 0;
                self.headers.retain(|(k, _)| {
                    if k.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Returns the MIME entity that cryptographic transforms operate on:
    /// the content headers, a blank line and the body, CRLF terminated.
    ///
    /// An entity without content headers starts with the blank line, which
    /// MIME readers treat as a `text/plain` part.
    pub fn content_entity(&self) -> String {
        let mut entity = String::with_capacity(self.body.len() + 128);
        for (key, value) in self.headers.iter().filter(|(k, _)| is_content_header(k)) {
            entity.push_str(key);
            entity.push_str(": ");
            entity.push_str(value);
            entity.push_str("\r\n");
        }
        entity.push_str("\r\n");
        entity.push_str(&normalize_line_endings(&self.body));
        entity
    }

    /// Replaces the content headers and body with those of `entity`,
    /// keeping every envelope header, and rebuilds the serialization.
    pub fn replace_content(&mut self, entity: &str) {
        let entity = normalize_line_endings(entity);
        let (content_headers, content) = parse_raw_headers(&entity);

        self.headers.retain(|(k, _)| !is_content_header(k));
        if !is_mime_valid(&entity) {
            self.headers
                .push(("MIME-Version".to_string(), "1.0".to_string()));
        }
        self.headers.extend(content_headers);
        self.body = content.to_string();
        self.rebuild();
    }

    /// Returns the recipients the transport reported as failed.
    pub fn failed_recipients(&self) -> &[String] {
        &self.failed_recipients
    }

    /// Records the recipients the transport reported as failed.
    pub fn set_failed_recipients(&mut self, failed: Vec<String>) {
        self.failed_recipients = failed;
    }

    /// Rebuilds the cached [`raw`](Self::raw) field from [`headers`](Self::headers) and [`body`](Self::body).
    ///
    /// Pre-computes the exact byte length, allocates once, and writes all
    /// parts via `push_str`.
    pub fn rebuild(&mut self) {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();

        let capacity = headers_len + if self.headers.is_empty() { 0 } else { 2 } + self.body.len();

        let mut raw = String::with_capacity(capacity);

        for (key, value) in &self.headers {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }

        if !self.headers.is_empty() {
            raw.push_str("\r\n");
        }

        raw.push_str(&self.body);

        self.raw = raw;
    }
}
