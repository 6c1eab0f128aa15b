/// Checks whether a raw email contains a `MIME-Version:` header,
/// indicating it is a valid MIME message per RFC 2045.
///
/// Only the header section (lines before the first blank line) is inspected.
///
/// # Examples
///
/// ```rust
/// assert!(sealpost_utils::is_mime_valid(
///     "MIME-Version: 1.0\r\nContent-Type: text/plain\r\n\r\nBody"
/// ));
/// assert!(!sealpost_utils::is_mime_valid("Subject: Hello\r\n\r\nMIME-Version: 1.0"));
/// ```
pub fn is_mime_valid(raw: &str) -> bool {
    for line in raw.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line
            .split_once(':')
            .is_some_and(|(key, _)| key.trim().eq_ignore_ascii_case("MIME-Version"))
        {
            return true;
        }
    }
    false
}

/// Returns whether a header describes the MIME entity rather than the
/// envelope, i.e. `MIME-Version` and any `Content-*` header.
///
/// These are the headers that move inside a signed or enveloped payload.
///
/// ```rust
/// assert!(sealpost_utils::is_content_header("Content-Type"));
/// assert!(sealpost_utils::is_content_header("content-transfer-encoding"));
/// assert!(sealpost_utils::is_content_header("MIME-Version"));
/// assert!(!sealpost_utils::is_content_header("Subject"));
/// ```
pub fn is_content_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("MIME-Version")
        || name
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("Content-"))
}

/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values. Folded continuation lines (starting with a space or
/// tab) are joined to the previous header with a single space.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = sealpost_utils::parse_raw_headers(
///     "From: alice@example.com\r\nSubject: A long\r\n subject\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[1], ("Subject".to_string(), "A long subject".to_string()));
/// assert_eq!(content, "Hello!");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let end = pos + line.len();
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line.starts_with([' ', '\t']) {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => break,
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

/// Extracts the bare addresses from an address-list header value
/// such as `To` or `Cc`.
///
/// ```rust
/// let addresses = sealpost_utils::parse_address_list(
///     "\"Doe, Jane\" <jane@example.com>, bob@example.com"
/// );
/// assert_eq!(addresses, vec!["jane@example.com", "bob@example.com"]);
/// ```
pub fn parse_address_list(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut angled = false;

    for c in value.chars() {
        match c {
            '"' if !angled => quoted = !quoted,
            '<' if !quoted => angled = true,
            '>' if !quoted => angled = false,
            ',' if !quoted && !angled => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| {
            let part = part.trim();
            let address = match (part.rfind('<'), part.rfind('>')) {
                (Some(start), Some(end)) if start < end => &part[start + 1..end],
                _ => part,
            };
            let address = address.trim();
            (!address.is_empty() && address.contains('@')).then(|| address.to_string())
        })
        .collect()
}

/// Converts bare `\n` and bare `\r` line terminators to `\r\n`.
///
/// ```rust
/// assert_eq!(
///     sealpost_utils::normalize_line_endings("a\nb\r\nc\rd"),
///     "a\r\nb\r\nc\r\nd"
/// );
/// ```
pub fn normalize_line_endings(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len() + text.len() / 32);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                normalized.push_str("\r\n");
            }
            '\n' => normalized.push_str("\r\n"),
            _ => normalized.push(c),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_headers_without_headers() {
        let (headers, content) = parse_raw_headers("Just plain text");
        assert!(headers.is_empty());
        assert_eq!(content, "Just plain text");
    }

    #[test]
    fn test_parse_raw_headers_lf_only() {
        let (headers, content) =
            parse_raw_headers("Content-Type: text/plain\nMIME-Version: 1.0\n\nBody\nMore");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, "text/plain");
        assert_eq!(content, "Body\nMore");
    }

    #[test]
    fn test_parse_raw_headers_folded_content_type() {
        let raw = "Content-Type: multipart/signed;\r\n\tprotocol=\"application/pkcs7-signature\"\r\n\r\nBody";
        let (headers, content) = parse_raw_headers(raw);
        assert_eq!(
            headers[0].1,
            "multipart/signed; protocol=\"application/pkcs7-signature\""
        );
        assert_eq!(content, "Body");
    }

    #[test]
    fn test_parse_raw_headers_empty_header_block() {
        let (headers, content) = parse_raw_headers("\r\nBody only");
        assert!(headers.is_empty());
        assert_eq!(content, "Body only");
    }

    #[test]
    fn test_is_mime_valid_case_insensitive() {
        assert!(is_mime_valid("mime-version: 1.0\r\n\r\nBody"));
        assert!(!is_mime_valid("Subject: Hello\r\n\r\nBody"));
    }

    #[test]
    fn test_is_content_header() {
        assert!(is_content_header("Content-Disposition"));
        assert!(is_content_header("CONTENT-TYPE"));
        assert!(!is_content_header("Content"));
        assert!(!is_content_header("From"));
        assert!(!is_content_header("X-Content-Type"));
    }

    #[test]
    fn test_parse_address_list() {
        assert_eq!(
            parse_address_list("Alice <alice@example.com>"),
            vec!["alice@example.com"]
        );
        assert_eq!(
            parse_address_list("a@example.com, b@example.com,, "),
            vec!["a@example.com", "b@example.com"]
        );
        assert!(parse_address_list("undisclosed-recipients:;").is_empty());
    }

    #[test]
    fn test_normalize_line_endings_idempotent() {
        let once = normalize_line_endings("a\nb\n");
        assert_eq!(once, "a\r\nb\r\n");
        assert_eq!(normalize_line_endings(&once), once);
    }
}
