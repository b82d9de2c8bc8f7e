//! Topic and payload encoding for the node's pubsub API.
//!
//! Newer nodes expect topic arguments as multibase strings and emit message
//! data the same way: a one-character tag (`u` = base64url, no padding)
//! followed by the encoded bytes. Older nodes send plain names and standard
//! base64 payloads, so every decoder here falls back instead of failing.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;

/// Multibase tag for unpadded base64url.
pub const MULTIBASE_BASE64URL: char = 'u';

/// Encode a topic name for use as an `arg=` query parameter.
pub fn encode_topic(name: &str) -> String {
    let mut token = String::with_capacity(1 + name.len() * 4 / 3 + 4);
    token.push(MULTIBASE_BASE64URL);
    URL_SAFE_NO_PAD.encode_string(name.as_bytes(), &mut token);
    token
}

/// Decode a topic token emitted by the node.
///
/// Tokens without the multibase tag, or that don't decode to UTF-8, are
/// returned unchanged.
pub fn decode_topic(token: &str) -> String {
    token
        .strip_prefix(MULTIBASE_BASE64URL)
        .and_then(|body| URL_SAFE_NO_PAD.decode(body).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

/// Decode a message `data` field into text.
///
/// Returns `None` when the payload cannot be decoded by either encoding.
pub fn decode_payload(raw: &str) -> Option<String> {
    let bytes = match raw.strip_prefix(MULTIBASE_BASE64URL) {
        Some(body) => URL_SAFE_NO_PAD
            .decode(body)
            .ok()
            .or_else(|| decode_plain_base64(raw)),
        None => decode_plain_base64(raw),
    }?;

    String::from_utf8(bytes).ok()
}

fn decode_plain_base64(raw: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .ok()
}

/// Split a payload that may hold several JSON objects written back to back
/// (`{"a":1}{"b":2}`) into one string per object.
///
/// Input that is already a single valid JSON document is returned as is.
/// If no balanced object can be found, the input is returned as the only
/// element so nothing is dropped.
pub fn split_concatenated_records(text: &str) -> Vec<String> {
    if serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return vec![text.to_string()];
    }

    let bytes = text.as_bytes();
    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' if depth > 0 => in_string = true,
                b'{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                b'}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            records.push(text[s..=i].to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    if records.is_empty() {
        vec![text.to_string()]
    } else {
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_roundtrip_with_slashes_and_unicode() {
        for name in ["notebook/cells", "", "über/トピック/🚀", "a b+c=d?e&f"] {
            let token = encode_topic(name);
            assert!(token.starts_with('u'));
            assert!(!token.contains('='), "token must not be padded: {}", token);
            assert_eq!(decode_topic(&token), name);
        }
    }

    #[test]
    fn test_encode_topic_known_value() {
        // "test" -> base64url "dGVzdA"
        assert_eq!(encode_topic("test"), "udGVzdA");
    }

    #[test]
    fn test_decode_topic_passes_plain_names_through() {
        assert_eq!(decode_topic("plain-topic"), "plain-topic");
        // Tagged but not valid base64url
        assert_eq!(decode_topic("u***"), "u***");
    }

    #[test]
    fn test_decode_payload_multibase_and_plain() {
        assert_eq!(decode_payload("uaGVsbG8").as_deref(), Some("hello"));
        assert_eq!(decode_payload("aGVsbG8=").as_deref(), Some("hello"));
        assert_eq!(decode_payload("aGVsbG8").as_deref(), Some("hello"));
    }

    #[test]
    fn test_decode_payload_fails_closed() {
        assert_eq!(decode_payload("!!not base64!!"), None);
        // Valid base64 but not UTF-8
        assert_eq!(decode_payload("u_w"), None);
    }

    #[test]
    fn test_split_two_concatenated_objects() {
        assert_eq!(
            split_concatenated_records(r#"{"a":1}{"b":2}"#),
            vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]
        );
    }

    #[test]
    fn test_split_single_object_is_untouched() {
        assert_eq!(
            split_concatenated_records(r#"{"a":1}"#),
            vec![r#"{"a":1}"#.to_string()]
        );
    }

    #[test]
    fn test_split_ignores_braces_inside_strings() {
        let input = r#"{"s":"}{\"x"}{"t":"{"}"#;
        assert_eq!(
            split_concatenated_records(input),
            vec![r#"{"s":"}{\"x"}"#.to_string(), r#"{"t":"{"}"#.to_string()]
        );
    }

    #[test]
    fn test_split_nested_objects() {
        let input = r#"{"a":{"b":{}}}{"c":[1,{"d":2}]}"#;
        assert_eq!(
            split_concatenated_records(input),
            vec![
                r#"{"a":{"b":{}}}"#.to_string(),
                r#"{"c":[1,{"d":2}]}"#.to_string()
            ]
        );
    }

    #[test]
    fn test_split_malformed_returns_input() {
        for input in [r#"{"a":1"#, "hello world", ""] {
            assert_eq!(split_concatenated_records(input), vec![input.to_string()]);
        }
    }
}
