//! Control-channel message grammar.
//!
//! Messages exchanged with the supervisor are single-line UTF-8 text with
//! space-separated tokens; the first token is the command, the rest are
//! either positional or `name=value` pairs. Helpers here do the token
//! slicing shared by the control loop, the render pump, and the session
//! input handler.

use std::borrow::Cow;

use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};

/// Text payloads larger than this are preceded by a `nextmessage:` size
/// hint on the wire so the peer can grow its read buffer.
pub const SMALL_MESSAGE_SIZE: usize = 1024;

/// Maximum length of a message rendered into a log line.
const ABBREVIATED_LEN: usize = 120;

/// Splits a message into whitespace-separated tokens.
#[must_use]
pub fn tokenize(message: &str) -> Vec<&str> {
    message.split_whitespace().collect()
}

/// Returns the first token of a message, or `""` for an empty message.
#[must_use]
pub fn first_token(message: &str) -> &str {
    message.split_whitespace().next().unwrap_or("")
}

/// Splits a `name<delim>value` token into its parts.
///
/// Returns `None` when the delimiter does not occur.
#[must_use]
pub fn parse_name_value(token: &str, delim: char) -> Option<(&str, &str)> {
    token.split_once(delim)
}

/// Looks up the value of a `name=value` token in a token list.
#[must_use]
pub fn token_value<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens.iter().find_map(|token| {
        token
            .split_once('=')
            .and_then(|(n, v)| (n == name).then_some(v))
    })
}

/// Percent-encodes arbitrary bytes for embedding in a control message.
#[must_use]
pub fn url_encode(data: &[u8]) -> String {
    percent_encode(data, NON_ALPHANUMERIC).to_string()
}

/// Decodes a percent-encoded token back into raw bytes.
#[must_use]
pub fn url_decode(text: &str) -> Vec<u8> {
    percent_decode_str(text).collect()
}

/// Decodes a percent-encoded token into a string, replacing invalid UTF-8.
#[must_use]
pub fn url_decode_utf8(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

/// Renders a message for logging: first line only, capped in length.
///
/// Tile replies carry PNG bytes after the first newline; logging the whole
/// payload would spray binary into the log stream.
#[must_use]
pub fn abbreviate(message: &str) -> Cow<'_, str> {
    let line = message.lines().next().unwrap_or("");
    if line.len() <= ABBREVIATED_LEN && line.len() == message.len() {
        return Cow::Borrowed(message);
    }
    let mut end = line.len().min(ABBREVIATED_LEN);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &line[..end]))
}

/// Formats the oversize-message hint frame.
#[must_use]
pub fn next_message_hint(size: usize) -> String {
    format!("nextmessage: size={size}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_and_first_token() {
        let tokens = tokenize("session a1 file%3A%2F%2Ftest.odt");
        assert_eq!(tokens, vec!["session", "a1", "file%3A%2F%2Ftest.odt"]);
        assert_eq!(first_token("tile part=0 width=256"), "tile");
        assert_eq!(first_token("   "), "");
    }

    #[test]
    fn test_parse_name_value() {
        assert_eq!(parse_name_value("child-7", '-'), Some(("child", "7")));
        assert_eq!(parse_name_value("part=0", '='), Some(("part", "0")));
        assert_eq!(parse_name_value("disconnect", '-'), None);
    }

    #[test]
    fn test_token_value() {
        let tokens = tokenize("tile part=0 width=256 height=256");
        assert_eq!(token_value(&tokens, "width"), Some("256"));
        assert_eq!(token_value(&tokens, "ver"), None);
    }

    #[test]
    fn test_url_round_trip() {
        let cases: &[&[u8]] = &[
            b"file://test.odt",
            b"hello world/with?query&bits",
            b"\x00\xff\xfe binary",
            &[0u8; 4096],
        ];
        for case in cases {
            assert_eq!(url_decode(&url_encode(case)), *case);
        }
    }

    #[test]
    fn test_url_decode_utf8() {
        assert_eq!(url_decode_utf8("file%3A%2F%2Ftest.odt"), "file://test.odt");
        assert_eq!(url_decode_utf8("J%C3%BCrgen"), "J\u{fc}rgen");
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short message"), "short message");
        let multi = "tile: part=0\n\u{89}PNG binary";
        assert_eq!(abbreviate(multi), "tile: part=0...");
        let long = "x".repeat(400);
        assert!(abbreviate(&long).len() < 200);
    }

    #[test]
    fn test_next_message_hint() {
        assert_eq!(next_message_hint(4096), "nextmessage: size=4096");
    }
}
