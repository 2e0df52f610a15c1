// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Escaping of paths and names for use in URLs and HTML.

use std::fmt::Write;

fn needs_quoting(byte: u8) -> bool {
    !byte.is_ascii_graphic() || matches!(byte, b'+' | b'#' | b'%' | b'"' | b'?')
}

/// Percent-encodes a path for use in a `Location` header or an `href`.
/// Slashes and most punctuation are left alone.
pub fn quote(path: &[u8]) -> String {
    let mut quoted = String::with_capacity(path.len());
    for &byte in path {
        if needs_quoting(byte) {
            _ = write!(quoted, "%{byte:02x}");
        } else {
            quoted.push(byte as char);
        }
    }
    quoted
}

/// Escapes text for inclusion in HTML. Invalid UTF-8 is replaced.
pub fn html(text: &[u8]) -> String {
    let text = String::from_utf8_lossy(text);
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(b"/plain/path.txt", "/plain/path.txt")]
    #[case(b"/with space", "/with%20space")]
    #[case(b"/a+b#c%d\"e?f", "/a%2bb%23c%25d%22e%3ff")]
    #[case(b"/caf\xc3\xa9", "/caf%c3%a9")]
    #[case(b"/~user/(x)", "/~user/(x)")]
    fn quoting(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(quote(input), expected);
    }

    #[test]
    fn html_escaping() {
        assert_eq!(html(b"<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
