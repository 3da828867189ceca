// SPDX-License-Identifier: Apache-2.0

//! Escape-sequence decoders.
//!
//! The template parser only *locates* escape spans with a regex; decoding a
//! span into output bytes is delegated to one of the callbacks here. Two
//! dialects are supported: the common backslash set an access log uses with
//! `escape=default`, and the smaller JSON set produced by `escape=json`.
//!
//! Everything is byte-oriented: spans are raw line bytes and decoders write
//! raw bytes, so `\xHH` emits a single byte while `\uHHHH`/`\UHHHHHHHH`
//! emit the UTF-8 encoding of the code point.

/// Locates escape spans in the default dialect:
/// `\n \t \r \f \b \v \" \\`, 1-3 octal digits, `\xHH`, `\uHHHH`, `\UHHHHHHHH`.
pub const COMMON_ESCAPE_PATTERN: &str =
    r#"\\([nftbrv"\\]|[0-7]{1,3}|x[0-9a-fA-F]{2}|u[0-9a-fA-F]{4}|U[0-9a-fA-F]{8})"#;

/// Locates escape spans in nginx's `escape=json` output: `\xHH`, `\"`, `\\`,
/// `\uHHHH`.
pub const JSON_ESCAPE_PATTERN: &str = r#"\\x[0-9a-fA-F]{2}|\\[\\"]|\\u[0-9a-fA-F]{4}"#;

/// Decodes one escape span into `out`. Returns false when the span cannot be
/// decoded (octal overflowing a byte, a surrogate code point), which fails
/// the parse of the whole line.
pub type UnescapeFn = fn(&[u8], &mut Vec<u8>) -> bool;

fn parse_byte(digits: &[u8], radix: u32) -> Option<u8> {
    let digits = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(digits, radix).ok()
}

fn parse_code_point(digits: &[u8]) -> Option<char> {
    let digits = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(digits, 16).ok().and_then(char::from_u32)
}

/// Decoder for [`COMMON_ESCAPE_PATTERN`].
pub fn unescape_common(esc: &[u8], out: &mut Vec<u8>) -> bool {
    if esc.len() < 2 || esc[0] != b'\\' {
        return false;
    }

    match esc[1] {
        b'"' => out.push(b'"'),
        b'\\' => out.push(b'\\'),
        b'n' => out.push(b'\n'),
        b't' => out.push(b'\t'),
        b'r' => out.push(b'\r'),
        b'f' => out.push(0x0c),
        b'b' => out.push(0x08),
        b'v' => out.push(0x0b),
        b'0'..=b'7' => match parse_byte(&esc[1..], 8) {
            Some(b) => out.push(b),
            None => return false,
        },
        b'x' => match parse_byte(&esc[2..], 16) {
            Some(b) => out.push(b),
            None => return false,
        },
        b'u' | b'U' => match parse_code_point(&esc[2..]) {
            Some(ch) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            None => return false,
        },
        _ => return false,
    }

    true
}

/// Decoder for [`JSON_ESCAPE_PATTERN`].
pub fn unescape_json(esc: &[u8], out: &mut Vec<u8>) -> bool {
    if esc.len() < 2 || esc[0] != b'\\' {
        return false;
    }

    match esc[1] {
        b'u' => match parse_code_point(&esc[2..]) {
            Some(ch) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            None => return false,
        },
        b'x' => match parse_byte(&esc[2..], 16) {
            Some(b) => out.push(b),
            None => return false,
        },
        b'"' | b'\\' => out.push(esc[1]),
        _ => return false,
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex;

    fn decode(pattern: &str, f: UnescapeFn, input: &str) -> String {
        let re = Regex::new(pattern).unwrap();
        let bytes = input.as_bytes();
        let mut out = Vec::new();
        let mut last = 0;
        for m in re.find_iter(bytes) {
            out.extend_from_slice(&bytes[last..m.start()]);
            assert!(f(m.as_bytes(), &mut out), "failed on {:?}", m.as_bytes());
            last = m.end();
        }
        out.extend_from_slice(&bytes[last..]);
        String::from_utf8(out).unwrap()
    }

    /// Encodes every byte that the common decoder recognizes, used to check
    /// the decode(encode(s)) == s round trip.
    fn encode_common(s: &str) -> String {
        let mut out = String::new();
        for &b in s.as_bytes() {
            match b {
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                b'\n' => out.push_str("\\n"),
                b'\t' => out.push_str("\\t"),
                b'\r' => out.push_str("\\r"),
                0x0c => out.push_str("\\f"),
                0x08 => out.push_str("\\b"),
                0x0b => out.push_str("\\v"),
                _ if b < 0x20 || b >= 0x7f => out.push_str(&format!("\\x{:02x}", b)),
                _ => out.push(b as char),
            }
        }
        out
    }

    #[test]
    fn common_named_escapes() {
        assert_eq!(
            decode(COMMON_ESCAPE_PATTERN, unescape_common, r#"a\tb\nc\"d\\e"#),
            "a\tb\nc\"d\\e"
        );
        assert_eq!(
            decode(COMMON_ESCAPE_PATTERN, unescape_common, r#"\r\f\b\v"#),
            "\r\u{c}\u{8}\u{b}"
        );
    }

    #[test]
    fn common_numeric_escapes() {
        assert_eq!(decode(COMMON_ESCAPE_PATTERN, unescape_common, r#"\x41\x20\x42"#), "A B");
        assert_eq!(decode(COMMON_ESCAPE_PATTERN, unescape_common, r#"\101\40\102"#), "A B");
        assert_eq!(decode(COMMON_ESCAPE_PATTERN, unescape_common, "\\u00e9"), "\u{e9}");
        assert_eq!(decode(COMMON_ESCAPE_PATTERN, unescape_common, r#"\U0001F600"#), "\u{1F600}");
    }

    #[test]
    fn common_round_trip() {
        for s in [
            "plain text",
            "tabs\tand\nnewlines",
            "quote \" backslash \\ mix",
            "ctrl \u{1} \u{1f} bytes",
        ] {
            let encoded = encode_common(s);
            assert_eq!(decode(COMMON_ESCAPE_PATTERN, unescape_common, &encoded), s);
        }
    }

    #[test]
    fn hex_escape_is_byte_oriented() {
        let mut out = Vec::new();
        assert!(unescape_common(br"\xff", &mut out));
        assert_eq!(out, vec![0xff]);
    }

    #[test]
    fn out_of_range_sequences_fail() {
        let mut out = Vec::new();
        // 0o777 overflows a byte
        assert!(!unescape_common(br"\777", &mut out));
        // surrogate code point
        assert!(!unescape_common(br"\ud800", &mut out));
        assert!(!unescape_json(br"\ud800", &mut out));
    }

    #[test]
    fn unrecognized_sequence_fails() {
        let mut out = Vec::new();
        assert!(!unescape_common(br"\q", &mut out));
        assert!(!unescape_common(b"q", &mut out));
        assert!(!unescape_json(br"\n", &mut out));
    }

    #[test]
    fn json_escapes() {
        assert_eq!(
            decode(JSON_ESCAPE_PATTERN, unescape_json, "GET \\x22\\u00e9\\x22 \\\"q\\\""),
            "GET \"\u{e9}\" \"q\""
        );
    }
}
