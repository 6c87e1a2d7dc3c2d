//! Line-oriented text form of a header.
//!
//! Each field is written as `name: value` on its own line. Values escape
//! backslash, line feed and carriage return so that a field always fits on
//! one line; names may not contain `:` or whitespace at all.

use crate::error::{CodecError, CodecResult};
use crate::header::Header;

/// Escapes a field value for the text form.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
///
/// # Errors
///
/// Returns [`CodecError::InvalidEscape`] on an unknown or dangling escape.
pub fn unescape(value: &str) -> CodecResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(CodecError::InvalidEscape(other)),
            None => return Err(CodecError::InvalidEscape(' ')),
        }
    }
    Ok(out)
}

/// Checks that `name` can be used as a field name.
///
/// # Errors
///
/// Returns [`CodecError::InvalidFieldName`] if the name is empty or contains
/// `:` or whitespace.
pub fn validate_name(name: &str) -> CodecResult<()> {
    if name.is_empty() || name.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(CodecError::InvalidFieldName(name.to_string()));
    }
    Ok(())
}

/// Encodes a single field as a line, without the trailing newline.
///
/// # Errors
///
/// Fails if the name is not valid.
pub fn encode_field_line(name: &str, value: &str) -> CodecResult<String> {
    validate_name(name)?;
    Ok(format!("{name}: {}", escape(value)))
}

/// Decodes a `name: value` line. `line_no` is only used in errors.
///
/// A single space after the colon is part of the separator; anything beyond
/// it belongs to the value.
///
/// # Errors
///
/// Fails on a missing colon, an invalid name or a bad escape.
pub fn decode_field_line(line: &str, line_no: usize) -> CodecResult<(String, String)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| CodecError::malformed_line(line_no, "missing ':' separator"))?;
    validate_name(name)?;
    let raw = rest.strip_prefix(' ').unwrap_or(rest);
    Ok((name.to_string(), unescape(raw)?))
}

/// Encodes a header as newline-terminated field lines.
///
/// # Errors
///
/// Fails if any field name is not valid.
pub fn encode_text(header: &Header) -> CodecResult<String> {
    let mut out = String::new();
    for (name, value) in header.iter() {
        out.push_str(&encode_field_line(name, value)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decodes the text form. Blank lines are skipped.
///
/// # Errors
///
/// Fails on the first malformed line.
pub fn decode_text(text: &str) -> CodecResult<Header> {
    let mut header = Header::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = decode_field_line(line, index + 1)?;
        header.push(name, value);
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn simple_document() {
        let header = Header::new()
            .with("subject", "hello")
            .with("to", "alice")
            .with("to", "bob");
        let text = encode_text(&header).unwrap();
        assert_eq!(text, "subject: hello\nto: alice\nto: bob\n");
        assert_eq!(decode_text(&text).unwrap(), header);
    }

    #[test]
    fn multi_line_values_are_escaped() {
        let header = Header::new().with("body", "line one\nline two\r\n\\end");
        let text = encode_text(&header).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert_eq!(decode_text(&text).unwrap(), header);
    }

    #[test]
    fn value_keeps_extra_spaces() {
        let (name, value) = decode_field_line("k:   padded", 1).unwrap();
        assert_eq!(name, "k");
        assert_eq!(value, "  padded");

        let (_, value) = decode_field_line("k:", 1).unwrap();
        assert_eq!(value, "");
    }

    #[test]
    fn colon_in_value_is_fine() {
        let (name, value) = decode_field_line("url: http://x:80", 1).unwrap();
        assert_eq!(name, "url");
        assert_eq!(value, "http://x:80");
    }

    #[test]
    fn bad_lines() {
        assert!(matches!(
            decode_text("ok: 1\nno separator\n"),
            Err(CodecError::MalformedLine { line: 2, .. })
        ));
        assert!(matches!(
            decode_field_line("bad name: x", 1),
            Err(CodecError::InvalidFieldName(_))
        ));
        assert!(matches!(
            decode_field_line("k: a\\tb", 1),
            Err(CodecError::InvalidEscape('t'))
        ));
        assert!(matches!(
            decode_field_line("k: dangling\\", 1),
            Err(CodecError::InvalidEscape(_))
        ));
    }

    #[test]
    fn invalid_names_refused_on_encode() {
        let header = Header::new().with("a:b", "x");
        assert!(encode_text(&header).is_err());
        assert!(encode_field_line("", "x").is_err());
    }

    proptest! {
        #[test]
        fn escape_roundtrip(value in ".*") {
            prop_assert_eq!(unescape(&escape(&value)).unwrap(), value);
        }

        #[test]
        fn text_roundtrip(
            fields in prop::collection::vec(("[a-zA-Z][a-zA-Z0-9_.-]{0,12}", ".*"), 0..8)
        ) {
            let header: Header = fields.into_iter().collect();
            let text = encode_text(&header).unwrap();
            prop_assert_eq!(decode_text(&text).unwrap(), header);
        }
    }
}
