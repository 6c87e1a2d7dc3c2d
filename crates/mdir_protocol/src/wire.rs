//! Line-oriented wire codec.
//!
//! Every message starts with a head line. Messages that carry a document
//! announce its field count as the last head token and are followed by that
//! many `name: value` lines.
//!
//! ```text
//! 7 SUB 42 0
//! 8 PUT 42 2
//! type: dir
//! name: inbox
//! RESP 8 200 3 99
//! PATCH 42 2 3 a 2
//! type: dir
//! name: inbox
//! ```

use crate::command::{CommandKind, Request, Response, Seq};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::ServerMessage;
use crate::patch::{Action, Patch, Version};
use bytes::{Buf, BytesMut};
use mdir_codec::{decode_field_line, encode_field_line, Header};
use std::marker::PhantomData;

/// Default upper bound on one line.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

const KEYWORD_RESPONSE: &str = "RESP";
const KEYWORD_PATCH: &str = "PATCH";

/// A message with a line encoding.
pub trait WireMessage: Sized {
    /// Appends the encoded message, newline-terminated.
    fn encode_into(&self, out: &mut String) -> ProtocolResult<()>;

    /// Number of document lines that follow `head`.
    fn body_lines(head: &str) -> ProtocolResult<usize>;

    /// Builds the message from its head and document lines.
    fn parse(head: &str, body: &[&str]) -> ProtocolResult<Self>;

    /// Encodes the message to a string.
    fn encode(&self) -> ProtocolResult<String> {
        let mut out = String::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// Checks that a folder identifier can travel as a single token and is
/// usable as one directory name on either side.
pub fn validate_dir_id(dir_id: &str) -> ProtocolResult<()> {
    let unusable = dir_id.is_empty()
        || dir_id.starts_with('.')
        || dir_id.contains(['/', '\\'])
        || dir_id.chars().any(char::is_whitespace);
    if unusable {
        return Err(ProtocolError::InvalidDirId(dir_id.to_string()));
    }
    Ok(())
}

fn push_document(out: &mut String, header: &Header) -> ProtocolResult<()> {
    for (name, value) in header.iter() {
        out.push_str(&encode_field_line(name, value)?);
        out.push('\n');
    }
    Ok(())
}

fn parse_document(body: &[&str]) -> ProtocolResult<Header> {
    let mut header = Header::new();
    for (index, line) in body.iter().enumerate() {
        let (name, value) = decode_field_line(line, index + 1)?;
        header.push(name, value);
    }
    Ok(header)
}

fn parse_num<T: std::str::FromStr>(token: Option<&str>, head: &str, what: &str) -> ProtocolResult<T> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ProtocolError::malformed(head, format!("missing or invalid {what}")))
}

fn expect_token<'a>(token: Option<&'a str>, head: &str, what: &str) -> ProtocolResult<&'a str> {
    token.ok_or_else(|| ProtocolError::malformed(head, format!("missing {what}")))
}

fn expect_end(mut tokens: std::str::SplitWhitespace<'_>, head: &str) -> ProtocolResult<()> {
    match tokens.next() {
        Some(extra) => Err(ProtocolError::malformed(
            head,
            format!("unexpected token {extra:?}"),
        )),
        None => Ok(()),
    }
}

impl WireMessage for Request {
    fn encode_into(&self, out: &mut String) -> ProtocolResult<()> {
        if let Some(dir_id) = self.dir_id() {
            validate_dir_id(dir_id)?;
        }
        match self {
            Request::Sub {
                seq,
                dir_id,
                from_version,
            } => out.push_str(&format!("{seq} SUB {dir_id} {from_version}\n")),
            Request::Unsub { seq, dir_id } => out.push_str(&format!("{seq} UNSUB {dir_id}\n")),
            Request::Put {
                seq,
                dir_id,
                header,
            } => {
                out.push_str(&format!("{seq} PUT {dir_id} {}\n", header.len()));
                push_document(out, header)?;
            }
            Request::Rem {
                seq,
                dir_id,
                version,
            } => out.push_str(&format!("{seq} REM {dir_id} {version}\n")),
            Request::Quit { seq } => out.push_str(&format!("{seq} QUIT\n")),
        }
        Ok(())
    }

    fn body_lines(head: &str) -> ProtocolResult<usize> {
        let mut tokens = head.split_whitespace();
        let _seq = tokens.next();
        if tokens.next() != Some(CommandKind::Put.keyword()) {
            return Ok(0);
        }
        let _dir_id = tokens.next();
        parse_num(tokens.next(), head, "field count")
    }

    fn parse(head: &str, body: &[&str]) -> ProtocolResult<Self> {
        let mut tokens = head.split_whitespace();
        let seq: Seq = parse_num(tokens.next(), head, "sequence number")?;
        let keyword = expect_token(tokens.next(), head, "keyword")?;
        let kind = CommandKind::from_keyword(keyword)
            .ok_or_else(|| ProtocolError::UnknownKeyword(keyword.to_string()))?;

        let request = match kind {
            CommandKind::Sub => Request::Sub {
                seq,
                dir_id: expect_token(tokens.next(), head, "folder")?.to_string(),
                from_version: parse_num(tokens.next(), head, "version")?,
            },
            CommandKind::Unsub => Request::Unsub {
                seq,
                dir_id: expect_token(tokens.next(), head, "folder")?.to_string(),
            },
            CommandKind::Put => {
                let dir_id = expect_token(tokens.next(), head, "folder")?.to_string();
                let _count: usize = parse_num(tokens.next(), head, "field count")?;
                Request::Put {
                    seq,
                    dir_id,
                    header: parse_document(body)?,
                }
            }
            CommandKind::Rem => Request::Rem {
                seq,
                dir_id: expect_token(tokens.next(), head, "folder")?.to_string(),
                version: parse_num(tokens.next(), head, "version")?,
            },
            CommandKind::Quit => Request::Quit { seq },
        };
        expect_end(tokens, head)?;
        Ok(request)
    }
}

impl WireMessage for ServerMessage {
    fn encode_into(&self, out: &mut String) -> ProtocolResult<()> {
        match self {
            ServerMessage::Response(Response { seq, status, text }) => {
                out.push_str(&format!("{KEYWORD_RESPONSE} {seq} {status}"));
                if let Some(text) = text {
                    if text.contains(['\n', '\r']) {
                        return Err(ProtocolError::malformed(
                            text.as_str(),
                            "response text spans lines",
                        ));
                    }
                    out.push(' ');
                    out.push_str(text);
                }
                out.push('\n');
            }
            ServerMessage::Patch { dir_id, patch } => {
                validate_dir_id(dir_id)?;
                out.push_str(&format!(
                    "{KEYWORD_PATCH} {dir_id} {} {} {} {}\n",
                    patch.old_version,
                    patch.new_version,
                    patch.action.code(),
                    patch.header.len()
                ));
                push_document(out, &patch.header)?;
            }
        }
        Ok(())
    }

    fn body_lines(head: &str) -> ProtocolResult<usize> {
        let mut tokens = head.split_whitespace();
        if tokens.next() != Some(KEYWORD_PATCH) {
            return Ok(0);
        }
        parse_num(tokens.nth(4), head, "field count")
    }

    fn parse(head: &str, body: &[&str]) -> ProtocolResult<Self> {
        let (keyword, rest) = head.split_once(' ').unwrap_or((head, ""));
        match keyword {
            KEYWORD_RESPONSE => {
                let mut parts = rest.splitn(3, ' ');
                let seq = parse_num(parts.next(), head, "sequence number")?;
                let status = parse_num(parts.next(), head, "status")?;
                let text = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
                Ok(ServerMessage::Response(Response { seq, status, text }))
            }
            KEYWORD_PATCH => {
                let mut tokens = rest.split_whitespace();
                let dir_id = expect_token(tokens.next(), head, "folder")?.to_string();
                validate_dir_id(&dir_id)?;
                let old: Version = parse_num(tokens.next(), head, "old version")?;
                let new: Version = parse_num(tokens.next(), head, "new version")?;
                let code = expect_token(tokens.next(), head, "action")?;
                let action = code
                    .parse::<char>()
                    .ok()
                    .and_then(Action::from_code)
                    .ok_or_else(|| ProtocolError::InvalidAction(code.to_string()))?;
                let _count: usize = parse_num(tokens.next(), head, "field count")?;
                expect_end(tokens, head)?;
                let patch = Patch::new(old, new, action, parse_document(body)?)?;
                Ok(ServerMessage::Patch { dir_id, patch })
            }
            other => Err(ProtocolError::UnknownKeyword(other.to_string())),
        }
    }
}

/// Incremental decoder over a byte buffer.
///
/// `decode` only consumes bytes once a whole message (head and document
/// lines) is available, so it can be called after every read.
#[derive(Debug)]
pub struct MessageDecoder<M> {
    max_line: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<M: WireMessage> Default for MessageDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: WireMessage> MessageDecoder<M> {
    /// A decoder with the default line limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    /// A decoder refusing lines longer than `max_line` bytes.
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line,
            _marker: PhantomData,
        }
    }

    /// Decodes the next complete message, if the buffer holds one.
    ///
    /// Blank lines between messages are skipped.
    ///
    /// # Errors
    ///
    /// A malformed message is consumed from the buffer before the error is
    /// returned, so the caller may log it and keep decoding.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<M>> {
        loop {
            match buf.iter().position(|b| *b == b'\n') {
                Some(0) => buf.advance(1),
                Some(1) if buf[0] == b'\r' => buf.advance(2),
                Some(_) => break,
                None => return self.check_partial(&buf[..]),
            }
        }

        let mut lines: Vec<&str> = Vec::new();
        let mut consumed = 0;
        let mut wanted = 1;
        while lines.len() < wanted {
            let Some(end) = buf[consumed..].iter().position(|b| *b == b'\n') else {
                return self.check_partial(&buf[consumed..]);
            };
            if end > self.max_line {
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_line,
                });
            }
            let raw = &buf[consumed..consumed + end];
            let line = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .trim_end_matches('\r');
            consumed += end + 1;
            if lines.is_empty() {
                wanted += M::body_lines(line).unwrap_or(0);
            }
            lines.push(line);
        }

        let result = M::parse(lines[0], &lines[1..]);
        buf.advance(consumed);
        result.map(Some)
    }

    fn check_partial<T>(&self, pending: &[u8]) -> ProtocolResult<Option<T>> {
        if pending.len() > self.max_line {
            return Err(ProtocolError::LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(None)
    }
}
