//! The line-oriented dictionary protocol spoken on the local socket.
//!
//! A request and a response share one shape: a status line, any number of
//! data lines (`Name: value` with space/tab continuation), and a
//! terminating empty line.  Requests are parsed with a filter that
//! normalizes names and rejects internal ones; response parsing is case
//! preserving.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::keyvalue::Dict;

/// Maximum length of an input line in octets.
pub const MAX_LINE_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line too long")]
    Truncated,
    #[error("unexpected EOF")]
    Eof,
    #[error("protocol violation")]
    Violation,
    #[error("invalid name")]
    InvalidName,
    #[error("invalid response")]
    InvalidResponse,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed status line of a response.
#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    Ok(String),
    Err { code: u32, desc: String },
}

/// Check whether STRING starts with KEYWORD delimited by end of string,
/// space or tab.  Returns the rest of the string with leading whitespace
/// removed.
pub fn has_leading_keyword<'a>(string: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = string.strip_prefix(keyword)?;
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some(rest.trim_start_matches([' ', '\t']))
}

/// Read one line, stripping the LF and an optional preceding CR.  Returns
/// None at end of input.  Lines longer than [`MAX_LINE_LEN`] yield
/// [`ProtocolError::Truncated`].
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, ProtocolError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                buf.extend_from_slice(&chunk[..pos]);
                reader.consume(pos + 1);
                break;
            }
            None => {
                let n = chunk.len();
                buf.extend_from_slice(chunk);
                reader.consume(n);
            }
        }
        if buf.len() > MAX_LINE_LEN {
            return Err(ProtocolError::Truncated);
        }
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(ProtocolError::Truncated);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Transform a data line name into the standard capitalized format, e.g.
/// "content-type" -> "Content-Type".  Parts inside brackets are not
/// changed.
fn capitalize_name(name: &str) -> String {
    let mut first = true;
    let mut bracket = 0u32;
    name.chars()
        .map(|c| {
            if bracket > 0 {
                if c == ']' {
                    bracket -= 1;
                }
                c
            } else if c == '[' {
                bracket += 1;
                c
            } else if c == '-' {
                first = true;
                c
            } else if first {
                first = false;
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

/// Store one data line.  With FILTER set, names are capitalized and names
/// not starting with an uppercase letter are rejected; this keeps clients
/// from smuggling internal `_` items into the dictionary.
fn store_data_line(line: &str, filter: bool, dict: &mut Dict) -> Result<(), ProtocolError> {
    if line.starts_with([' ', '\t']) {
        // Continuation of the previous value.
        if !dict.append_with_nl(&line[1..]) {
            return Err(ProtocolError::Violation);
        }
        return Ok(());
    }

    let (name, value) = line.split_once(':').ok_or(ProtocolError::Violation)?;
    let name = if filter {
        let name = capitalize_name(name);
        if !name.as_bytes().first().is_some_and(u8::is_ascii_uppercase) {
            return Err(ProtocolError::InvalidName);
        }
        name
    } else {
        name.to_string()
    };

    if dict.contains(&name) {
        return Err(ProtocolError::Violation);
    }
    dict.put(&name, value.trim_start_matches([' ', '\t']));
    Ok(())
}

async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    filter: bool,
) -> Result<(String, Dict), ProtocolError> {
    let status = read_line(reader).await?.ok_or(ProtocolError::Eof)?;

    let mut dict = Dict::new();
    loop {
        let line = read_line(reader).await?.ok_or(ProtocolError::Eof)?;
        if line.is_empty() {
            break;
        }
        if line.starts_with('#') {
            continue;
        }
        store_data_line(&line, filter, &mut dict)?;
    }
    Ok((status, dict))
}

/// Read a request: the command line plus the data items.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(String, Dict), ProtocolError> {
    read_message(reader, true).await
}

/// Read a response: the status line plus the data items, names kept as
/// sent.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(Status, Dict), ProtocolError> {
    let (status, dict) = read_message(reader, false).await?;

    if let Some(text) = has_leading_keyword(&status, "OK") {
        return Ok((Status::Ok(text.to_string()), dict));
    }
    let rest = has_leading_keyword(&status, "ERR").ok_or(ProtocolError::InvalidResponse)?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let code: u32 = rest[..end].parse().map_err(|_| ProtocolError::Violation)?;
    if code == 0 {
        return Err(ProtocolError::Violation);
    }
    let desc = rest[end..]
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .to_string();
    Ok((Status::Err { code, desc }, dict))
}

/// A reply under construction.  The terminating empty line is appended by
/// [`finish`](Reply::finish); the composed text is written to the client in
/// one piece.
#[derive(Debug, Default)]
pub struct Reply {
    buf: String,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self) {
        self.buf.push_str("OK\n");
    }

    pub fn ok_with(&mut self, text: &str) {
        self.buf.push_str("OK ");
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    pub fn err(&mut self, code: u32, desc: &str) {
        self.buf.push_str(&format!("ERR {code} ({desc})\n"));
    }

    pub fn comment(&mut self, text: &str) {
        self.buf.push_str("# ");
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    /// Write one data line.  Embedded newlines are emitted using the
    /// continuation grammar; a trailing newline is swallowed.
    pub fn data(&mut self, name: &str, value: &str) {
        self.buf.push_str(name);
        self.buf.push_str(": ");
        let mut chars = value.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\n' {
                if chars.peek().is_some() {
                    self.buf.push_str("\n ");
                }
            } else {
                self.buf.push(c);
            }
        }
        self.buf.push('\n');
    }

    pub fn data_opt(&mut self, name: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.data(name, value);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.buf.lines()
    }

    /// Terminate the reply and return the bytes to send.
    pub fn finish(mut self) -> String {
        self.buf.push('\n');
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    async fn parse_request(input: &str) -> Result<(String, Dict), ProtocolError> {
        let mut reader = BufReader::new(input.as_bytes());
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn request_parsing_normalizes_names() {
        let (cmd, dict) = parse_request(
            "CHECKAMOUNT\namount: 10.42\nCURRENCY: EUR\nmeta[aCcount]: 1\n\n",
        )
        .await
        .unwrap();
        assert_eq!(cmd, "CHECKAMOUNT");
        assert_eq!(dict.get("Amount"), Some("10.42"));
        assert_eq!(dict.get("Currency"), Some("EUR"));
        // Bracket contents are copied verbatim.
        assert_eq!(dict.get("Meta[aCcount]"), Some("1"));
    }

    #[tokio::test]
    async fn request_parsing_handles_continuation_and_comments() {
        let (_, dict) = parse_request("PING\nDesc: line1\n line2\n\tline3\n# note\n\n")
            .await
            .unwrap();
        assert_eq!(dict.get("Desc"), Some("line1\nline2\nline3"));
    }

    #[tokio::test]
    async fn request_parsing_rejects_bad_input() {
        assert!(matches!(
            parse_request("PING\n_secret: 1\n\n").await,
            Err(ProtocolError::InvalidName)
        ));
        assert!(matches!(
            parse_request("PING\n1abc: 1\n\n").await,
            Err(ProtocolError::InvalidName)
        ));
        assert!(matches!(
            parse_request("PING\nFoo: 1\nFoo: 2\n\n").await,
            Err(ProtocolError::Violation)
        ));
        assert!(matches!(
            parse_request("PING\nno colon\n\n").await,
            Err(ProtocolError::Violation)
        ));
        assert!(matches!(
            parse_request("PING\n orphan continuation\n\n").await,
            Err(ProtocolError::Violation)
        ));
        assert!(matches!(
            parse_request("PING\nFoo: 1\n").await,
            Err(ProtocolError::Eof)
        ));
        let long = format!("PING\nFoo: {}\n\n", "x".repeat(MAX_LINE_LEN));
        assert!(matches!(
            parse_request(&long).await,
            Err(ProtocolError::Truncated)
        ));
    }

    #[tokio::test]
    async fn crlf_is_accepted() {
        let (cmd, dict) = parse_request("PING\r\nFoo: bar\r\n\r\n").await.unwrap();
        assert_eq!(cmd, "PING");
        assert_eq!(dict.get("Foo"), Some("bar"));
    }

    #[tokio::test]
    async fn response_parsing() {
        let mut reader = BufReader::new(&b"OK pong\n_SESSID: abc\n\n"[..]);
        let (status, dict) = read_response(&mut reader).await.unwrap();
        assert_eq!(status, Status::Ok("pong".to_string()));
        // Response parsing is case preserving and allows internal names.
        assert_eq!(dict.get("_SESSID"), Some("abc"));

        let mut reader = BufReader::new(&b"ERR 17 (bad value)\n\n"[..]);
        let (status, _) = read_response(&mut reader).await.unwrap();
        assert_eq!(
            status,
            Status::Err { code: 17, desc: "bad value".to_string() }
        );

        let mut reader = BufReader::new(&b"WAT\n\n"[..]);
        assert!(matches!(
            read_response(&mut reader).await,
            Err(ProtocolError::InvalidResponse)
        ));
    }

    #[tokio::test]
    async fn reply_round_trips_through_response_parser() {
        let mut reply = Reply::new();
        reply.ok();
        reply.data("Desc", "line1\nline2");
        reply.data("Tail", "end\n");
        let text = reply.finish();
        assert_eq!(text, "OK\nDesc: line1\n line2\nTail: end\n\n");

        let mut reader = BufReader::new(text.as_bytes());
        let (status, dict) = read_response(&mut reader).await.unwrap();
        assert_eq!(status, Status::Ok(String::new()));
        assert_eq!(dict.get("Desc"), Some("line1\nline2"));
        assert_eq!(dict.get("Tail"), Some("end"));
    }
}
