//! Line-oriented wire primitives: CRLF-terminated line reads, the
//! dot-terminated / dot-stuffed output stack used during DATA, and the
//! multi-line reply grammar shared by the server's writer and the test
//! client's reader.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

/// Default ceiling on a single command/reply line, independent of any
/// `ServerConfig` override (see `config::ServerConfig::max_line_length`).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// A single SMTP reply: a three-digit status code and free-form text.
///
/// `code < 400` is success per spec; the server never constructs a `Reply`
/// outside `[100, 599]`, though that range is not enforced here — it is a
/// contract of the call sites, not the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Reply {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// Renders as a single wire line: `"NNN message\r\n"`.
    pub fn to_line(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Renders a multi-line reply (e.g. EHLO's capability list): every line but
/// the last is continued with `-`, the last with a space, all sharing
/// `code`. Panics if `lines` is empty — callers always have at least the
/// greeting text to send.
pub fn render_multiline<S: AsRef<str>>(code: u16, lines: &[S]) -> String {
    assert!(!lines.is_empty(), "a multi-line reply needs at least one line");
    let last = lines.len() - 1;
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let sep = if i == last { ' ' } else { '-' };
        out.push_str(&format!("{}{}{}\r\n", code, sep, line.as_ref()));
    }
    out
}

/// Reads CRLF-terminated lines with strict discipline: a line terminated by
/// a bare LF (no preceding CR) is a syntax error, and EOF before any
/// terminator is seen is a transport error, not a normal end-of-stream.
pub struct LineReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads exactly `buf.len()` raw bytes, bypassing line framing. Used for
    /// BDAT's size-prefixed binary payload, which has no CRLF structure of
    /// its own.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        tokio::io::AsyncReadExt::read_exact(&mut self.inner, buf).await?;
        Ok(())
    }

    /// Reads one line, stripping the trailing CRLF. `max_len` bounds the
    /// line's length excluding the terminator.
    pub async fn read_line(&mut self, max_len: usize) -> Result<String, SessionError> {
        let mut buf = Vec::new();
        let n = self
            .inner
            .read_until(b'\n', &mut buf)
            .await
            .map_err(SessionError::Transport)?;

        if n == 0 {
            return Err(SessionError::Transport(unexpected_eof(
                "connection closed before a line was read",
            )));
        }
        if buf.last() != Some(&b'\n') {
            return Err(SessionError::Transport(unexpected_eof(
                "connection closed mid-line",
            )));
        }
        buf.pop();
        if !buf.pop_if_cr() {
            return Err(SessionError::ProtocolSyntax);
        }
        if buf.len() > max_len {
            return Err(SessionError::ProtocolSyntax);
        }
        String::from_utf8(buf).map_err(|_| SessionError::ProtocolSyntax)
    }
}

trait PopIfCr {
    fn pop_if_cr(&mut self) -> bool;
}

impl PopIfCr for Vec<u8> {
    fn pop_if_cr(&mut self) -> bool {
        if self.last() == Some(&b'\r') {
            self.pop();
            true
        } else {
            false
        }
    }
}

fn unexpected_eof(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg.to_string())
}

/// Errors parsing the client-side multi-line reply grammar.
#[derive(Error, Debug)]
pub enum ReplyParseError {
    #[error("malformed SMTP reply line: {0}")]
    MalformedReply(String),
    #[error("I/O error reading SMTP reply: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_reply_line(line: &str) -> Result<(u16, bool, &str), ReplyParseError> {
    if line.len() < 4 {
        return Err(ReplyParseError::MalformedReply(format!(
            "line shorter than 4 characters: {:?}",
            line
        )));
    }
    let code: u16 = line[..3].parse().map_err(|_| {
        ReplyParseError::MalformedReply(format!("non-numeric status code: {:?}", &line[..3]))
    })?;
    match line.as_bytes()[3] {
        b'-' => Ok((code, true, &line[4..])),
        b' ' => Ok((code, false, &line[4..])),
        _ => Err(ReplyParseError::MalformedReply(format!(
            "missing '-'/' ' separator after status code: {:?}",
            line
        ))),
    }
}

/// Assembles a (possibly multi-line) reply from already-split wire lines.
/// The returned `message` joins each line's text with `\n`; `code` is the
/// code on the final (non-continuation) line. Callers supply lines one at a
/// time from whatever line source they have (async for the server, blocking
/// for the test client) and stop feeding once this returns `Ok`.
pub struct ReplyAssembler {
    code: Option<u16>,
    fragments: Vec<String>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        ReplyAssembler {
            code: None,
            fragments: Vec::new(),
        }
    }

    /// Feeds one more wire line. Returns `Some(Reply)` once the final line
    /// of the reply has been consumed.
    pub fn feed(&mut self, line: &str) -> Result<Option<Reply>, ReplyParseError> {
        let (code, continuation, text) = parse_reply_line(line)?;
        if let Some(first_code) = self.code {
            if first_code != code {
                return Err(ReplyParseError::MalformedReply(format!(
                    "reply code changed mid-multiline: {} != {}",
                    first_code, code
                )));
            }
        } else {
            self.code = Some(code);
        }
        self.fragments.push(text.to_string());
        if continuation {
            Ok(None)
        } else {
            Ok(Some(Reply::new(code, self.fragments.join("\n"))))
        }
    }
}

impl Default for ReplyAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a raw writer, appending the `CRLF . CRLF` DATA terminator on
/// `finish`. A leading CRLF is only inserted if the payload's last written
/// bytes were not already CRLF, so the terminator always lands on its own
/// line regardless of the payload's trailer.
pub struct DotTerminatedWriter<W> {
    inner: W,
    last_two: [u8; 2],
}

impl<W: AsyncWrite + Unpin> DotTerminatedWriter<W> {
    pub fn new(inner: W) -> Self {
        DotTerminatedWriter {
            inner,
            last_two: [0, 0],
        }
    }

    pub async fn write_payload(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data).await?;
        match data.len() {
            0 => {}
            1 => self.last_two = [self.last_two[1], data[0]],
            _ => self.last_two = [data[data.len() - 2], data[data.len() - 1]],
        }
        Ok(())
    }

    /// Writes the `CRLF . CRLF` terminator, flushes, and returns the inner
    /// writer.
    pub async fn finish(mut self) -> std::io::Result<W> {
        if self.last_two != [b'\r', b'\n'] {
            self.inner.write_all(b"\r\n").await?;
        }
        self.inner.write_all(b".\r\n").await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

/// Wraps a [`DotTerminatedWriter`], stuffing a leading extra `.` onto any
/// payload line that itself begins with `.`. Line starts are tracked by
/// observing CRLF in the byte stream as it is written, so stuffing is
/// correct across arbitrarily-chunked `write_payload` calls.
pub struct DotStuffingWriter<W> {
    inner: DotTerminatedWriter<W>,
    at_line_start: bool,
    prev_byte: u8,
}

impl<W: AsyncWrite + Unpin> DotStuffingWriter<W> {
    pub fn new(inner: DotTerminatedWriter<W>) -> Self {
        DotStuffingWriter {
            inner,
            at_line_start: true,
            prev_byte: 0,
        }
    }

    pub async fn write_payload(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut seg_start = 0;
        for i in 0..data.len() {
            let b = data[i];
            if self.at_line_start && b == b'.' {
                self.inner.write_payload(&data[seg_start..i]).await?;
                self.inner.write_payload(b".").await?;
                seg_start = i;
            }
            self.at_line_start = false;
            let prev = if i == 0 { self.prev_byte } else { data[i - 1] };
            if b == b'\n' && prev == b'\r' {
                self.at_line_start = true;
            }
        }
        self.inner.write_payload(&data[seg_start..]).await?;
        if let Some(&last) = data.last() {
            self.prev_byte = last;
        }
        Ok(())
    }

    pub async fn finish(self) -> std::io::Result<W> {
        self.inner.finish().await
    }
}
