//! A minimal blocking SMTP client. This exists only to pin the wire
//! contract the server must satisfy in tests — it is not part of the
//! library's embedding surface and is deliberately feature-poor.
//!
//! The public surface is synchronous, matching how a test would naturally
//! be written, but internally it drives the same async line/dot-stuffing
//! primitives the server uses (`crate::wire`) over a dedicated
//! current-thread Tokio runtime, rather than duplicating that logic in
//! blocking `std::io` code.

use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

use crate::wire::{DotStuffingWriter, DotTerminatedWriter, LineReader, Reply, ReplyAssembler, ReplyParseError};

/// A reply was read successfully but the grammar or the code didn't match
/// what the client expected at this point in the conversation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed reply: {0}")]
    Parse(#[from] ReplyParseError),
    #[error("server rejected the command: {0}")]
    Rejected(Reply),
}

/// Per-command read timeout: generous because this client exists to pin
/// correctness, not to stress-test the server's own timeout handling.
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// A connected SMTP conversation. Every method blocks the calling thread
/// until the operation completes or times out.
pub struct SmtpClient {
    runtime: Runtime,
    io: LineReader<BufReader<TcpStream>>,
}

impl SmtpClient {
    /// Connects to `addr` and reads (but does not validate) the greeting.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building a current-thread Tokio runtime");
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::other("no socket address resolved"))?;

        let stream = runtime.block_on(async move {
            tokio::time::timeout(READ_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
        })?;

        let mut client = SmtpClient {
            runtime,
            io: LineReader::new(BufReader::new(stream)),
        };
        client.read_reply()?;
        Ok(client)
    }

    /// Sends a raw command line (without CRLF) and returns the parsed
    /// reply. Errors if the reply's status code is `>= 400`.
    pub fn command(&mut self, line: &str) -> Result<Reply, ClientError> {
        self.send_line(line)?;
        let reply = self.read_reply()?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ClientError::Rejected(reply))
        }
    }

    /// Like [`Self::command`], but returns the reply regardless of its
    /// status code — for tests asserting on a rejection.
    pub fn command_allow_failure(&mut self, line: &str) -> Result<Reply, ClientError> {
        self.send_line(line)?;
        self.read_reply()
    }

    /// Sends `DATA`, then the dot-stuffed/dot-terminated message body, and
    /// returns the final reply.
    pub fn send_data(&mut self, body: &[u8]) -> Result<Reply, ClientError> {
        let go_ahead = self.command("DATA")?;
        debug_assert_eq!(go_ahead.code, 354);

        let io = self.io.get_mut();
        let body = body.to_vec();
        self.runtime.block_on(async move {
            let terminated = DotTerminatedWriter::new(io);
            let mut stuffing = DotStuffingWriter::new(terminated);
            stuffing.write_payload(&body).await?;
            stuffing.finish().await?;
            Ok::<(), std::io::Error>(())
        })?;

        self.read_reply()
    }

    /// Sends `QUIT` and returns the final reply without closing the socket
    /// itself (dropping `self` does that).
    pub fn quit(&mut self) -> Result<Reply, ClientError> {
        self.command("QUIT")
    }

    fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        let io = self.io.get_mut();
        let full_line = format!("{}\r\n", line);
        self.runtime.block_on(async move {
            io.write_all(full_line.as_bytes()).await?;
            io.flush().await
        })?;
        Ok(())
    }

    /// Reads one (possibly multi-line) reply.
    fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut assembler = ReplyAssembler::new();
        loop {
            let line = self.runtime.block_on(async {
                tokio::time::timeout(READ_TIMEOUT, self.io.read_line(crate::wire::DEFAULT_MAX_LINE_LENGTH))
                    .await
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "reply read timed out"))?
                    .map_err(|e| match e {
                        crate::error::SessionError::Transport(io_err) => io_err,
                        other => std::io::Error::other(other.to_string()),
                    })
            })?;
            if let Some(reply) = assembler.feed(&line)? {
                return Ok(reply);
            }
        }
    }
}
