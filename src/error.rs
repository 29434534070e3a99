//! Typed error kinds for the protocol-level subsystems.
//!
//! These are distinct from the `anyhow::Error` used at task-spawning
//! boundaries (see `lib.rs` and `acceptor.rs`): a `SessionError` knows
//! whether it is recoverable (the session keeps running and sends a reply)
//! or fatal (the session closes), which `anyhow::Error` cannot express.

use thiserror::Error;

/// Errors raised while parsing a PROXY protocol v1 or v2 preamble.
///
/// Any `ProxyError` is fatal to the connection: spec requires that a
/// malformed preamble close the socket before the SMTP greeting is ever
/// sent (see [`crate::proxy`]).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("connection closed before a complete PROXY header was read")]
    UnexpectedEof,
    #[error("PROXY v1 header exceeded the maximum line length")]
    HeaderTooLong,
    #[error("PROXY v1 header is missing the CRLF terminator")]
    MissingCrlf,
    #[error("PROXY v1 header does not match the expected grammar: {0}")]
    GrammarMismatch(String),
    #[error("PROXY v1 source address family does not match the declared protocol")]
    FamilyMismatch,
    #[error("PROXY v1 port out of range")]
    PortOutOfRange,
    #[error("PROXY v2 magic bytes did not match")]
    BadMagic,
    #[error("PROXY v2 header declares an unsupported version")]
    UnsupportedVersion,
    #[error("PROXY v2 header declares an unsupported command")]
    UnsupportedCommand,
    #[error("PROXY v2 header declares an unsupported address family")]
    UnsupportedFamily,
    #[error("PROXY v2 header declares an unsupported transport protocol")]
    UnsupportedProtocol,
    #[error("PROXY v2 address block length {0} exceeds the configured maximum")]
    DataTooLong(usize),
    #[error("PROXY v2 address block is shorter than the declared family requires")]
    TruncatedAddress,
    #[error("I/O error while reading the PROXY preamble: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while a [`crate::session::Session`] drives a single SMTP
/// conversation.
///
/// `Protocol*` variants are recovered locally: the session writes a 4xx/5xx
/// reply and keeps running. `Transport` and `Shutdown` are fatal: the
/// session closes without further replies (or, for `Shutdown`, after one
/// last `421`).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("malformed command line")]
    ProtocolSyntax,
    #[error("command not valid in the current state")]
    ProtocolState,
    #[error("authentication required")]
    AuthRequired,
    #[error("TLS required")]
    TlsRequired,
    #[error("message rejected by handler: {code} {message}")]
    MessageRejected { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("cooperative shutdown requested")]
    Shutdown,
    /// A protocol-syntax violation encountered while reading DATA/BDAT
    /// payload bytes. Unlike `ProtocolSyntax` in command mode, this is
    /// unrecoverable: the client believes it is still mid-transfer, so the
    /// stream can't be resynchronized to a command boundary (spec.md §4.3,
    /// §7). The caller has already written the client-facing reply.
    #[error("protocol violation in DATA/BDAT payload")]
    PayloadProtocolViolation,
}

impl SessionError {
    /// The reply that should be sent to the client for this error, if any.
    ///
    /// `Transport` and `Shutdown` do not produce a reply here: `Transport`
    /// means the socket is unusable, and `Shutdown`'s `421` is written by
    /// the caller before the error is even constructed (see
    /// [`crate::session::Session::run`]).
    pub fn reply(&self) -> Option<crate::wire::Reply> {
        match self {
            SessionError::ProtocolSyntax => {
                Some(crate::wire::Reply::new(500, "Syntax error"))
            }
            SessionError::ProtocolState => {
                Some(crate::wire::Reply::new(503, "Bad sequence of commands"))
            }
            SessionError::AuthRequired | SessionError::TlsRequired => {
                Some(crate::wire::Reply::new(530, "Authentication required"))
            }
            SessionError::MessageRejected { code, message } => {
                Some(crate::wire::Reply::new(*code, message.clone()))
            }
            SessionError::Transport(_)
            | SessionError::Shutdown
            | SessionError::PayloadProtocolViolation => None,
        }
    }
}
