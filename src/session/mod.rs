//! The per-connection SMTP command dispatcher: state, ordering rules, the
//! DATA/BDAT payload phases, and the STARTTLS upgrade.

mod commands;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::handler::{AuthenticationHandler, MessageEnvelope, MessageHandler};
use crate::tls::SocketFactory;
use crate::transport::Transport;
use crate::wire::{LineReader, Reply};

pub use commands::CommandVerb;

/// Opaque per-session identifier for correlating log lines. Allocated from
/// a process-wide atomic counter owned by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next(counter: &AtomicU64) -> Self {
        SessionId(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A lightweight, cloneable reference the acceptor's registry holds instead
/// of the session itself, so that a cooperative shutdown never needs to
/// touch session-owned state directly (see spec.md §9, "session registry
/// and callbacks").
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    quit_requested: Arc<AtomicBool>,
    quit_notify: Arc<Notify>,
}

impl SessionHandle {
    /// Builds a handle's backing state ahead of the `Session` it will
    /// belong to, so the acceptor can register it in the session registry
    /// before the session is even constructed — see spec.md §5, "session
    /// registration happens-before session submission to the executor."
    /// `Session::new` is given the same `Arc`s so the two stay in sync.
    pub(crate) fn new(session_id: SessionId) -> Self {
        SessionHandle {
            session_id,
            quit_requested: Arc::new(AtomicBool::new(false)),
            quit_notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn quit_parts(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.quit_requested.clone(), self.quit_notify.clone())
    }

    /// Requests the session close at its next command boundary. If the
    /// session is currently blocked reading the next command line (the
    /// common case for an idle connection), the notification wakes it
    /// immediately instead of waiting for the read timeout to elapse — see
    /// spec.md §5 for the distinction from hard cancellation (closing the
    /// socket out from under it).
    pub fn quit(&self) {
        self.quit_requested.store(true, Ordering::Relaxed);
        self.quit_notify.notify_waiters();
    }
}

/// One SMTP conversation: the state spec.md §3 names, plus the I/O stack
/// and host collaborators needed to drive it.
pub struct Session {
    pub session_id: SessionId,
    pub real_remote_address: SocketAddr,
    pub declared_remote_address: SocketAddr,
    pub helo: Option<String>,
    pub from: Option<String>,
    pub recipients: Vec<String>,
    pub tls_active: bool,
    pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
    authenticated: bool,
    /// Accumulates non-final `BDAT` chunks until one arrives with `LAST`,
    /// at which point the whole buffer is delivered. Cleared on delivery
    /// and on `RSET`.
    bdat_buffer: Vec<u8>,

    quit_requested: Arc<AtomicBool>,
    quit_notify: Arc<Notify>,
    io: LineReader<BufReader<Transport>>,
    config: Arc<ServerConfig>,
    message_handler: Arc<dyn MessageHandler>,
    auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    tls_factory: Option<Arc<dyn SocketFactory>>,
}

enum DispatchOutcome {
    Continue,
    Quit,
}

impl Session {
    /// `quit_requested`/`quit_notify` are shared with the `SessionHandle`
    /// the acceptor already placed in the registry before spawning this
    /// session's task — see `SessionHandle::new`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        transport: Transport,
        real_remote_address: SocketAddr,
        declared_remote_address: SocketAddr,
        config: Arc<ServerConfig>,
        message_handler: Arc<dyn MessageHandler>,
        auth_handler: Option<Arc<dyn AuthenticationHandler>>,
        tls_factory: Option<Arc<dyn SocketFactory>>,
        quit_requested: Arc<AtomicBool>,
        quit_notify: Arc<Notify>,
    ) -> Self {
        Session {
            session_id,
            real_remote_address,
            declared_remote_address,
            helo: None,
            from: None,
            recipients: Vec::new(),
            tls_active: false,
            peer_certificates: None,
            authenticated: false,
            bdat_buffer: Vec::new(),
            quit_requested,
            quit_notify,
            io: LineReader::new(BufReader::new(transport)),
            config,
            message_handler,
            auth_handler,
            tls_factory,
        }
    }

    /// Drives the conversation to completion: greeting, command loop, and
    /// either a client QUIT, a protocol-fatal error, or cooperative
    /// shutdown. Never propagates an error to the caller — everything that
    /// can go wrong here just ends the session, matching spec.md §7 ("no
    /// error is allowed to crash the accept loop").
    pub async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            debug!("{}: session ended: {}", self.session_id, e);
        }
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        let greeting = Reply::new(220, format!("{} ESMTP {}", self.config.hostname, self.config.banner));
        self.write_reply(&greeting).await?;

        loop {
            if self.quit_requested.load(Ordering::Relaxed) {
                let _ = self.write_reply(&Reply::new(421, "Service closing")).await;
                return Err(SessionError::Shutdown);
            }

            let timeout = std::time::Duration::from_millis(self.config.reply_timeout_ms);
            let read_result = tokio::select! {
                result = tokio::time::timeout(timeout, self.io.read_line(self.config.max_line_length)) => result,
                _ = self.quit_notify.notified() => {
                    let _ = self.write_reply(&Reply::new(421, "Service closing")).await;
                    return Err(SessionError::Shutdown);
                }
            };
            let line = match read_result {
                Ok(Ok(line)) => line,
                // A malformed or over-long command line is recoverable in
                // command mode (spec.md §4.3: "Command lines exceeding an
                // implementation-defined maximum emit 500 Line too long") —
                // unlike the same error raised while reading DATA payload
                // lines, which handle_data converts to a fatal close itself.
                Ok(Err(SessionError::ProtocolSyntax)) => {
                    self.write_reply(&Reply::new(500, "Line too long or malformed")).await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    let _ = self.write_reply(&Reply::new(421, "Timeout waiting for command")).await;
                    return Err(SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "command read timed out",
                    )));
                }
            };

            trace!("{}: < {:?}", self.session_id, line);

            match self.dispatch(&line).await {
                Ok(DispatchOutcome::Continue) => continue,
                Ok(DispatchOutcome::Quit) => return Ok(()),
                Err(e) => match e.reply() {
                    Some(reply) => {
                        self.write_reply(&reply).await?;
                        continue;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Reads one line with the same timeout/shutdown-responsiveness as the
    /// main command loop in `run_inner`. Used by handlers that block on a
    /// client continuation line mid-command, e.g. the AUTH challenge
    /// responses, so those reads don't hang past `reply_timeout_ms` and
    /// stay reachable by a cooperative `quit()`.
    async fn read_line_racing_shutdown(&mut self) -> Result<String, SessionError> {
        let timeout = std::time::Duration::from_millis(self.config.reply_timeout_ms);
        let read_result = tokio::select! {
            result = tokio::time::timeout(timeout, self.io.read_line(self.config.max_line_length)) => result,
            _ = self.quit_notify.notified() => {
                let _ = self.write_reply(&Reply::new(421, "Service closing")).await;
                return Err(SessionError::Shutdown);
            }
        };
        match read_result {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                let _ = self.write_reply(&Reply::new(421, "Timeout waiting for command")).await;
                Err(SessionError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "command read timed out",
                )))
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<DispatchOutcome, SessionError> {
        let (verb, rest) = commands::split_verb(line);
        debug!("{}: dispatching {:?}", self.session_id, verb);

        match verb {
            CommandVerb::Helo | CommandVerb::Ehlo => self.handle_helo(verb, rest).await,
            CommandVerb::Mail => self.handle_mail(rest).await,
            CommandVerb::Rcpt => self.handle_rcpt(rest).await,
            CommandVerb::Data => self.handle_data().await,
            CommandVerb::Bdat => self.handle_bdat(rest).await,
            CommandVerb::Rset => self.handle_rset().await,
            CommandVerb::Noop => {
                self.write_reply(&Reply::new(250, "OK")).await?;
                Ok(DispatchOutcome::Continue)
            }
            CommandVerb::Vrfy => {
                self.write_reply(&Reply::new(252, "Cannot VRFY user, but will accept message")).await?;
                Ok(DispatchOutcome::Continue)
            }
            CommandVerb::Expn => {
                self.write_reply(&Reply::new(502, "EXPN not supported")).await?;
                Ok(DispatchOutcome::Continue)
            }
            CommandVerb::Help => {
                self.write_reply(&Reply::new(214, "See RFC 5321")).await?;
                Ok(DispatchOutcome::Continue)
            }
            CommandVerb::Auth => self.handle_auth(rest).await,
            CommandVerb::Starttls => self.handle_starttls().await,
            CommandVerb::Quit => {
                self.write_reply(&Reply::new(221, "Bye")).await?;
                Ok(DispatchOutcome::Quit)
            }
            CommandVerb::Unknown => {
                self.write_reply(&Reply::new(500, "Command not recognized")).await?;
                Ok(DispatchOutcome::Continue)
            }
        }
    }

    async fn handle_helo(&mut self, verb: CommandVerb, rest: &str) -> Result<DispatchOutcome, SessionError> {
        let domain = rest.trim();
        if domain.is_empty() {
            self.write_reply(&Reply::new(501, "Syntax error: HELO/EHLO requires a domain")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.helo = Some(domain.to_string());

        if verb == CommandVerb::Ehlo {
            let mut lines = vec![format!("{} Hello {}", self.config.hostname, domain)];
            if self.tls_factory.is_some() && !self.tls_active {
                lines.push("STARTTLS".to_string());
            }
            lines.push(format!("SIZE {}", self.config.max_message_size));
            if self.auth_handler.is_some() && (!self.config.require_tls || self.tls_active) {
                lines.push("AUTH PLAIN LOGIN".to_string());
            }
            let body = crate::wire::render_multiline(250, &lines);
            self.write_raw(&body).await?;
        } else {
            self.write_reply(&Reply::new(250, self.config.hostname.clone())).await?;
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn handle_mail(&mut self, rest: &str) -> Result<DispatchOutcome, SessionError> {
        if self.helo.is_none() {
            self.write_reply(&Reply::new(503, "Error: send HELO/EHLO first")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.config.require_tls && !self.tls_active {
            self.write_reply(&Reply::new(530, "Must issue STARTTLS first")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.config.require_auth && !self.authenticated {
            self.write_reply(&Reply::new(530, "Authentication required")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let address = match commands::extract_address(rest) {
            Some(a) => a,
            None => {
                self.write_reply(&Reply::new(501, "Syntax error in MAIL FROM parameters")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        self.from = Some(address);
        self.recipients.clear();
        self.write_reply(&Reply::new(250, "OK")).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn handle_rcpt(&mut self, rest: &str) -> Result<DispatchOutcome, SessionError> {
        if self.from.is_none() {
            self.write_reply(&Reply::new(503, "Error: need MAIL command")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.recipients.len() >= self.config.max_recipients {
            self.write_reply(&Reply::new(452, "Too many recipients")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let address = match commands::extract_address(rest) {
            Some(a) => a,
            None => {
                self.write_reply(&Reply::new(501, "Syntax error in RCPT TO parameters")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        self.recipients.push(address);
        self.write_reply(&Reply::new(250, "OK")).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn handle_rset(&mut self) -> Result<DispatchOutcome, SessionError> {
        self.from = None;
        self.recipients.clear();
        self.bdat_buffer.clear();
        self.write_reply(&Reply::new(250, "OK")).await?;
        Ok(DispatchOutcome::Continue)
    }

    /// DATA: reads CRLF-delimited lines until the lone-dot terminator,
    /// de-stuffing as it goes, then delivers to the host handler.
    async fn handle_data(&mut self) -> Result<DispatchOutcome, SessionError> {
        if self.recipients.is_empty() {
            self.write_reply(&Reply::new(503, "Error: need RCPT command")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.write_reply(&Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>")).await?;

        let mut data = Vec::new();
        loop {
            let line = match self.io.read_line(self.config.max_line_length).await {
                Ok(line) => line,
                Err(SessionError::ProtocolSyntax) => {
                    // Unlike a syntax error in command mode, a malformed line
                    // inside the DATA payload can't be recovered by replying
                    // and waiting for the next command: the client believes
                    // it's still mid-transfer, so the stream can't be
                    // resynchronized. Close the session per spec.md §4.3/§7.
                    let _ = self.write_reply(&Reply::new(500, "Syntax error in DATA payload")).await;
                    return Err(SessionError::PayloadProtocolViolation);
                }
                Err(e) => return Err(e),
            };
            if line == "." {
                break;
            }
            let payload = if let Some(stripped) = line.strip_prefix('.') {
                stripped
            } else {
                line.as_str()
            };
            if data.len() + payload.len() + 2 > self.config.max_message_size {
                // Like a malformed payload line, this can't be recovered by
                // replying and falling back to command mode: the client is
                // still sending DATA body lines and has no way to know the
                // transfer was abandoned mid-stream. Reply, then close.
                let _ = self
                    .write_reply(&Reply::new(552, "message exceeds the configured size limit"))
                    .await;
                return Err(SessionError::PayloadProtocolViolation);
            }
            data.extend_from_slice(payload.as_bytes());
            data.extend_from_slice(b"\r\n");
        }

        self.deliver(data).await
    }

    /// BDAT: reads exactly `size` raw bytes (no dot-stuffing, no CRLF
    /// framing); `LAST` triggers delivery exactly like DATA's terminator.
    async fn handle_bdat(&mut self, rest: &str) -> Result<DispatchOutcome, SessionError> {
        if self.recipients.is_empty() {
            self.write_reply(&Reply::new(503, "Error: need RCPT command")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        let mut parts = rest.split_whitespace();
        let size: usize = match parts.next().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => {
                self.write_reply(&Reply::new(501, "Syntax error in BDAT size")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        let is_last = matches!(parts.next(), Some(tok) if tok.eq_ignore_ascii_case("LAST"));

        if self.bdat_buffer.len() + size > self.config.max_message_size {
            self.bdat_buffer.clear();
            // The oversized chunk is rejected before it's read off the wire
            // at all (see DESIGN.md), so the client's declared `size` bytes
            // are still sitting unread on the socket. Falling back to
            // command mode would try to parse them as SMTP verbs, so this
            // closes the connection instead, same as a payload framing
            // error.
            let _ = self
                .write_reply(&Reply::new(552, "message exceeds the configured size limit"))
                .await;
            return Err(SessionError::PayloadProtocolViolation);
        }
        let mut chunk = vec![0u8; size];
        self.io.read_exact(&mut chunk).await.map_err(SessionError::Transport)?;
        self.bdat_buffer.extend_from_slice(&chunk);

        if !is_last {
            self.write_reply(&Reply::new(250, "OK")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let data = std::mem::take(&mut self.bdat_buffer);
        self.deliver(data).await
    }

    async fn deliver(&mut self, data: Vec<u8>) -> Result<DispatchOutcome, SessionError> {
        let envelope = MessageEnvelope {
            from: self.from.clone().unwrap_or_default(),
            recipients: self.recipients.clone(),
            data,
        };
        let reply = self.message_handler.handle_message(envelope).await;
        self.from = None;
        self.recipients.clear();
        self.write_reply(&reply).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn handle_auth(&mut self, rest: &str) -> Result<DispatchOutcome, SessionError> {
        let handler = match &self.auth_handler {
            Some(h) => h.clone(),
            None => {
                self.write_reply(&Reply::new(502, "AUTH not available")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        if self.authenticated {
            self.write_reply(&Reply::new(503, "Already authenticated")).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.config.require_tls && !self.tls_active {
            self.write_reply(&Reply::new(530, "Must issue STARTTLS first")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        let mut parts = rest.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        let ok = match mechanism.as_str() {
            "PLAIN" => {
                let data = match initial {
                    Some(d) => d.to_string(),
                    None => {
                        self.write_reply(&Reply::new(334, "")).await?;
                        self.read_line_racing_shutdown().await?
                    }
                };
                match commands::decode_plain(&data) {
                    Some((authzid, authcid, password)) => {
                        handler.authenticate_plain(authzid.as_deref(), &authcid, &password).await
                    }
                    None => {
                        self.write_reply(&Reply::new(501, "Malformed AUTH PLAIN response")).await?;
                        return Ok(DispatchOutcome::Continue);
                    }
                }
            }
            "LOGIN" => {
                self.write_reply(&Reply::new(334, "VXNlcm5hbWU6")).await?;
                let username_line = self.read_line_racing_shutdown().await?;
                self.write_reply(&Reply::new(334, "UGFzc3dvcmQ6")).await?;
                let password_line = self.read_line_racing_shutdown().await?;
                match (commands::decode_base64(&username_line), commands::decode_base64(&password_line)) {
                    (Some(username), Some(password)) => {
                        handler.authenticate_login(&username, &password).await
                    }
                    _ => {
                        self.write_reply(&Reply::new(501, "Malformed AUTH LOGIN response")).await?;
                        return Ok(DispatchOutcome::Continue);
                    }
                }
            }
            _ => {
                self.write_reply(&Reply::new(504, "Unrecognized authentication mechanism")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        if ok {
            self.authenticated = true;
            self.write_reply(&Reply::new(235, "Authentication successful")).await?;
        } else {
            self.write_reply(&Reply::new(535, "Authentication failed")).await?;
        }
        Ok(DispatchOutcome::Continue)
    }

    /// RFC 3207: replaces the plain socket with a TLS one and resets
    /// everything the handshake invalidates the client's prior claims
    /// about.
    async fn handle_starttls(&mut self) -> Result<DispatchOutcome, SessionError> {
        let factory = match &self.tls_factory {
            Some(f) => f.clone(),
            None => {
                self.write_reply(&Reply::new(502, "STARTTLS not available")).await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        if self.tls_active {
            self.write_reply(&Reply::new(503, "Already using TLS")).await?;
            return Ok(DispatchOutcome::Continue);
        }

        self.write_reply(&Reply::new(220, "Ready to start TLS")).await?;

        // `BufReader::into_inner` silently drops any buffered-but-unread
        // bytes; RFC 3207 forbids pipelining past STARTTLS, so there must
        // not be any by the time we get here.
        let placeholder = LineReader::new(BufReader::new(Transport::Upgrading));
        let old_io = std::mem::replace(&mut self.io, placeholder);
        let mut transport = old_io.into_inner().into_inner();

        let result = crate::tls::upgrade(&mut transport, factory.as_ref()).await;
        let peer_certificates = transport.peer_certificates();
        self.io = LineReader::new(BufReader::new(transport));

        match result {
            Ok(()) => {
                self.tls_active = true;
                self.peer_certificates = peer_certificates;
                self.helo = None;
                self.from = None;
                self.recipients.clear();
                Ok(DispatchOutcome::Continue)
            }
            Err(e) => {
                warn!("{}: TLS handshake failed: {}", self.session_id, e);
                Err(SessionError::Transport(e))
            }
        }
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        trace!("{}: > {}", self.session_id, reply);
        self.write_raw(&reply.to_line()).await
    }

    async fn write_raw(&mut self, line: &str) -> Result<(), SessionError> {
        let io = self.io.get_mut();
        io.write_all(line.as_bytes()).await.map_err(SessionError::Transport)?;
        io.flush().await.map_err(SessionError::Transport)?;
        Ok(())
    }
}
