//! Host-facing collaborator traits: the message sink and the optional
//! authentication backend. Both are "external collaborators" per spec.md §1
//! — this crate defines the seam, the embedding application supplies the
//! implementation.

use async_trait::async_trait;

use crate::wire::Reply;

/// One complete SMTP transaction, ready for the host to accept or reject.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub from: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Consumes a delivered message and decides whether to accept it.
///
/// Implementations choose the reply code: `250`-family for acceptance,
/// `4xx` for a transient rejection the client should retry, `5xx` for a
/// permanent one. The session forwards whichever `Reply` is returned
/// verbatim to the client.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, envelope: MessageEnvelope) -> Reply;
}

/// Accepts every message unconditionally with `250 OK`. Useful as a
/// starting point for embedders and in tests.
pub struct AcceptAllHandler;

#[async_trait]
impl MessageHandler for AcceptAllHandler {
    async fn handle_message(&self, _envelope: MessageEnvelope) -> Reply {
        Reply::new(250, "OK")
    }
}

/// Implements the SMTP AUTH exchange (RFC 4954). Optional: a `Session`
/// without one simply never advertises `AUTH` and rejects the command with
/// `502`.
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    /// `AUTH PLAIN`: `authzid` is the optional authorization identity,
    /// `authcid` the authentication identity, both already base64-decoded.
    async fn authenticate_plain(&self, authzid: Option<&str>, authcid: &str, password: &str) -> bool;

    /// `AUTH LOGIN`: username and password collected over two `334`
    /// challenge/response round-trips, already base64-decoded.
    async fn authenticate_login(&self, username: &str, password: &str) -> bool;
}
