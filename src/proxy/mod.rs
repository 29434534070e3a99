//! PROXY-protocol preamble dispatch: peek the leading bytes of a freshly
//! accepted socket, decide v1/v2/none, and rewrite the session's notion of
//! the peer address before the SMTP greeting is ever sent.

pub mod v1;
pub mod v2;

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// The 12-byte magic that opens every PROXY protocol v2 header.
pub const V2_MAGIC: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V1_PREFIX: &[u8; 6] = b"PROXY ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Tcp4,
    Tcp6,
}

/// The source/destination pair a PROXY header declares. Only `src_*`
/// influences the session; `dst_*` is parsed for format validation and then
/// discarded, per spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEnvelope {
    pub family: AddressFamily,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

/// How strictly the dispatcher enforces the presence of a PROXY preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Never probe for a preamble; every connection is plain SMTP.
    Disabled,
    /// Probe for a preamble; accept the connection whether or not one is
    /// present.
    Permissive,
    /// Probe for a preamble; reject connections that don't present one.
    Required,
}

/// Outcome of running the dispatcher against a freshly-accepted socket.
#[derive(Debug)]
pub enum DispatchResult {
    /// No PROXY preamble was present (or the dispatcher is disabled); the
    /// real TCP peer address is authoritative.
    NoOp,
    /// A header was present but declared `UNKNOWN`/`LOCAL`/`UNSPEC`/`UNIX`;
    /// same effect as `NoOp`, distinguished only for logging.
    Local,
    /// The header declared a source address that replaces the session's
    /// notion of the peer.
    Address(AddressEnvelope),
}

/// Runs the dispatcher. `probe_timeout` bounds how long it waits for a
/// preamble to arrive before concluding the peer isn't sending one — real
/// SMTP clients wait for the server's greeting and so never send anything
/// unprompted, while PROXY-protocol-speaking upstreams send their header
/// immediately on connect, so a short timeout cleanly distinguishes the two
/// without spec.md mandating a specific value.
pub async fn dispatch(
    stream: &TcpStream,
    mode: ProxyMode,
    max_v2_data_length: usize,
    probe_timeout: Duration,
) -> Result<DispatchResult, ProxyError> {
    if mode == ProxyMode::Disabled {
        return Ok(DispatchResult::NoOp);
    }

    let probe = match tokio::time::timeout(probe_timeout, peek_prefix(stream)).await {
        Ok(result) => result?,
        Err(_) => Vec::new(),
    };

    if probe.len() == 12 && probe == V2_MAGIC {
        return v2::read(stream, max_v2_data_length).await;
    }
    if probe.len() >= 6 && &probe[..6] == V1_PREFIX {
        return v1::read(stream).await;
    }

    match mode {
        ProxyMode::Required => Err(ProxyError::GrammarMismatch(
            "no PROXY preamble present within the probe window".into(),
        )),
        ProxyMode::Permissive | ProxyMode::Disabled => Ok(DispatchResult::NoOp),
    }
}

/// Peeks (non-destructively) up to 12 leading bytes, waiting for at least
/// one readable event. Stops early once the peeked bytes are long enough to
/// rule out both prefixes.
async fn peek_prefix(stream: &TcpStream) -> Result<Vec<u8>, ProxyError> {
    let mut buf = [0u8; 12];
    loop {
        stream.readable().await.map_err(ProxyError::Io)?;
        let n = stream.peek(&mut buf).await.map_err(ProxyError::Io)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if n >= 12 {
            return Ok(buf.to_vec());
        }
        if n >= 6 && &buf[..6] != V1_PREFIX {
            return Ok(buf[..n].to_vec());
        }
    }
}
