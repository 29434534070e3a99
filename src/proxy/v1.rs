//! PROXY protocol v1: the ASCII text header.
//!
//! `PROXY (UNKNOWN|TCP4|TCP6)( SRC DST SPORT DPORT)? CRLF`, at most 107
//! bytes including the `PROXY ` prefix and the terminating CRLF.

use std::net::{IpAddr, Ipv6Addr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{AddressEnvelope, AddressFamily, DispatchResult};
use crate::error::ProxyError;

const MAX_V1_LINE: usize = 107;

/// Consumes (not peeks) the v1 header from `stream`, byte at a time, up to
/// the `CRLF` terminator. The dispatcher has already confirmed the leading
/// `"PROXY "` bytes are present via a non-destructive peek; this read
/// actually drains them off the wire.
pub(super) async fn read(stream: &TcpStream) -> Result<DispatchResult, ProxyError> {
    let mut buf = Vec::with_capacity(MAX_V1_LINE);
    let mut byte = [0u8; 1];
    let mut seen_cr = false;

    loop {
        if buf.len() >= MAX_V1_LINE {
            return Err(ProxyError::HeaderTooLong);
        }
        let n = stream.read(&mut byte).await.map_err(ProxyError::Io)?;
        if n == 0 {
            return Err(ProxyError::UnexpectedEof);
        }
        let b = byte[0];
        if seen_cr {
            if b != b'\n' {
                return Err(ProxyError::MissingCrlf);
            }
            break;
        }
        if b == b'\r' {
            seen_cr = true;
            continue;
        }
        buf.push(b);
    }

    let line = std::str::from_utf8(&buf)
        .map_err(|_| ProxyError::GrammarMismatch("header is not valid UTF-8".into()))?;
    parse_line(line)
}

fn parse_line(line: &str) -> Result<DispatchResult, ProxyError> {
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.first() != Some(&"PROXY") {
        return Err(ProxyError::GrammarMismatch(format!(
            "missing PROXY keyword: {:?}",
            line
        )));
    }
    let proto = *tokens
        .get(1)
        .ok_or_else(|| ProxyError::GrammarMismatch("missing protocol token".into()))?;

    match proto {
        "UNKNOWN" => Ok(DispatchResult::Local),
        "TCP4" | "TCP6" => {
            if tokens.len() != 6 {
                return Err(ProxyError::GrammarMismatch(format!(
                    "expected 6 space-separated tokens, got {}",
                    tokens.len()
                )));
            }
            let family = if proto == "TCP4" {
                AddressFamily::Tcp4
            } else {
                AddressFamily::Tcp6
            };
            let src_addr = parse_address(family, tokens[2])?;
            let dst_addr = parse_address(family, tokens[3])?;
            let src_port = parse_port(tokens[4])?;
            let dst_port = parse_port(tokens[5])?;
            Ok(DispatchResult::Address(AddressEnvelope {
                family,
                src_addr,
                src_port,
                dst_addr,
                dst_port,
            }))
        }
        other => Err(ProxyError::GrammarMismatch(format!(
            "unrecognized protocol token: {:?}",
            other
        ))),
    }
}

fn parse_address(family: AddressFamily, s: &str) -> Result<IpAddr, ProxyError> {
    match family {
        AddressFamily::Tcp4 => parse_ipv4_canonical(s)
            .map(IpAddr::V4)
            .ok_or(ProxyError::FamilyMismatch),
        AddressFamily::Tcp6 => s
            .parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|_| ProxyError::FamilyMismatch),
    }
}

/// Canonical dotted-decimal IPv4: exactly four octets, no leading zeros
/// (so `std`'s otherwise-equivalent parser isn't used — it doesn't enforce
/// this and the grammar in spec.md §4.2.1 does).
fn parse_ipv4_canonical(s: &str) -> Option<std::net::Ipv4Addr> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        octets[i] = part.parse().ok()?;
    }
    Some(std::net::Ipv4Addr::from(octets))
}

fn parse_port(s: &str) -> Result<u16, ProxyError> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::PortOutOfRange);
    }
    let value: u32 = s.parse().map_err(|_| ProxyError::PortOutOfRange)?;
    if value == 0 || value > 65535 {
        return Err(ProxyError::PortOutOfRange);
    }
    Ok(value as u16)
}
