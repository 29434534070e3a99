//! PROXY protocol v2: the binary header.
//!
//! 12-byte magic, `ver_cmd`, `fam_trans`, big-endian `u16` length, then
//! exactly that many bytes of address block.

use std::net::{Ipv4Addr, Ipv6Addr};

use log::warn;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{AddressEnvelope, AddressFamily, DispatchResult, V2_MAGIC};
use crate::error::ProxyError;

const HEADER_LEN: usize = 16;
const COMMAND_LOCAL: u8 = 0x0;
const COMMAND_PROXY: u8 = 0x1;
const FAMILY_UNSPEC: u8 = 0x0;
const FAMILY_INET: u8 = 0x1;
const FAMILY_INET6: u8 = 0x2;
const FAMILY_UNIX: u8 = 0x3;
const PROTO_UNSPEC: u8 = 0x0;
const PROTO_STREAM: u8 = 0x1;
const PROTO_DGRAM: u8 = 0x2;

pub(super) async fn read(
    stream: &TcpStream,
    max_data_length: usize,
) -> Result<DispatchResult, ProxyError> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| map_eof(e))?;

    if header[..12] != V2_MAGIC {
        return Err(ProxyError::BadMagic);
    }

    let ver_cmd = header[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(ProxyError::UnsupportedVersion);
    }
    let command = ver_cmd & 0x0F;
    if command != COMMAND_LOCAL && command != COMMAND_PROXY {
        return Err(ProxyError::UnsupportedCommand);
    }

    let fam_trans = header[13];
    let family_nibble = fam_trans >> 4;
    let proto_nibble = fam_trans & 0x0F;
    if !matches!(family_nibble, FAMILY_UNSPEC | FAMILY_INET | FAMILY_INET6 | FAMILY_UNIX) {
        return Err(ProxyError::UnsupportedFamily);
    }
    if !matches!(proto_nibble, PROTO_UNSPEC | PROTO_STREAM | PROTO_DGRAM) {
        return Err(ProxyError::UnsupportedProtocol);
    }

    let len = u16::from_be_bytes([header[14], header[15]]) as usize;
    if len > max_data_length {
        return Err(ProxyError::DataTooLong(len));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(map_eof)?;

    if command == COMMAND_LOCAL {
        return Ok(DispatchResult::Local);
    }

    match family_nibble {
        FAMILY_UNSPEC => Ok(DispatchResult::Local),
        FAMILY_UNIX => {
            warn!("PROXY v2 header declared AF_UNIX; treating as a no-op address rewrite");
            Ok(DispatchResult::Local)
        }
        FAMILY_INET => {
            if data.len() < 12 {
                return Err(ProxyError::TruncatedAddress);
            }
            let src_addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let dst_addr = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let src_port = u16::from_be_bytes([data[8], data[9]]);
            let dst_port = u16::from_be_bytes([data[10], data[11]]);
            Ok(DispatchResult::Address(AddressEnvelope {
                family: AddressFamily::Tcp4,
                src_addr: src_addr.into(),
                src_port,
                dst_addr: dst_addr.into(),
                dst_port,
            }))
        }
        FAMILY_INET6 => {
            if data.len() < 36 {
                return Err(ProxyError::TruncatedAddress);
            }
            let mut src_octets = [0u8; 16];
            src_octets.copy_from_slice(&data[0..16]);
            let mut dst_octets = [0u8; 16];
            dst_octets.copy_from_slice(&data[16..32]);
            let src_port = u16::from_be_bytes([data[32], data[33]]);
            let dst_port = u16::from_be_bytes([data[34], data[35]]);
            Ok(DispatchResult::Address(AddressEnvelope {
                family: AddressFamily::Tcp6,
                src_addr: Ipv6Addr::from(src_octets).into(),
                src_port,
                dst_addr: Ipv6Addr::from(dst_octets).into(),
                dst_port,
            }))
        }
        _ => unreachable!("family nibble already validated"),
    }
}

fn map_eof(e: std::io::Error) -> ProxyError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProxyError::UnexpectedEof
    } else {
        ProxyError::Io(e)
    }
}
