//! Fixed-offset IP and transport header inspection.
//!
//! Everything here is a pure slice read at the offsets the network layer
//! guarantees. Two limitations are inherited from the capture layer and
//! documented rather than fixed: IPv4 options are not parsed (the transport
//! header is taken at the fixed 20-byte offset) and IPv6 extension headers
//! are not walked (transport at offset 40, claimed length taken as
//! 40 + payload length).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;
pub const TCP_ECE: u8 = 0x40;
pub const TCP_CWR: u8 = 0x80;

pub const DNS_PORT: u16 = 53;

const V4_HEADER_LEN: usize = 20;
const V6_HEADER_LEN: usize = 40;

/// Offset of the TCP flags byte within the transport header.
const TCP_FLAGS_OFFSET: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("invalid ip version nibble {0:#x}")]
    BadVersion(u8),
    #[error("truncated packet: {have} of {need} bytes")]
    Truncated { have: usize, need: usize },
}

/// Read-only view over one raw IP packet.
#[derive(Debug, Clone, Copy)]
pub struct IpPacket<'a> {
    buf: &'a [u8],
    version: IpVersion,
}

impl<'a> IpPacket<'a> {
    /// Validates the version nibble and the fixed header length.
    pub fn new(buf: &'a [u8]) -> Result<Self, PacketError> {
        let first = *buf.first().ok_or(PacketError::Truncated { have: 0, need: 1 })?;
        let version = match first >> 4 {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            v => return Err(PacketError::BadVersion(v)),
        };
        let need = header_len(version);
        if buf.len() < need {
            return Err(PacketError::Truncated {
                have: buf.len(),
                need,
            });
        }
        Ok(Self { buf, version })
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Length of the fixed IP header for this packet's family.
    pub fn header_len(&self) -> usize {
        header_len(self.version)
    }

    /// The on-wire length the header claims for the whole packet.
    pub fn total_len(&self) -> usize {
        match self.version {
            IpVersion::V4 => u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize,
            IpVersion::V6 => {
                u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize + V6_HEADER_LEN
            }
        }
    }

    /// Transport protocol number (next-header for IPv6).
    pub fn protocol(&self) -> u8 {
        match self.version {
            IpVersion::V4 => self.buf[9],
            IpVersion::V6 => self.buf[6],
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => {
                let octets: [u8; 4] = self.buf[12..16].try_into().unwrap();
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpVersion::V6 => {
                let octets: [u8; 16] = self.buf[8..24].try_into().unwrap();
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => {
                let octets: [u8; 4] = self.buf[16..20].try_into().unwrap();
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpVersion::V6 => {
                let octets: [u8; 16] = self.buf[24..40].try_into().unwrap();
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    /// The transport header and payload. May be empty.
    pub fn transport(&self) -> &'a [u8] {
        &self.buf[self.header_len()..]
    }

    /// Transport source port, if enough bytes are present.
    pub fn src_port(&self) -> Option<u16> {
        let t = self.transport();
        Some(u16::from_be_bytes([*t.first()?, *t.get(1)?]))
    }

    /// Transport destination port, if enough bytes are present.
    pub fn dst_port(&self) -> Option<u16> {
        let t = self.transport();
        Some(u16::from_be_bytes([*t.get(2)?, *t.get(3)?]))
    }

    /// The TCP flags byte, if enough bytes are present.
    pub fn tcp_flags(&self) -> Option<u8> {
        self.transport().get(TCP_FLAGS_OFFSET).copied()
    }
}

fn header_len(version: IpVersion) -> usize {
    match version {
        IpVersion::V4 => V4_HEADER_LEN,
        IpVersion::V6 => V6_HEADER_LEN,
    }
}

/// Zeroes the TTL (IPv4) or hop-limit (IPv6) byte in place, so a diverted
/// copy that leaks to the wire is dropped by the first router.
pub fn zero_ttl(buf: &mut [u8]) {
    match buf.first().map(|b| b >> 4) {
        Some(4) if buf.len() > 8 => buf[8] = 0,
        Some(6) if buf.len() > 7 => buf[7] = 0,
        _ => {}
    }
}
