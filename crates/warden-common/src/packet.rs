//! Raw packets handed to inspectors
//!
//! Packets are opaque here: the capture layer fills in the flow metadata and
//! the core never decodes the payload itself.

use crate::connection::Direction;
use bytes::Bytes;
use std::net::IpAddr;

/// Flow metadata of a single packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    /// Direction relative to the host
    pub direction: Direction,
    /// IP protocol number
    pub protocol: u8,
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
}

/// A captured packet
#[derive(Debug, Clone)]
pub struct Packet {
    /// Flow metadata
    pub info: PacketInfo,
    /// Raw bytes starting at the IP header
    pub payload: Bytes,
}

impl Packet {
    /// Create packet
    pub fn new(info: PacketInfo, payload: impl Into<Bytes>) -> Self {
        Self {
            info,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
