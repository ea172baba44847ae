//! L2CAP Packet handling
//!
//! This module provides structures and functions for handling L2CAP basic
//! frames and the command header used inside signaling frames.

use super::constants::*;
use super::types::ChannelId;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Destination Channel Identifier
    pub channel_id: ChannelId,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: ChannelId) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut result[0..2], self.length);
        LittleEndian::write_u16(&mut result[2..4], self.channel_id);
        result
    }
}

/// A complete L2CAP basic frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    /// L2CAP header
    pub header: L2capHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet
    pub fn new(channel_id: ChannelId, payload: Vec<u8>) -> Self {
        let length = payload.len() as u16;

        Self {
            header: L2capHeader::new(length, channel_id),
            payload,
        }
    }

    /// Parse a complete L2CAP packet from raw bytes.
    ///
    /// Returns `None` unless `data` holds exactly the declared length.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = L2capHeader::parse(data)?;

        if data.len() != L2CAP_BASIC_HEADER_SIZE + header.length as usize {
            return None;
        }

        Some(Self {
            header,
            payload: data[L2CAP_BASIC_HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize the L2CAP packet to a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return None;
        }

        Some(Self {
            code: data[0],
            identifier: data[1],
            length: LittleEndian::read_u16(&data[2..4]),
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_COMMAND_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_COMMAND_HEADER_SIZE];
        result[0] = self.code;
        result[1] = self.identifier;
        LittleEndian::write_u16(&mut result[2..4], self.length);
        result
    }
}
