//! Type definitions for L2CAP operations
//!
//! This module contains core data structures shared by the connection,
//! channel and signaling layers.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use super::constants::*;
use crate::error::L2capError;

/// L2CAP channel identifier
pub type ChannelId = u16;

/// Signaling transaction identifier
pub type SignalId = u8;

/// Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    /// Wildcard address used as "any local adapter"
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = L2capError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(L2capError::InvalidParameter(format!("Invalid address: {}", s)));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            let mut octet = [0u8; 1];
            hex::decode_to_slice(part, &mut octet)
                .map_err(|_| L2capError::InvalidParameter(format!("Invalid address: {}", s)))?;
            bytes[5 - i] = octet[0];
        }

        Ok(Self { bytes })
    }
}

/// Opaque identifier of a baseband connection, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// State of a baseband link as seen by L2CAP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound ACL link requested, waiting for completion
    Open,
    /// Inbound ACL link accepted, waiting for completion
    ConnectPending,
    /// Link is up and carries traffic
    Connected,
    /// Link is gone; the connection is being dismantled
    Closed,
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// Channel is closed (fresh or torn down)
    Closed,
    /// Channel is bound to a local address and PSM
    Bound,
    /// Channel accepts inbound connections
    Listening,
    /// Outbound channel waiting for its baseband link
    WaitLink,
    /// Connect Request sent, waiting for the response
    ConnectSent,
    /// Configure exchange in progress
    Config,
    /// Channel is open and ready for data transfer
    Connected,
    /// Disconnect Request sent, waiting for the response
    DisconnectSent,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Bound => write!(f, "Bound"),
            Self::Listening => write!(f, "Listening"),
            Self::WaitLink => write!(f, "Waiting for baseband link"),
            Self::ConnectSent => write!(f, "Waiting for connection response"),
            Self::Config => write!(f, "Configuring"),
            Self::Connected => write!(f, "Connected"),
            Self::DisconnectSent => write!(f, "Waiting for disconnection"),
        }
    }
}

bitflags! {
    /// Progress of the Configure exchange on a channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigState: u8 {
        /// We accepted the peer's Configure Request (our output is settled)
        const OUTPUT_NEGOTIATED = 0x01;
        /// The peer accepted our Configure Request (our input is settled)
        const INPUT_NEGOTIATED = 0x02;
        /// Our own Configure Request is on the wire
        const OUTGOING_REQUEST_SENT = 0x04;
    }
}

impl ConfigState {
    pub fn is_complete(&self) -> bool {
        self.contains(Self::OUTPUT_NEGOTIATED | Self::INPUT_NEGOTIATED)
    }
}

/// Configuration options carried by Configure Request/Response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Option types that were present but not understood
    pub unknown: Vec<u8>,
}

impl ConfigOptions {
    /// Fold the options of a continuation segment into these
    pub fn merge(&mut self, other: ConfigOptions) {
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.flush_timeout.is_some() {
            self.flush_timeout = other.flush_timeout;
        }
        self.unknown.extend(other.unknown);
    }
}

/// Application-visible channel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Largest SDU we accept from the peer
    pub in_mtu: u16,
    /// Largest SDU the peer accepts from us
    pub out_mtu: u16,
    /// Negotiated flush timeout
    pub flush_timeout: u16,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            in_mtu: L2CAP_DEFAULT_MTU,
            out_mtu: L2CAP_DEFAULT_MTU,
            flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

/// Kind of channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelType {
    /// Raw conduit to the signaling channel (CID 0x0001)
    Raw,
    /// Dynamically allocated connection-oriented channel
    ConnectionOriented,
}
