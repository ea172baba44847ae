//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages PSM values for L2CAP connections.

use std::fmt;

/// Protocol/Service Multiplexer value.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2 and the
/// assigned numbers for logical link control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Psm(pub u16);

impl Psm {
    /// Service Discovery Protocol
    pub const SDP: Psm = Psm(0x0001);
    /// RFCOMM protocol
    pub const RFCOMM: Psm = Psm(0x0003);
    /// BNEP protocol
    pub const BNEP: Psm = Psm(0x000F);
    /// HID Control
    pub const HID_CONTROL: Psm = Psm(0x0011);
    /// HID Interrupt
    pub const HID_INTERRUPT: Psm = Psm(0x0013);
    /// AVCTP protocol
    pub const AVCTP: Psm = Psm(0x0017);
    /// AVDTP protocol
    pub const AVDTP: Psm = Psm(0x0019);
    /// First dynamically assignable PSM
    pub const DYNAMIC_START: Psm = Psm(0x1001);

    /// Check that the PSM is well formed.
    ///
    /// The least significant bit of the low octet must be 1 and the least
    /// significant bit of the high octet must be 0.
    pub fn is_valid(&self) -> bool {
        self.0 & 0x0001 == 0x0001 && self.0 & 0x0100 == 0
    }

    /// Whether the PSM lies in the dynamically assigned range
    pub fn is_dynamic(&self) -> bool {
        self.0 >= Self::DYNAMIC_START.0
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl From<u16> for Psm {
    fn from(value: u16) -> Self {
        Psm(value)
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Psm::SDP => write!(f, "SDP (0x0001)"),
            Psm::RFCOMM => write!(f, "RFCOMM (0x0003)"),
            Psm::BNEP => write!(f, "BNEP (0x000F)"),
            Psm::HID_CONTROL => write!(f, "HID-Control (0x0011)"),
            Psm::HID_INTERRUPT => write!(f, "HID-Interrupt (0x0013)"),
            Psm::AVCTP => write!(f, "AVCTP (0x0017)"),
            Psm::AVDTP => write!(f, "AVDTP (0x0019)"),
            Psm(value) => write!(f, "PSM 0x{:04X}", value),
        }
    }
}
