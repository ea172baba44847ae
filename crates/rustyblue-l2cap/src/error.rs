//! Error types for the rustyblue-l2cap library
//!
//! This module defines the error types used throughout the library.

use thiserror::Error;

/// Errors reported by the baseband (HCI) collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("ACL connection failed with status 0x{0:02X}")]
    ConnectFailed(u8),

    #[error("Unknown ACL connection handle 0x{0:04X}")]
    UnknownHandle(u16),

    #[error("Failed to send ACL data: {0}")]
    SendError(String),

    #[error("Unsupported operation")]
    Unsupported,
}

/// Errors that can occur in L2CAP operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Address already in use")]
    AddressInUse,

    #[error("No route to host")]
    HostUnreachable,

    #[error("No such device")]
    NoDevice,

    #[error("Remote device rejected connection: 0x{0:04X}")]
    ConnectionRejected(u16),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Connection aborted locally")]
    ConnectionAborted,

    #[error("Connection timeout")]
    Timeout,

    #[error("Link lost (reason 0x{0:02X})")]
    LinkLost(u8),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("Connection not established")]
    NotConnected,

    #[error("HCI error: {0}")]
    HciError(#[from] HciError),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

// HCI status and disconnect reason codes (Core Spec Vol 1, Part F)
const HCI_PAGE_TIMEOUT: u8 = 0x04;
const HCI_AUTHENTICATION_FAILURE: u8 = 0x05;
const HCI_PIN_OR_KEY_MISSING: u8 = 0x06;
const HCI_CONNECTION_TIMEOUT: u8 = 0x08;
const HCI_CONNECTION_LIMIT_EXCEEDED: u8 = 0x09;
const HCI_REJECTED_LIMITED_RESOURCES: u8 = 0x0D;
const HCI_REJECTED_SECURITY: u8 = 0x0E;
const HCI_REJECTED_PERSONAL: u8 = 0x0F;
const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;
const HCI_REMOTE_LOW_RESOURCES: u8 = 0x14;
const HCI_REMOTE_POWER_OFF: u8 = 0x15;
const HCI_LOCAL_HOST_TERMINATED: u8 = 0x16;

impl L2capError {
    /// Map an HCI status or disconnect reason onto the error class
    /// reported to applications.
    pub fn from_hci_status(status: u8) -> Self {
        match status {
            HCI_PAGE_TIMEOUT => L2capError::HostUnreachable,
            HCI_CONNECTION_TIMEOUT => L2capError::Timeout,
            HCI_AUTHENTICATION_FAILURE
            | HCI_PIN_OR_KEY_MISSING
            | HCI_REJECTED_SECURITY
            | HCI_REJECTED_PERSONAL => L2capError::ConnectionRefused,
            HCI_CONNECTION_LIMIT_EXCEEDED | HCI_REJECTED_LIMITED_RESOURCES => {
                L2capError::ResourceLimitReached
            }
            HCI_REMOTE_USER_TERMINATED | HCI_REMOTE_LOW_RESOURCES | HCI_REMOTE_POWER_OFF => {
                L2capError::ConnectionReset
            }
            HCI_LOCAL_HOST_TERMINATED => L2capError::ConnectionAborted,
            other => L2capError::LinkLost(other),
        }
    }
}
