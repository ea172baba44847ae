//! Baseband (HCI) collaborator interface
//!
//! The L2CAP engine never talks to a controller directly. It drives an
//! implementation of [`HciTransport`] for outbound requests, and the host
//! feeds controller events back through the `on_*` methods of
//! [`L2capManager`](crate::l2cap::L2capManager).
//!
//! Implementations are called while the engine holds a per-connection lock,
//! so they must not call back into the manager synchronously. Queue the
//! work and deliver it from the host's event loop instead.

use crate::error::HciError;
use crate::l2cap::types::BdAddr;

/// ACL connection handle assigned by the controller
pub type ConnectionHandle = u16;

/// HCI reason code used when the engine tears down an idle link
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Outbound operations the L2CAP engine needs from the baseband layer
pub trait HciTransport: Send + Sync {
    /// Request an ACL link to `remote` from the adapter at `local`.
    ///
    /// Completion is asynchronous: the host later calls
    /// `on_connect_complete` with the outcome.
    fn connect(&self, local: BdAddr, remote: BdAddr) -> Result<(), HciError>;

    /// Request teardown of an ACL link.
    fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> Result<(), HciError>;

    /// Transmit one ACL fragment. `is_start` marks the first fragment of an
    /// L2CAP frame.
    fn send(
        &self,
        handle: ConnectionHandle,
        fragment: &[u8],
        is_start: bool,
        priority: u8,
    ) -> Result<(), HciError>;
}
