//! RustyBlue L2CAP - connection-oriented L2CAP for Bluetooth BR/EDR hosts
//!
//! This library multiplexes logical channels over baseband (ACL) links. It
//! negotiates channels with peers over the signaling channel, segments and
//! reassembles frames, and hands applications a blocking channel API.
//! The baseband itself is abstracted behind [`hci::HciTransport`], so the
//! engine runs the same against a controller socket or an in-memory pump.

pub mod config;
pub mod error;
pub mod hci;
pub mod l2cap;

// Re-export common types for convenience
pub use config::L2capConfig;
pub use error::{HciError, L2capError, L2capResult};
pub use hci::{ConnectionHandle, HciTransport};
pub use l2cap::{
    BdAddr, ChannelEvent, ChannelOptions, L2capChannel, L2capChannelState, L2capChannelType,
    L2capManager, Psm,
};
