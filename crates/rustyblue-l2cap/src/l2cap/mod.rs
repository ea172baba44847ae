//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the connection-oriented L2CAP core, which is
//! responsible for:
//! - Multiplexing protocol channels over a single baseband link
//! - Segmentation and reassembly of frames
//! - Channel setup and MTU negotiation over the signaling channel
//! - Listening channels with bounded accept backlogs
//! - Link idle teardown

pub mod channel;
pub mod connection;
pub mod constants;
pub mod core;
pub mod fragment;
pub mod interface;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod timer;
pub mod types;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::channel::L2capChannel;
pub use self::connection::L2capConnection;
pub use self::core::{ChannelEvent, L2capManager};
pub use self::interface::Interface;
pub use self::packet::{L2capCommandHeader, L2capHeader, L2capPacket};
pub use self::psm::Psm;
pub use self::signaling::SignalingMessage;
pub use self::types::*;
