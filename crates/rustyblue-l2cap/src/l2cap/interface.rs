//! Local Bluetooth adapters known to the engine
//!
//! An interface is registered when its adapter comes up. It carries the
//! adapter's ACL MTU and the connections running over it, keyed by remote
//! address. Outbound channels are routed through the registry.

use std::collections::HashMap;

use log::info;

use super::constants::L2CAP_BASIC_HEADER_SIZE;
use super::types::{BdAddr, ConnectionId};
use crate::error::{L2capError, L2capResult};

/// A local adapter
#[derive(Debug, Clone)]
pub struct Interface {
    pub address: BdAddr,
    /// Largest ACL fragment the adapter accepts
    pub acl_mtu: usize,
    /// Largest L2CAP payload that fits in one ACL fragment
    pub mtu: usize,
    connections: HashMap<BdAddr, ConnectionId>,
}

impl Interface {
    fn new(address: BdAddr, acl_mtu: usize) -> Self {
        Self {
            address,
            acl_mtu,
            mtu: acl_mtu - L2CAP_BASIC_HEADER_SIZE,
            connections: HashMap::new(),
        }
    }

    /// Connection to `remote` over this adapter, if any
    pub fn connection_to(&self, remote: &BdAddr) -> Option<ConnectionId> {
        self.connections.get(remote).copied()
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.values().copied()
    }
}

/// Registered adapters, in the order they came up
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: Vec<Interface>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, or refresh the ACL MTU of a known one
    pub fn add(&mut self, address: BdAddr, acl_mtu: usize) -> L2capResult<()> {
        if acl_mtu <= L2CAP_BASIC_HEADER_SIZE {
            return Err(L2capError::InvalidParameter(format!(
                "ACL MTU {} cannot carry an L2CAP header",
                acl_mtu
            )));
        }

        if let Some(existing) = self.get_mut(&address) {
            existing.acl_mtu = acl_mtu;
            existing.mtu = acl_mtu - L2CAP_BASIC_HEADER_SIZE;
            return Ok(());
        }

        info!("L2CAP interface {} up (ACL MTU {})", address, acl_mtu);
        self.interfaces.push(Interface::new(address, acl_mtu));
        Ok(())
    }

    /// Unregister an adapter and return it with its connections
    pub fn remove(&mut self, address: &BdAddr) -> Option<Interface> {
        let index = self.interfaces.iter().position(|i| i.address == *address)?;
        info!("L2CAP interface {} down", address);
        Some(self.interfaces.remove(index))
    }

    pub fn get(&self, address: &BdAddr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.address == *address)
    }

    pub fn get_mut(&mut self, address: &BdAddr) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.address == *address)
    }

    pub fn addresses(&self) -> Vec<BdAddr> {
        self.interfaces.iter().map(|i| i.address).collect()
    }

    /// Pick the adapter for a channel to `remote`.
    ///
    /// A specific `hint` must name a registered adapter. With the wildcard
    /// hint the first adapter that is not `remote` itself is taken; reach
    /// is not considered.
    pub fn select_route(&self, hint: BdAddr, remote: &BdAddr) -> L2capResult<&Interface> {
        if !hint.is_any() {
            return self.get(&hint).ok_or(L2capError::HostUnreachable);
        }

        self.interfaces
            .iter()
            .find(|i| i.address != *remote)
            .ok_or(L2capError::HostUnreachable)
    }

    /// Record the connection to `remote` on adapter `local`
    pub fn attach_connection(&mut self, local: &BdAddr, remote: BdAddr, id: ConnectionId) {
        if let Some(interface) = self.get_mut(local) {
            interface.connections.insert(remote, id);
        }
    }

    /// Forget a connection, unless it was already replaced by a newer one
    pub fn detach_connection(&mut self, local: &BdAddr, remote: &BdAddr, id: ConnectionId) {
        if let Some(interface) = self.get_mut(local) {
            if interface.connections.get(remote) == Some(&id) {
                interface.connections.remove(remote);
            }
        }
    }
}
