//! L2CAP connection (one per baseband link)
//!
//! A connection multiplexes every channel running between one local adapter
//! and one remote device. It owns the CID table, the signaling identifier
//! counter and the reassembly state of the link.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use super::channel::L2capChannel;
use super::constants::*;
use super::fragment::{segment, Reassembler};
use super::signaling::SignalingMessage;
use super::timer::TimerKey;
use super::types::*;
use crate::error::{L2capError, L2capResult};
use crate::hci::{ConnectionHandle, HciTransport};

/// State of one baseband link
#[derive(Debug)]
pub struct L2capConnection {
    pub(crate) id: ConnectionId,
    pub(crate) local_addr: BdAddr,
    pub(crate) remote_addr: BdAddr,
    /// Largest ACL fragment the adapter accepts
    pub(crate) acl_mtu: usize,
    pub(crate) state: LinkState,
    pub(crate) handle: Option<ConnectionHandle>,
    /// Whether this side requested the link
    pub(crate) is_initiator: bool,
    /// Connection-oriented channels keyed by local CID
    pub(crate) channels: BTreeMap<ChannelId, L2capChannel>,
    /// Raw channels; they share CID 0x0001 and are kept apart from the CID table
    pub(crate) raw_channels: Vec<L2capChannel>,
    pub(crate) reassembler: Reassembler,
    pub(crate) idle_timer: Option<TimerKey>,
    tx_ident: SignalId,
}

impl L2capConnection {
    pub fn new(
        id: ConnectionId,
        local_addr: BdAddr,
        remote_addr: BdAddr,
        acl_mtu: usize,
        is_initiator: bool,
    ) -> Self {
        Self {
            id,
            local_addr,
            remote_addr,
            acl_mtu,
            state: if is_initiator {
                LinkState::Open
            } else {
                LinkState::ConnectPending
            },
            handle: None,
            is_initiator,
            channels: BTreeMap::new(),
            raw_channels: Vec::new(),
            reassembler: Reassembler::new(),
            idle_timer: None,
            tx_ident: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    /// Whether neither connection-oriented nor raw channels are attached
    pub fn is_idle(&self) -> bool {
        self.channels.is_empty() && self.raw_channels.is_empty()
    }

    /// Next signaling identifier, cycling through 1..=199. Identifiers
    /// 200-254 are left to external tools issuing raw commands.
    pub fn next_ident(&mut self) -> SignalId {
        self.tx_ident = if self.tx_ident >= L2CAP_IDENT_MAX {
            L2CAP_IDENT_MIN
        } else {
            self.tx_ident + 1
        };
        self.tx_ident
    }

    /// Lowest unused dynamic CID
    pub fn allocate_cid(&self) -> L2capResult<ChannelId> {
        (L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX)
            .find(|cid| !self.channels.contains_key(cid))
            .ok_or(L2capError::ResourceLimitReached)
    }

    pub fn channel(&self, cid: ChannelId) -> Option<&L2capChannel> {
        self.channels.get(&cid)
    }

    /// Find the channel whose peer endpoint is `remote_cid`
    pub fn find_by_remote_cid(&self, remote_cid: ChannelId) -> Option<&L2capChannel> {
        self.channels
            .values()
            .find(|channel| channel.lock().remote_cid == Some(remote_cid))
    }

    /// Find the channel waiting on the request sent with `ident`
    pub fn find_by_ident(&self, ident: SignalId) -> Option<&L2capChannel> {
        self.channels
            .values()
            .find(|channel| channel.lock().pending_ident == Some(ident))
    }

    /// Segment a frame for `cid` and hand the fragments to the baseband
    pub fn send_frame(
        &self,
        transport: &dyn HciTransport,
        cid: ChannelId,
        payload: &[u8],
        priority: u8,
    ) -> L2capResult<()> {
        let handle = match (self.state, self.handle) {
            (LinkState::Connected, Some(handle)) => handle,
            _ => return Err(L2capError::NotConnected),
        };

        trace!(
            "{} TX cid 0x{:04X} len {}: {}",
            self.id,
            cid,
            payload.len(),
            hex::encode(payload)
        );

        for (i, fragment) in segment(cid, payload, self.acl_mtu).iter().enumerate() {
            transport.send(handle, fragment, i == 0, priority)?;
        }

        Ok(())
    }

    /// Send one command on the signaling channel
    pub fn send_signal(
        &self,
        transport: &dyn HciTransport,
        message: &SignalingMessage,
    ) -> L2capResult<()> {
        debug!("{} sending {:?}", self.id, message);
        self.send_frame(
            transport,
            L2CAP_SIGNALING_CID,
            &message.serialize(),
            L2CAP_SIGNALING_PRIORITY,
        )
    }
}

/// Every live connection, reachable by id and by ACL handle
#[derive(Debug, Default)]
pub struct ConnectionTable {
    by_id: HashMap<ConnectionId, Arc<Mutex<L2capConnection>>>,
    by_handle: HashMap<ConnectionHandle, ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: L2capConnection) -> Arc<Mutex<L2capConnection>> {
        let id = connection.id;
        let connection = Arc::new(Mutex::new(connection));
        self.by_id.insert(id, connection.clone());
        connection
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Mutex<L2capConnection>>> {
        self.by_id.get(&id).cloned()
    }

    pub fn by_handle(&self, handle: ConnectionHandle) -> Option<Arc<Mutex<L2capConnection>>> {
        self.by_handle.get(&handle).and_then(|id| self.get(*id))
    }

    pub fn id_for_handle(&self, handle: ConnectionHandle) -> Option<ConnectionId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn bind_handle(&mut self, handle: ConnectionHandle, id: ConnectionId) {
        self.by_handle.insert(handle, id);
    }

    pub fn unbind_handle(&mut self, handle: ConnectionHandle) -> Option<ConnectionId> {
        self.by_handle.remove(&handle)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Mutex<L2capConnection>>> {
        self.by_handle.retain(|_, conn| *conn != id);
        self.by_id.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub(crate) fn lock_connection(
    connection: &Mutex<L2capConnection>,
) -> MutexGuard<'_, L2capConnection> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}
