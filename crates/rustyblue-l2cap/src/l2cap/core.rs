//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - Interface and baseband link bookkeeping
//! - Channel setup, configuration and teardown
//! - Signaling command dispatch
//! - Data routing between links and channels
//! - Connect, disconnect and idle timers
//!
//! Lock order: interface registry, connection table, connection, bind
//! table, channel (a listener before its children). The timer queue and the
//! subscriber list are leaves. No registry or table lock is taken while a
//! connection is locked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};

use super::channel::{ChannelInner, ChannelShared, L2capChannel, ListenQueue};
use super::connection::{lock_connection, ConnectionTable, L2capConnection};
use super::constants::*;
use super::interface::InterfaceRegistry;
use super::packet::{L2capCommandHeader, L2capPacket};
use super::psm::Psm;
use super::signaling::SignalingMessage;
use super::timer::{Expired, TimerKey, TimerQueue, TimerTarget};
use super::types::*;
use crate::config::L2capConfig;
use crate::error::{L2capError, L2capResult};
use crate::hci::{ConnectionHandle, HciTransport, HCI_REMOTE_USER_TERMINATED};

/// Channel events delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel reached CONNECTED
    Connected {
        /// Channel handle id
        channel: u64,
        /// Local Channel ID
        cid: ChannelId,
        /// Protocol/Service Multiplexer
        psm: Psm,
    },
    /// Channel was torn down. Sent once per channel lifetime.
    Disconnected {
        /// Channel handle id
        channel: u64,
        /// Local Channel ID the channel last held
        cid: ChannelId,
        /// Protocol/Service Multiplexer
        psm: Psm,
        /// Reason for disconnection, if it was not a clean close
        reason: Option<L2capError>,
    },
    /// Inbound data was queued on a channel
    DataReady {
        /// Channel handle id
        channel: u64,
        /// Local Channel ID
        cid: ChannelId,
        /// Length of the queued SDU
        len: usize,
    },
    /// A child of a listening channel is ready to be accepted
    IncomingConnection {
        /// Handle id of the listening channel
        listener: u64,
        /// Handle id of the connected child
        channel: u64,
    },
}

/// Why a received signaling command is answered with a Command Reject
#[derive(Debug)]
enum Reject {
    NotUnderstood(String),
    InvalidCid { local: ChannelId, remote: ChannelId },
}

impl From<L2capError> for Reject {
    fn from(err: L2capError) -> Self {
        Reject::NotUnderstood(err.to_string())
    }
}

type BindTable = HashMap<(BdAddr, Psm), Weak<ChannelShared>>;

/// L2CAP Manager responsible for handling L2CAP operations
pub struct L2capManager {
    /// Engine configuration
    config: L2capConfig,

    /// Baseband collaborator
    transport: Arc<dyn HciTransport>,

    /// Local adapters that are up
    interfaces: RwLock<InterfaceRegistry>,

    /// Live connections by id and ACL handle
    connections: RwLock<ConnectionTable>,

    /// Bound (address, PSM) pairs
    binds: Mutex<BindTable>,

    /// Channel and idle timers
    timers: Mutex<TimerQueue>,

    /// Event subscribers
    subscribers: Mutex<Vec<Sender<ChannelEvent>>>,

    /// Next connection id
    next_connection_id: AtomicU64,
}

impl L2capManager {
    /// Create a new L2CAP manager driving `transport`
    pub fn new(config: L2capConfig, transport: Arc<dyn HciTransport>) -> Self {
        Self {
            config,
            transport,
            interfaces: RwLock::new(InterfaceRegistry::new()),
            connections: RwLock::new(ConnectionTable::new()),
            binds: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerQueue::new()),
            subscribers: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    /// Receive every channel event from now on
    pub fn subscribe(&self) -> Receiver<ChannelEvent> {
        let (tx, rx) = unbounded();
        self.subscribers().push(tx);
        rx
    }

    fn emit(&self, event: ChannelEvent) {
        self.subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn interfaces(&self) -> RwLockReadGuard<'_, InterfaceRegistry> {
        self.interfaces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn interfaces_mut(&self) -> RwLockWriteGuard<'_, InterfaceRegistry> {
        self.interfaces.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> RwLockReadGuard<'_, ConnectionTable> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections_mut(&self) -> RwLockWriteGuard<'_, ConnectionTable> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn binds(&self) -> MutexGuard<'_, BindTable> {
        self.binds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Sender<ChannelEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Mutex<L2capConnection>>> {
        self.connections().get(id)
    }

    /// Connection between adapter `local` and `remote`, if one exists
    pub(crate) fn connection_to(
        &self,
        local: &BdAddr,
        remote: &BdAddr,
    ) -> Option<Arc<Mutex<L2capConnection>>> {
        let id = self
            .interfaces()
            .get(local)
            .and_then(|interface| interface.connection_to(remote))?;
        self.connection(id)
    }

    /// Number of live baseband connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.timers().len()
    }

    // ---- Interfaces ----------------------------------------------------

    /// Register a local adapter that came up
    pub fn on_interface_up(&self, address: BdAddr, acl_mtu: usize) -> L2capResult<()> {
        self.interfaces_mut().add(address, acl_mtu)
    }

    /// Tear down every connection of an adapter that went down, then forget
    /// the adapter
    pub fn on_interface_down(&self, address: &BdAddr) {
        let removed = self.interfaces_mut().remove(address);
        let Some(interface) = removed else {
            warn!("Interface {} is not registered", address);
            return;
        };

        for id in interface.connections() {
            self.teardown_connection(id, L2capError::NoDevice);
        }
    }

    /// Bring every interface down
    pub fn shutdown(&self) {
        let addresses = self.interfaces().addresses();
        for address in addresses {
            self.on_interface_down(&address);
        }
        info!("L2CAP manager shut down");
    }

    // ---- Baseband links ------------------------------------------------

    fn allocate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Find or create the connection to `remote`, requesting an ACL link
    /// for a new one
    fn connect_outbound(
        &self,
        local_hint: BdAddr,
        remote: BdAddr,
    ) -> L2capResult<Arc<Mutex<L2capConnection>>> {
        let mut interfaces = self.interfaces_mut();
        let interface = interfaces.select_route(local_hint, &remote)?;
        let local = interface.address;
        let acl_mtu = interface.acl_mtu;

        if let Some(existing) = interface
            .connection_to(&remote)
            .and_then(|id| self.connection(id))
        {
            if lock_connection(&existing).state != LinkState::Closed {
                return Ok(existing);
            }
        }

        let id = self.allocate_connection_id();
        let connection = L2capConnection::new(id, local, remote, acl_mtu, true);

        debug!("{} requesting ACL link {} -> {}", id, local, remote);
        self.transport.connect(local, remote)?;

        let connection = self.connections_mut().insert(connection);
        interfaces.attach_connection(&local, remote, id);
        Ok(connection)
    }

    /// Inbound ACL link indication. The link is always accepted; access
    /// policy belongs to higher layers.
    pub fn on_inbound_connect(&self, local: BdAddr, remote: BdAddr) -> bool {
        let mut interfaces = self.interfaces_mut();
        let Some(interface) = interfaces.get(&local) else {
            warn!("Inbound link from {} on unknown interface {}", remote, local);
            return false;
        };
        let acl_mtu = interface.acl_mtu;

        if let Some(existing) = interface
            .connection_to(&remote)
            .and_then(|id| self.connection(id))
        {
            if lock_connection(&existing).state != LinkState::Closed {
                return true;
            }
        }

        let id = self.allocate_connection_id();
        let connection = L2capConnection::new(id, local, remote, acl_mtu, false);
        self.connections_mut().insert(connection);
        interfaces.attach_connection(&local, remote, id);

        debug!("{} accepting inbound ACL link from {}", id, remote);
        true
    }

    /// Outcome of an ACL link request, inbound or outbound
    pub fn on_connect_complete(
        &self,
        local: BdAddr,
        remote: BdAddr,
        status: u8,
        handle: ConnectionHandle,
    ) {
        let Some(connection) = self.connection_to(&local, &remote) else {
            warn!("Connect complete for unknown link {} -> {}", local, remote);
            if status == 0 {
                self.release_orphan_link(handle);
            }
            return;
        };
        let (id, closed) = {
            let conn = lock_connection(&connection);
            (conn.id, conn.state == LinkState::Closed)
        };

        if status != 0 {
            warn!("ACL link to {} failed with status 0x{:02X}", remote, status);
            self.teardown_connection(id, L2capError::from_hci_status(status));
            return;
        }
        if closed {
            self.release_orphan_link(handle);
            return;
        }

        self.connections_mut().bind_handle(handle, id);

        let mut conn = lock_connection(&connection);
        // torn down between the check and the bind
        if conn.state == LinkState::Closed {
            drop(conn);
            self.release_orphan_link(handle);
            return;
        }
        conn.state = LinkState::Connected;
        conn.handle = Some(handle);
        info!("{} link to {} up (handle 0x{:04X})", id, remote, handle);

        self.connection_ready(&mut conn);
    }

    /// Disconnect an ACL link that completed after its connection went away
    fn release_orphan_link(&self, handle: ConnectionHandle) {
        self.connections_mut().unbind_handle(handle);
        debug!("Releasing unowned ACL link 0x{:04X}", handle);
        if let Err(err) = self.transport.disconnect(handle, HCI_REMOTE_USER_TERMINATED) {
            warn!("Failed to release ACL link 0x{:04X}: {}", handle, err);
        }
    }

    /// The baseband reported the link gone
    pub fn on_disconnect(&self, handle: ConnectionHandle, reason: u8) {
        let id = self.connections().id_for_handle(handle);
        let Some(id) = id else {
            debug!("Disconnect for unknown handle 0x{:04X}", handle);
            return;
        };

        info!("{} link lost (reason 0x{:02X})", id, reason);
        self.teardown_connection(id, L2capError::from_hci_status(reason));
    }

    /// One ACL fragment arrived
    pub fn on_acl_data(&self, handle: ConnectionHandle, data: &[u8], is_start: bool) {
        let connection = self.connections().by_handle(handle);
        let Some(connection) = connection else {
            warn!("ACL data for unknown handle 0x{:04X}", handle);
            return;
        };

        let mut conn = lock_connection(&connection);
        if conn.state != LinkState::Connected {
            return;
        }

        if let Some(packet) = conn.reassembler.push(data, is_start) {
            self.dispatch_frame(&mut conn, packet);
        }
    }

    /// Remove a connection and destroy every channel on it with `reason`
    fn teardown_connection(&self, id: ConnectionId, reason: L2capError) {
        let Some(connection) = self.connection(id) else {
            return;
        };
        let (local, remote) = {
            let conn = lock_connection(&connection);
            (conn.local_addr, conn.remote_addr)
        };

        self.interfaces_mut().detach_connection(&local, &remote, id);
        self.connections_mut().remove(id);

        let mut conn = lock_connection(&connection);
        conn.state = LinkState::Closed;
        self.cancel_idle_timer(&mut conn);
        conn.reassembler.reset();

        let cids: Vec<ChannelId> = conn.channels.keys().copied().collect();
        for cid in cids {
            self.destroy_channel(&mut conn, cid, Some(reason.clone()));
        }
        for raw in conn.raw_channels.clone() {
            self.detach_raw(&mut conn, &raw, Some(reason.clone()));
        }

        info!("{} to {} removed: {}", id, remote, reason);
    }

    /// The link came up: start every channel that was waiting on it
    fn connection_ready(&self, conn: &mut L2capConnection) {
        let channels: Vec<L2capChannel> = conn.channels.values().cloned().collect();
        for channel in &channels {
            self.channel_became_ready(conn, channel);
        }

        for raw in conn.raw_channels.clone() {
            let mut inner = raw.lock();
            if inner.state == L2capChannelState::WaitLink {
                inner.state = L2capChannelState::Connected;
                self.emit(ChannelEvent::Connected {
                    channel: raw.id(),
                    cid: inner.local_cid,
                    psm: inner.psm,
                });
                drop(inner);
                raw.notify();
            }
        }

        self.maybe_schedule_idle_teardown(conn);
    }

    fn channel_became_ready(&self, conn: &mut L2capConnection, channel: &L2capChannel) {
        let mut inner = channel.lock();
        if inner.state != L2capChannelState::WaitLink {
            return;
        }

        if let Err(err) = self.send_connect_request(conn, &mut inner) {
            warn!("Channel 0x{:04X}: {}", inner.local_cid, err);
        }
    }

    /// Arm the idle timer once the last channel has left a live link
    fn maybe_schedule_idle_teardown(&self, conn: &mut L2capConnection) {
        if conn.state != LinkState::Connected || !conn.is_idle() || conn.idle_timer.is_some() {
            return;
        }

        let timeout = self.config.idle_timeout(conn.is_initiator);
        debug!("{} idle, disconnecting in {:?}", conn.id, timeout);
        conn.idle_timer = Some(self.timers().arm(
            Instant::now() + timeout,
            TimerTarget::Idle {
                connection: conn.id,
            },
        ));
    }

    fn cancel_idle_timer(&self, conn: &mut L2capConnection) {
        if let Some(key) = conn.idle_timer.take() {
            self.timers().cancel(key);
        }
    }

    // ---- Timers --------------------------------------------------------

    /// Fire every timer due at `now`
    pub fn process_timers(&self, now: Instant) {
        let expired = self.timers().expire(now);

        for Expired { key, target } in expired {
            match target {
                TimerTarget::Channel { connection, cid } => {
                    self.channel_timeout(connection, cid, key)
                }
                TimerTarget::Idle { connection } => self.idle_timeout(connection, key),
            }
        }
    }

    /// Earliest instant `process_timers` has work to do
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers().next_deadline()
    }

    fn arm_channel_timer(&self, connection: ConnectionId, inner: &mut ChannelInner, timeout: Duration) {
        let mut timers = self.timers();
        if let Some(old) = inner.timer.take() {
            timers.cancel(old);
        }
        inner.timer = Some(timers.arm(
            Instant::now() + timeout,
            TimerTarget::Channel {
                connection,
                cid: inner.local_cid,
            },
        ));
    }

    fn cancel_channel_timer(&self, inner: &mut ChannelInner) {
        if let Some(key) = inner.timer.take() {
            self.timers().cancel(key);
        }
    }

    fn channel_timeout(&self, id: ConnectionId, cid: ChannelId, key: TimerKey) {
        let Some(connection) = self.connection(id) else {
            return;
        };
        let mut conn = lock_connection(&connection);
        let Some(channel) = conn.channel(cid).cloned() else {
            return;
        };

        {
            let mut inner = channel.lock();
            if inner.timer != Some(key) {
                return;
            }
            inner.timer = None;
            warn!("L2CAP channel 0x{:04X} timed out ({})", cid, inner.state);
        }

        self.destroy_channel(&mut conn, cid, Some(L2capError::Timeout));
    }

    fn idle_timeout(&self, id: ConnectionId, key: TimerKey) {
        let Some(connection) = self.connection(id) else {
            return;
        };

        {
            let mut conn = lock_connection(&connection);
            if conn.idle_timer != Some(key) {
                return;
            }
            conn.idle_timer = None;

            if conn.state != LinkState::Connected || !conn.is_idle() {
                return;
            }
            let Some(handle) = conn.handle else {
                return;
            };

            info!("{} idle, disconnecting {}", conn.id, conn.remote_addr);
            conn.state = LinkState::Closed;
            if let Err(err) = self.transport.disconnect(handle, HCI_REMOTE_USER_TERMINATED) {
                warn!("{} disconnect failed: {}", conn.id, err);
            }
        }

        self.teardown_connection(id, L2capError::ConnectionAborted);
    }

    // ---- Channel lifecycle ---------------------------------------------

    /// Move a channel to CLOSED, record `reason` for its waiter and emit
    /// the single teardown notification
    fn finish_channel(
        &self,
        channel: &L2capChannel,
        inner: &mut ChannelInner,
        reason: Option<L2capError>,
    ) {
        self.cancel_channel_timer(inner);
        inner.state = L2capChannelState::Closed;
        inner.connection = None;
        inner.remote_cid = None;
        inner.pending_ident = None;
        inner.config_state = ConfigState::empty();

        if inner.error.is_none() {
            inner.error = reason.clone();
        }

        if !inner.teardown_notified {
            inner.teardown_notified = true;
            info!("L2CAP channel 0x{:04X} closed", inner.local_cid);
            self.emit(ChannelEvent::Disconnected {
                channel: channel.id(),
                cid: inner.local_cid,
                psm: inner.psm,
                reason: reason.or_else(|| inner.error.clone()),
            });
        }
        channel.notify();
    }

    /// Remove a channel from its connection and close it
    fn destroy_channel(&self, conn: &mut L2capConnection, cid: ChannelId, reason: Option<L2capError>) {
        let Some(channel) = conn.channels.remove(&cid) else {
            return;
        };

        let parent = {
            let mut inner = channel.lock();
            self.finish_channel(&channel, &mut inner, reason);
            inner.parent.take()
        };

        // not yet accepted: drop it from the listener's queue
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            let parent = L2capChannel::from_shared(parent);
            let mut parent_inner = parent.lock();
            if let Some(listen) = parent_inner.listen.as_mut() {
                listen.accept_queue.retain(|child| !child.ptr_eq(&channel));
            }
        }

        self.maybe_schedule_idle_teardown(conn);
    }

    fn detach_raw(&self, conn: &mut L2capConnection, channel: &L2capChannel, reason: Option<L2capError>) {
        conn.raw_channels.retain(|raw| !raw.ptr_eq(channel));
        {
            let mut inner = channel.lock();
            self.finish_channel(channel, &mut inner, reason);
        }
        self.maybe_schedule_idle_teardown(conn);
    }

    /// Both directions are configured: open the channel and wake whoever
    /// waits for it
    fn channel_connected(&self, channel: &L2capChannel) {
        let parent = {
            let mut inner = channel.lock();
            inner.state = L2capChannelState::Connected;
            inner.pending_ident = None;
            self.cancel_channel_timer(&mut inner);

            info!(
                "L2CAP channel 0x{:04X} is OPEN ({}, out MTU {})",
                inner.local_cid, inner.psm, inner.options.out_mtu
            );
            self.emit(ChannelEvent::Connected {
                channel: channel.id(),
                cid: inner.local_cid,
                psm: inner.psm,
            });
            inner.parent.as_ref().and_then(Weak::upgrade)
        };
        channel.notify();

        if let Some(parent) = parent {
            let parent = L2capChannel::from_shared(parent);
            self.emit(ChannelEvent::IncomingConnection {
                listener: parent.id(),
                channel: channel.id(),
            });
            // accept() checks its children under the listener lock
            let _guard = parent.lock();
            parent.notify();
        }
    }

    /// Send a Disconnect Request and wait for the response under the
    /// disconnect timer
    fn start_disconnect(&self, conn: &mut L2capConnection, inner: &mut ChannelInner) {
        inner.state = L2capChannelState::DisconnectSent;
        self.arm_channel_timer(conn.id, inner, self.config.disconnect_timeout());

        if let Err(err) = self.send_disconnect_request(conn, inner) {
            warn!("Channel 0x{:04X}: {}", inner.local_cid, err);
        }
    }

    // ---- Frame dispatch ------------------------------------------------

    fn dispatch_frame(&self, conn: &mut L2capConnection, packet: L2capPacket) {
        trace!(
            "{} RX cid 0x{:04X} len {}: {}",
            conn.id,
            packet.header.channel_id,
            packet.payload.len(),
            hex::encode(&packet.payload)
        );

        match packet.header.channel_id {
            L2CAP_SIGNALING_CID => {
                self.deliver_raw(conn, &packet.payload);
                self.dispatch_signalling_pdu(conn, &packet.payload);
            }
            L2CAP_CONNECTIONLESS_CID => {
                debug!("{} dropping connectionless frame", conn.id);
            }
            cid => self.deliver_data(conn, cid, packet.payload),
        }
    }

    fn deliver_raw(&self, conn: &L2capConnection, payload: &[u8]) {
        for raw in &conn.raw_channels {
            let mut inner = raw.lock();
            if inner.state != L2capChannelState::Connected {
                continue;
            }
            if inner.rx_queue.len() >= self.config.rx_queue_limit {
                warn!("Raw channel on {} receive queue full, dropping frame", conn.id);
                continue;
            }
            inner.rx_queue.push_back(payload.to_vec());
            self.emit(ChannelEvent::DataReady {
                channel: raw.id(),
                cid: inner.local_cid,
                len: payload.len(),
            });
            drop(inner);
            raw.notify();
        }
    }

    fn deliver_data(&self, conn: &L2capConnection, cid: ChannelId, payload: Vec<u8>) {
        let Some(channel) = conn.channel(cid) else {
            warn!("{} dropping frame for unknown CID 0x{:04X}", conn.id, cid);
            return;
        };

        let mut inner = channel.lock();
        if inner.state != L2capChannelState::Connected {
            debug!("Channel 0x{:04X} not connected, dropping frame", cid);
            return;
        }
        if payload.len() > inner.options.in_mtu as usize {
            warn!(
                "Channel 0x{:04X} frame of {} bytes exceeds MTU {}",
                cid,
                payload.len(),
                inner.options.in_mtu
            );
            return;
        }
        if inner.rx_queue.len() >= self.config.rx_queue_limit {
            warn!("Channel 0x{:04X} receive queue full, dropping frame", cid);
            return;
        }

        let len = payload.len();
        inner.rx_queue.push_back(payload);
        self.emit(ChannelEvent::DataReady {
            channel: channel.id(),
            cid,
            len,
        });
        drop(inner);
        channel.notify();
    }

    /// Process every command of a signaling frame in order
    fn dispatch_signalling_pdu(&self, conn: &mut L2capConnection, data: &[u8]) {
        let mut offset = 0;

        while data.len() - offset >= L2CAP_COMMAND_HEADER_SIZE {
            let Some(header) = L2capCommandHeader::parse(&data[offset..]) else {
                break;
            };
            offset += L2CAP_COMMAND_HEADER_SIZE;

            let length = header.length as usize;
            if length > data.len() - offset || header.identifier == 0 {
                warn!(
                    "{} corrupted signaling command (code 0x{:02X} ident {} len {})",
                    conn.id, header.code, header.identifier, header.length
                );
                break;
            }

            let params = &data[offset..offset + length];
            offset += length;

            let result = SignalingMessage::parse_command(&header, params)
                .map_err(Reject::from)
                .and_then(|message| self.handle_signal(conn, message));

            if let Err(reject) = result {
                if header.code != L2CAP_COMMAND_REJECT {
                    self.send_command_reject(conn, header.identifier, reject);
                }
            }
        }

        if offset < data.len() {
            debug!("{} ignoring {} trailing signaling bytes", conn.id, data.len() - offset);
        }
    }

    fn handle_signal(&self, conn: &mut L2capConnection, message: SignalingMessage) -> Result<(), Reject> {
        match message {
            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => {
                warn!(
                    "{} peer rejected command {} (reason 0x{:04X})",
                    conn.id, identifier, reason
                );
                Ok(())
            }

            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => {
                self.handle_connection_request(conn, identifier, psm, source_cid);
                Ok(())
            }

            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            } => {
                self.handle_connection_response(
                    conn,
                    identifier,
                    destination_cid,
                    source_cid,
                    result,
                    status,
                );
                Ok(())
            }

            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.handle_configure_request(conn, identifier, destination_cid, flags, options),

            SignalingMessage::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                self.handle_configure_response(conn, source_cid, flags, result, options);
                Ok(())
            }

            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_request(conn, identifier, destination_cid, source_cid),

            SignalingMessage::DisconnectionResponse { source_cid, .. } => {
                self.handle_disconnection_response(conn, source_cid);
                Ok(())
            }

            SignalingMessage::EchoRequest { identifier, data } => {
                let response = SignalingMessage::EchoResponse { identifier, data };
                self.send_signal(conn, &response);
                Ok(())
            }

            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } => {
                let response = SignalingMessage::InformationResponse {
                    identifier,
                    info_type,
                    result: L2CAP_IR_NOT_SUPPORTED,
                    data: Vec::new(),
                };
                self.send_signal(conn, &response);
                Ok(())
            }

            SignalingMessage::EchoResponse { identifier, .. }
            | SignalingMessage::InformationResponse { identifier, .. } => {
                debug!("{} response {} left to raw channels", conn.id, identifier);
                Ok(())
            }
        }
    }

    fn handle_connection_request(
        &self,
        conn: &mut L2capConnection,
        identifier: SignalId,
        psm: Psm,
        source_cid: ChannelId,
    ) {
        debug!(
            "{} Connect Request for {} from CID 0x{:04X}",
            conn.id, psm, source_cid
        );

        let (result, destination_cid) = match self.spawn_inbound_channel(conn, psm, source_cid) {
            Ok(cid) => (L2CAP_CR_SUCCESS, cid),
            Err(result) => (result, L2CAP_NULL_CID),
        };

        if let Err(err) =
            self.send_connect_response(conn, identifier, destination_cid, source_cid, result)
        {
            warn!("{} failed to answer Connect Request: {}", conn.id, err);
        }
    }

    /// Create the child channel for an inbound Connect Request. Returns the
    /// new local CID, or the Connect Response result to refuse with.
    fn spawn_inbound_channel(
        &self,
        conn: &mut L2capConnection,
        psm: Psm,
        source_cid: ChannelId,
    ) -> Result<ChannelId, u16> {
        if !psm.is_valid() {
            return Err(L2CAP_CR_BAD_PSM);
        }

        let Some(listener) = self.find_listener(&conn.local_addr, psm) else {
            debug!("{} no listener for {}", conn.id, psm);
            return Err(L2CAP_CR_BAD_PSM);
        };
        if conn.find_by_remote_cid(source_cid).is_some() {
            warn!("{} CID 0x{:04X} already in use", conn.id, source_cid);
            return Err(L2CAP_CR_NO_MEM);
        }

        let mut listener_inner = listener.lock();
        match listener_inner.listen.as_ref() {
            Some(listen) if listener_inner.state == L2capChannelState::Listening => {
                if listen.is_full() {
                    warn!("{} backlog of {} full", conn.id, psm);
                    return Err(L2CAP_CR_NO_MEM);
                }
            }
            _ => return Err(L2CAP_CR_BAD_PSM),
        }
        let cid = conn.allocate_cid().map_err(|_| L2CAP_CR_NO_MEM)?;

        let child = L2capChannel::new_child(&listener, &listener_inner);
        {
            let mut inner = child.lock();
            inner.local_addr = conn.local_addr;
            inner.remote_addr = conn.remote_addr;
            inner.local_cid = cid;
            inner.remote_cid = Some(source_cid);
            inner.connection = Some(conn.id);
            inner.state = L2capChannelState::Config;
            self.arm_channel_timer(conn.id, &mut inner, self.config.connect_timeout());
        }

        if let Some(listen) = listener_inner.listen.as_mut() {
            listen.accept_queue.push_back(child.clone());
        }
        drop(listener_inner);

        self.cancel_idle_timer(conn);
        conn.channels.insert(cid, child);
        debug!("{} channel 0x{:04X} created for {}", conn.id, cid, psm);
        Ok(cid)
    }

    /// Listening channel for `psm`, preferring one bound to `local` over a
    /// wildcard bind
    fn find_listener(&self, local: &BdAddr, psm: Psm) -> Option<L2capChannel> {
        let binds = self.binds();
        let listener = [*local, BdAddr::ANY]
            .iter()
            .filter_map(|addr| binds.get(&(*addr, psm)))
            .filter_map(Weak::upgrade)
            .map(L2capChannel::from_shared)
            .find(|channel| channel.state() == L2capChannelState::Listening);
        listener
    }

    fn handle_connection_response(
        &self,
        conn: &mut L2capConnection,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: u16,
        status: u16,
    ) {
        let channel = match source_cid {
            L2CAP_NULL_CID => conn.find_by_ident(identifier).cloned(),
            cid => conn.channel(cid).cloned(),
        };

        let Some(channel) = channel else {
            warn!("{} Connect Response for unknown channel", conn.id);
            return;
        };

        let mut inner = channel.lock();
        if inner.state != L2capChannelState::ConnectSent {
            debug!("Channel 0x{:04X} ignoring stale Connect Response", inner.local_cid);
            return;
        }

        match result {
            L2CAP_CR_SUCCESS => {
                inner.remote_cid = Some(destination_cid);
                inner.pending_ident = None;
                inner.state = L2capChannelState::Config;
                inner.config_state = ConfigState::empty();
                debug!(
                    "Channel 0x{:04X} connected to remote CID 0x{:04X}, configuring",
                    inner.local_cid, destination_cid
                );

                if let Err(err) = self.send_configure_request(conn, &mut inner) {
                    warn!("Channel 0x{:04X}: {}", inner.local_cid, err);
                }
            }
            L2CAP_CR_PENDING => {
                debug!(
                    "Channel 0x{:04X} connection pending (status 0x{:04X})",
                    inner.local_cid, status
                );
            }
            _ => {
                let cid = inner.local_cid;
                drop(inner);
                info!("Channel 0x{:04X} refused by peer (0x{:04X})", cid, result);
                self.destroy_channel(conn, cid, Some(L2capError::ConnectionRejected(result)));
            }
        }
    }

    fn handle_configure_request(
        &self,
        conn: &mut L2capConnection,
        identifier: SignalId,
        destination_cid: ChannelId,
        flags: u16,
        options: ConfigOptions,
    ) -> Result<(), Reject> {
        let Some(channel) = conn.channel(destination_cid).cloned() else {
            return Err(Reject::InvalidCid {
                local: destination_cid,
                remote: L2CAP_NULL_CID,
            });
        };

        let mut inner = channel.lock();
        let remote_cid = inner.remote_cid.unwrap_or(L2CAP_NULL_CID);

        if inner.state != L2capChannelState::Config {
            debug!(
                "Channel 0x{:04X} rejecting Configure Request in state {}",
                destination_cid, inner.state
            );
            self.send_configure_response(
                conn,
                identifier,
                remote_cid,
                0,
                L2CAP_CONF_REJECT,
                ConfigOptions::default(),
            );
            return Ok(());
        }

        inner.peer_config.merge(options);

        if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            self.send_configure_response(
                conn,
                identifier,
                remote_cid,
                L2CAP_CONF_FLAG_CONTINUATION,
                L2CAP_CONF_SUCCESS,
                ConfigOptions::default(),
            );
            return Ok(());
        }

        let requested = std::mem::take(&mut inner.peer_config);
        let peer_mtu = requested.mtu.unwrap_or(L2CAP_DEFAULT_MTU);

        if let Some(required) = inner.required_out_mtu {
            if peer_mtu < required {
                debug!(
                    "Channel 0x{:04X} peer MTU {} below required {}",
                    destination_cid, peer_mtu, required
                );
                self.send_configure_response(
                    conn,
                    identifier,
                    remote_cid,
                    0,
                    L2CAP_CONF_UNACCEPT,
                    ConfigOptions {
                        mtu: Some(required),
                        ..Default::default()
                    },
                );
                return Ok(());
            }
        }

        inner.options.out_mtu = peer_mtu;
        if let Some(flush_timeout) = requested.flush_timeout {
            inner.options.flush_timeout = flush_timeout;
        }
        if !requested.unknown.is_empty() {
            debug!(
                "Channel 0x{:04X} accepting request with ignored options {:02X?}",
                destination_cid, requested.unknown
            );
        }

        self.send_configure_response(
            conn,
            identifier,
            remote_cid,
            0,
            L2CAP_CONF_SUCCESS,
            ConfigOptions::default(),
        );
        inner.config_state |= ConfigState::OUTPUT_NEGOTIATED;

        if inner.config_state.is_complete() {
            drop(inner);
            self.channel_connected(&channel);
        } else if !inner.config_state.contains(ConfigState::OUTGOING_REQUEST_SENT) {
            if let Err(err) = self.send_configure_request(conn, &mut inner) {
                warn!("Channel 0x{:04X}: {}", destination_cid, err);
            }
        }

        Ok(())
    }

    fn handle_configure_response(
        &self,
        conn: &mut L2capConnection,
        source_cid: ChannelId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    ) {
        let Some(channel) = conn.channel(source_cid).cloned() else {
            warn!("{} Configure Response for unknown CID 0x{:04X}", conn.id, source_cid);
            return;
        };

        let mut inner = channel.lock();
        if inner.state != L2capChannelState::Config {
            debug!("Channel 0x{:04X} ignoring stale Configure Response", source_cid);
            return;
        }

        if result != L2CAP_CONF_SUCCESS {
            warn!(
                "Channel 0x{:04X} configuration refused (result 0x{:04X}, {:?})",
                source_cid, result, options
            );
            inner.error = Some(L2capError::ConnectionRefused);
            self.start_disconnect(conn, &mut inner);
            drop(inner);
            channel.notify();
            return;
        }

        if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            return;
        }

        inner.pending_ident = None;
        inner.config_state |= ConfigState::INPUT_NEGOTIATED;

        if inner.config_state.is_complete() {
            drop(inner);
            self.channel_connected(&channel);
        }
    }

    fn handle_disconnection_request(
        &self,
        conn: &mut L2capConnection,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) -> Result<(), Reject> {
        if conn.channel(destination_cid).is_none() {
            return Err(Reject::InvalidCid {
                local: destination_cid,
                remote: source_cid,
            });
        }

        if let Err(err) =
            self.send_disconnect_response(conn, identifier, destination_cid, source_cid)
        {
            warn!("{} failed to answer Disconnect Request: {}", conn.id, err);
        }

        info!("Channel 0x{:04X} disconnected by peer", destination_cid);
        self.destroy_channel(conn, destination_cid, Some(L2capError::ConnectionReset));
        Ok(())
    }

    fn handle_disconnection_response(&self, conn: &mut L2capConnection, source_cid: ChannelId) {
        let state = match conn.channel(source_cid) {
            Some(channel) => channel.state(),
            None => {
                debug!("{} Disconnect Response for unknown CID 0x{:04X}", conn.id, source_cid);
                return;
            }
        };

        if state == L2capChannelState::DisconnectSent {
            self.destroy_channel(conn, source_cid, None);
        }
    }

    // ---- Signaling transmit --------------------------------------------

    fn send_signal(&self, conn: &L2capConnection, message: &SignalingMessage) {
        if let Err(err) = conn.send_signal(self.transport.as_ref(), message) {
            warn!(
                "{} failed to send command 0x{:02X}: {}",
                conn.id,
                message.command_code(),
                err
            );
        }
    }

    fn send_command_reject(&self, conn: &L2capConnection, identifier: SignalId, reject: Reject) {
        let (reason, data) = match reject {
            Reject::NotUnderstood(why) => {
                warn!("{} rejecting command {}: {}", conn.id, identifier, why);
                (L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new())
            }
            Reject::InvalidCid { local, remote } => {
                warn!(
                    "{} rejecting command {}: invalid CID 0x{:04X}",
                    conn.id, identifier, local
                );
                let mut data = Vec::with_capacity(4);
                data.extend_from_slice(&local.to_le_bytes());
                data.extend_from_slice(&remote.to_le_bytes());
                (L2CAP_REJECT_INVALID_CID, data)
            }
        };

        let message = SignalingMessage::CommandReject {
            identifier,
            reason,
            data,
        };
        self.send_signal(conn, &message);
    }

    fn send_connect_request(&self, conn: &mut L2capConnection, inner: &mut ChannelInner) -> L2capResult<()> {
        let identifier = conn.next_ident();
        inner.pending_ident = Some(identifier);
        inner.state = L2capChannelState::ConnectSent;

        let message = SignalingMessage::ConnectionRequest {
            identifier,
            psm: inner.psm,
            source_cid: inner.local_cid,
        };
        conn.send_signal(self.transport.as_ref(), &message)
    }

    fn send_connect_response(
        &self,
        conn: &L2capConnection,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: u16,
    ) -> L2capResult<()> {
        let message = SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid,
            source_cid,
            result,
            status: L2CAP_CS_NO_INFO,
        };
        conn.send_signal(self.transport.as_ref(), &message)
    }

    /// Send our Configure Request. Only an MTU differing from the default
    /// is proposed.
    fn send_configure_request(&self, conn: &mut L2capConnection, inner: &mut ChannelInner) -> L2capResult<()> {
        let destination_cid = inner.remote_cid.ok_or(L2capError::NotConnected)?;
        let identifier = conn.next_ident();

        let mut options = ConfigOptions::default();
        if inner.options.in_mtu != L2CAP_DEFAULT_MTU {
            options.mtu = Some(inner.options.in_mtu);
        }

        inner.pending_ident = Some(identifier);
        inner.config_state |= ConfigState::OUTGOING_REQUEST_SENT;

        let message = SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid,
            flags: 0,
            options,
        };
        conn.send_signal(self.transport.as_ref(), &message)
    }

    fn send_configure_response(
        &self,
        conn: &L2capConnection,
        identifier: SignalId,
        source_cid: ChannelId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    ) {
        let message = SignalingMessage::ConfigureResponse {
            identifier,
            source_cid,
            flags,
            result,
            options,
        };
        self.send_signal(conn, &message);
    }

    fn send_disconnect_request(&self, conn: &mut L2capConnection, inner: &mut ChannelInner) -> L2capResult<()> {
        let identifier = conn.next_ident();
        inner.pending_ident = Some(identifier);

        let message = SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: inner.remote_cid.unwrap_or(L2CAP_NULL_CID),
            source_cid: inner.local_cid,
        };
        conn.send_signal(self.transport.as_ref(), &message)
    }

    fn send_disconnect_response(
        &self,
        conn: &L2capConnection,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) -> L2capResult<()> {
        let message = SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid,
            source_cid,
        };
        conn.send_signal(self.transport.as_ref(), &message)
    }

    // ---- Application API -----------------------------------------------

    /// Create a connection-oriented channel
    pub fn create_channel(&self) -> L2capChannel {
        L2capChannel::new(L2capChannelType::ConnectionOriented, self.config.default_mtu)
    }

    /// Create a raw signaling channel
    pub fn open_raw(&self) -> L2capChannel {
        L2capChannel::new(L2capChannelType::Raw, L2CAP_DEFAULT_MTU)
    }

    /// Bind a channel to a local address and PSM. PSM 0 binds the address
    /// only.
    pub fn bind(&self, channel: &L2capChannel, local: BdAddr, psm: Psm) -> L2capResult<()> {
        if psm.value() != 0 && !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid {}", psm)));
        }

        let mut binds = self.binds();
        let mut inner = channel.lock();
        if inner.bound || inner.state != L2capChannelState::Closed {
            return Err(L2capError::InvalidState);
        }

        if psm.value() != 0 {
            let key = (local, psm);
            if binds.get(&key).and_then(Weak::upgrade).is_some() {
                return Err(L2capError::AddressInUse);
            }
            binds.insert(key, channel.downgrade());
        }

        inner.local_addr = local;
        inner.psm = psm;
        inner.bound = true;
        if inner.kind == L2capChannelType::ConnectionOriented {
            inner.state = L2capChannelState::Bound;
        }
        debug!("Channel bound to {} {}", local, psm);
        Ok(())
    }

    fn release_bind(&self, channel: &L2capChannel) {
        self.binds()
            .retain(|_, weak| weak.strong_count() > 0 && !channel.is(weak));
    }

    /// Start connecting a channel to `psm` on `remote`. Returns once the
    /// Connect Request is sent or queued behind the baseband link; use
    /// `wait_connected` to block for the outcome.
    pub fn connect(&self, channel: &L2capChannel, remote: BdAddr, psm: Psm) -> L2capResult<()> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid {}", psm)));
        }

        let hint = {
            let inner = channel.lock();
            if inner.kind != L2capChannelType::ConnectionOriented
                || !matches!(inner.state, L2capChannelState::Closed | L2capChannelState::Bound)
            {
                return Err(L2capError::InvalidState);
            }
            inner.local_addr
        };

        // a link closed by idle teardown is replaced on the second attempt
        for _ in 0..2 {
            let connection = self.connect_outbound(hint, remote)?;
            let mut conn = lock_connection(&connection);
            if conn.state == LinkState::Closed {
                continue;
            }
            return self.attach_outbound(&mut conn, channel, remote, psm);
        }

        Err(L2capError::ConnectionAborted)
    }

    fn attach_outbound(
        &self,
        conn: &mut L2capConnection,
        channel: &L2capChannel,
        remote: BdAddr,
        psm: Psm,
    ) -> L2capResult<()> {
        let mut inner = channel.lock();
        if !matches!(inner.state, L2capChannelState::Closed | L2capChannelState::Bound) {
            return Err(L2capError::InvalidState);
        }

        let cid = conn.allocate_cid()?;
        inner.local_addr = conn.local_addr;
        inner.remote_addr = remote;
        inner.psm = psm;
        inner.local_cid = cid;
        inner.remote_cid = None;
        inner.connection = Some(conn.id);
        inner.config_state = ConfigState::empty();
        inner.error = None;
        inner.teardown_notified = false;
        inner.rx_queue.clear();
        self.arm_channel_timer(conn.id, &mut inner, self.config.connect_timeout());

        conn.channels.insert(cid, channel.clone());
        self.cancel_idle_timer(conn);
        debug!("{} channel 0x{:04X} connecting to {} {}", conn.id, cid, remote, psm);

        if conn.state != LinkState::Connected {
            inner.state = L2capChannelState::WaitLink;
            return Ok(());
        }

        if let Err(err) = self.send_connect_request(conn, &mut inner) {
            drop(inner);
            self.destroy_channel(conn, cid, None);
            return Err(err);
        }
        Ok(())
    }

    /// Block until the channel is CONNECTED or fails
    pub fn wait_connected(&self, channel: &L2capChannel, timeout: Option<Duration>) -> L2capResult<()> {
        channel.wait(timeout, |inner| {
            if let Some(err) = inner.error.take() {
                return Some(Err(err));
            }
            match inner.state {
                L2capChannelState::Connected => Some(Ok(())),
                L2capChannelState::WaitLink
                | L2capChannelState::ConnectSent
                | L2capChannelState::Config => None,
                _ => Some(Err(L2capError::NotConnected)),
            }
        })
    }

    /// `connect` followed by `wait_connected`
    pub fn connect_blocking(
        &self,
        channel: &L2capChannel,
        remote: BdAddr,
        psm: Psm,
        timeout: Option<Duration>,
    ) -> L2capResult<()> {
        self.connect(channel, remote, psm)?;
        self.wait_connected(channel, timeout)
    }

    /// Attach a raw channel to the link with `remote`. It receives a copy of
    /// every signaling frame on that link and sends its data as signaling
    /// frames.
    pub fn connect_raw(&self, channel: &L2capChannel, remote: BdAddr) -> L2capResult<()> {
        let hint = {
            let inner = channel.lock();
            if inner.kind != L2capChannelType::Raw || inner.state != L2capChannelState::Closed {
                return Err(L2capError::InvalidState);
            }
            inner.local_addr
        };

        for _ in 0..2 {
            let connection = self.connect_outbound(hint, remote)?;
            let mut conn = lock_connection(&connection);
            if conn.state == LinkState::Closed {
                continue;
            }

            let mut inner = channel.lock();
            if inner.state != L2capChannelState::Closed {
                return Err(L2capError::InvalidState);
            }
            inner.local_addr = conn.local_addr;
            inner.remote_addr = remote;
            inner.local_cid = L2CAP_SIGNALING_CID;
            inner.remote_cid = Some(L2CAP_SIGNALING_CID);
            inner.connection = Some(conn.id);
            inner.error = None;
            inner.teardown_notified = false;
            inner.rx_queue.clear();

            conn.raw_channels.push(channel.clone());
            self.cancel_idle_timer(&mut conn);

            if conn.state == LinkState::Connected {
                inner.state = L2capChannelState::Connected;
                self.emit(ChannelEvent::Connected {
                    channel: channel.id(),
                    cid: L2CAP_SIGNALING_CID,
                    psm: inner.psm,
                });
                drop(inner);
                channel.notify();
            } else {
                inner.state = L2capChannelState::WaitLink;
            }
            return Ok(());
        }

        Err(L2capError::ConnectionAborted)
    }

    /// Accept inbound channels on a bound channel
    pub fn listen(&self, channel: &L2capChannel, backlog: usize) -> L2capResult<()> {
        if backlog == 0 {
            return Err(L2capError::InvalidParameter("Backlog must be positive".into()));
        }
        let backlog = backlog.min(self.config.max_backlog);

        let mut inner = channel.lock();
        if inner.kind != L2capChannelType::ConnectionOriented
            || inner.state != L2capChannelState::Bound
            || !inner.psm.is_valid()
        {
            return Err(L2capError::InvalidState);
        }

        inner.state = L2capChannelState::Listening;
        inner.listen = Some(ListenQueue::new(backlog));
        info!("Listening on {} {} (backlog {})", inner.local_addr, inner.psm, backlog);
        Ok(())
    }

    fn take_ready_child(inner: &mut ChannelInner) -> Option<L2capResult<L2capChannel>> {
        if inner.state != L2capChannelState::Listening {
            return Some(Err(L2capError::InvalidState));
        }

        let listen = inner.listen.as_mut()?;
        let position = listen
            .accept_queue
            .iter()
            .position(|child| child.state() == L2capChannelState::Connected)?;
        let child = listen.accept_queue.remove(position)?;
        child.lock().parent = None;
        Some(Ok(child))
    }

    /// Block until a child of `listener` is CONNECTED and return it
    pub fn accept(&self, listener: &L2capChannel, timeout: Option<Duration>) -> L2capResult<L2capChannel> {
        listener.wait(timeout, Self::take_ready_child)
    }

    /// Return a CONNECTED child of `listener` if one is ready
    pub fn try_accept(&self, listener: &L2capChannel) -> L2capResult<Option<L2capChannel>> {
        let mut inner = listener.lock();
        Self::take_ready_child(&mut inner).transpose()
    }

    /// Send one SDU. Fails without transmitting anything if `data` exceeds
    /// the outbound MTU.
    pub fn send(&self, channel: &L2capChannel, data: &[u8]) -> L2capResult<()> {
        let id = channel.lock().connection.ok_or(L2capError::NotConnected)?;
        let connection = self.connection(id).ok_or(L2capError::NotConnected)?;

        let conn = lock_connection(&connection);
        let inner = channel.lock();
        if inner.connection != Some(conn.id) || inner.state != L2capChannelState::Connected {
            return Err(L2capError::NotConnected);
        }

        let (cid, mtu) = match inner.kind {
            L2capChannelType::Raw => (L2CAP_SIGNALING_CID, L2CAP_DEFAULT_MTU),
            L2capChannelType::ConnectionOriented => (
                inner.remote_cid.ok_or(L2capError::NotConnected)?,
                inner.options.out_mtu,
            ),
        };

        if data.len() > mtu as usize {
            return Err(L2capError::MtuExceeded);
        }

        conn.send_frame(self.transport.as_ref(), cid, data, inner.priority)
    }

    fn pop_received(inner: &mut ChannelInner) -> Option<L2capResult<Vec<u8>>> {
        if let Some(data) = inner.rx_queue.pop_front() {
            return Some(Ok(data));
        }
        if inner.state == L2capChannelState::Connected {
            return None;
        }
        Some(Err(inner.error.take().unwrap_or(L2capError::NotConnected)))
    }

    /// Block until an SDU arrives
    pub fn receive(&self, channel: &L2capChannel, timeout: Option<Duration>) -> L2capResult<Vec<u8>> {
        channel.wait(timeout, Self::pop_received)
    }

    /// Return a queued SDU if there is one
    pub fn try_receive(&self, channel: &L2capChannel) -> L2capResult<Option<Vec<u8>>> {
        let mut inner = channel.lock();
        Self::pop_received(&mut inner).transpose()
    }

    /// Close a channel. Closing an already closed channel does nothing.
    pub fn close(&self, channel: &L2capChannel) -> L2capResult<()> {
        self.release_bind(channel);

        let (state, connection) = {
            let mut inner = channel.lock();
            inner.bound = false;
            (inner.state, inner.connection)
        };

        match state {
            L2capChannelState::Closed => {}
            L2capChannelState::Bound => {
                let mut inner = channel.lock();
                if inner.state == L2capChannelState::Bound {
                    inner.state = L2capChannelState::Closed;
                }
            }
            L2capChannelState::Listening => self.close_listener(channel),
            _ => {
                // a missing connection is mid-teardown and will close the channel
                let Some(connection) = connection.and_then(|id| self.connection(id)) else {
                    return Ok(());
                };
                let mut conn = lock_connection(&connection);
                self.close_attached(&mut conn, channel);
            }
        }

        Ok(())
    }

    fn close_attached(&self, conn: &mut L2capConnection, channel: &L2capChannel) {
        let mut inner = channel.lock();
        if inner.connection != Some(conn.id) {
            return;
        }

        match (inner.kind, inner.state) {
            (L2capChannelType::Raw, _) => {
                drop(inner);
                self.detach_raw(conn, channel, None);
            }
            (_, L2capChannelState::Config | L2capChannelState::Connected) => {
                debug!("Channel 0x{:04X} closing", inner.local_cid);
                self.start_disconnect(conn, &mut inner);
            }
            (_, L2capChannelState::DisconnectSent) => {}
            _ => {
                let cid = inner.local_cid;
                drop(inner);
                self.destroy_channel(conn, cid, Some(L2capError::ConnectionAborted));
            }
        }
    }

    /// Stop listening and close every child that was never accepted
    fn close_listener(&self, listener: &L2capChannel) {
        let children = {
            let mut inner = listener.lock();
            if inner.state != L2capChannelState::Listening {
                return;
            }
            inner.state = L2capChannelState::Closed;
            info!("Stopped listening on {}", inner.psm);
            inner
                .listen
                .take()
                .map(|listen| listen.accept_queue)
                .unwrap_or_default()
        };
        listener.notify();

        for child in children {
            child.lock().parent = None;
            if let Err(err) = self.close(&child) {
                warn!("Failed to close pending channel: {}", err);
            }
        }
    }

    /// Set the MTUs a channel will negotiate with. `out_mtu` becomes the
    /// smallest peer MTU the channel accepts.
    pub fn set_options(&self, channel: &L2capChannel, in_mtu: u16, out_mtu: u16) -> L2capResult<()> {
        if in_mtu < L2CAP_MIN_MTU || out_mtu < L2CAP_MIN_MTU {
            return Err(L2capError::InvalidParameter(format!(
                "MTU below minimum of {}",
                L2CAP_MIN_MTU
            )));
        }

        let mut inner = channel.lock();
        if inner.kind == L2capChannelType::Raw
            || !matches!(
                inner.state,
                L2capChannelState::Closed | L2capChannelState::Bound | L2capChannelState::Listening
            )
        {
            return Err(L2capError::InvalidState);
        }

        inner.options.in_mtu = in_mtu;
        inner.options.out_mtu = out_mtu;
        inner.required_out_mtu = Some(out_mtu);
        Ok(())
    }

    pub fn get_options(&self, channel: &L2capChannel) -> ChannelOptions {
        channel.lock().options
    }

    /// Priority handed to the baseband with every outbound data fragment
    pub fn set_priority(&self, channel: &L2capChannel, priority: u8) {
        channel.lock().priority = priority;
    }

    /// Wake a thread blocked on `channel` with `Interrupted`
    pub fn interrupt(&self, channel: &L2capChannel) {
        channel.interrupt();
    }
}
