//! L2CAP Channel implementation
//!
//! This module provides the L2CAP channel abstraction which represents
//! a logical connection between two devices for a specific protocol or
//! service.
//!
//! A channel is shared between the application, which holds an
//! [`L2capChannel`] handle, and the connection it is multiplexed on, which
//! keeps a clone in its CID table. All mutable fields live behind one mutex
//! paired with a condition variable, so blocked callers wake on every state
//! change. Lock order: connection, then channel; a parent listening channel
//! before any of its children.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::constants::*;
use super::psm::Psm;
use super::timer::TimerKey;
use super::types::*;
use crate::error::{L2capError, L2capResult};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable state of a channel
#[derive(Debug)]
pub(crate) struct ChannelInner {
    pub kind: L2capChannelType,
    pub state: L2capChannelState,
    pub local_addr: BdAddr,
    pub remote_addr: BdAddr,
    pub psm: Psm,
    /// Set by `bind`; a bound channel may not be bound again
    pub bound: bool,
    pub local_cid: ChannelId,
    /// Unset until the Connect exchange for that direction completes
    pub remote_cid: Option<ChannelId>,
    /// Connection the channel is attached to, resolved through the manager
    pub connection: Option<ConnectionId>,
    pub config_state: ConfigState,
    /// Identifier of the in-flight Connect/Configure request
    pub pending_ident: Option<SignalId>,
    /// Options of the peer's Configure Request, accumulated across
    /// continuation segments
    pub peer_config: ConfigOptions,
    pub options: ChannelOptions,
    /// Smallest outbound MTU the application is willing to run with
    pub required_out_mtu: Option<u16>,
    pub priority: u8,
    pub timer: Option<TimerKey>,
    /// Channel-fatal error, handed to exactly one waiter
    pub error: Option<L2capError>,
    pub rx_queue: VecDeque<Vec<u8>>,
    pub listen: Option<ListenQueue>,
    /// Listening channel this one was spawned from, until accepted
    pub parent: Option<Weak<ChannelShared>>,
    /// Bumped by `interrupt`; a wait only honours bumps made after it began
    pub interrupts: u64,
    pub teardown_notified: bool,
}

/// Accept queue of a listening channel
#[derive(Debug)]
pub(crate) struct ListenQueue {
    pub backlog_max: usize,
    /// Children spawned from inbound requests, in arrival order. Children
    /// still configuring count against the backlog.
    pub accept_queue: VecDeque<L2capChannel>,
}

impl ListenQueue {
    pub fn new(backlog_max: usize) -> Self {
        Self {
            backlog_max,
            accept_queue: VecDeque::new(),
        }
    }

    pub fn backlog_current(&self) -> usize {
        self.accept_queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.backlog_current() >= self.backlog_max
    }
}

#[derive(Debug)]
pub(crate) struct ChannelShared {
    id: u64,
    inner: Mutex<ChannelInner>,
    cond: Condvar,
}

/// Handle to an L2CAP channel
#[derive(Clone)]
pub struct L2capChannel {
    shared: Arc<ChannelShared>,
}

impl L2capChannel {
    pub(crate) fn new(kind: L2capChannelType, default_mtu: u16) -> Self {
        let mtu = if kind == L2capChannelType::Raw {
            L2CAP_DEFAULT_MTU
        } else {
            default_mtu
        };

        let inner = ChannelInner {
            kind,
            state: L2capChannelState::Closed,
            local_addr: BdAddr::ANY,
            remote_addr: BdAddr::ANY,
            psm: Psm(0),
            bound: false,
            local_cid: L2CAP_NULL_CID,
            remote_cid: None,
            connection: None,
            config_state: ConfigState::empty(),
            pending_ident: None,
            peer_config: ConfigOptions::default(),
            options: ChannelOptions {
                in_mtu: mtu,
                out_mtu: mtu,
                flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
            },
            required_out_mtu: None,
            priority: L2CAP_DEFAULT_PRIORITY,
            timer: None,
            error: None,
            rx_queue: VecDeque::new(),
            listen: None,
            parent: None,
            interrupts: 0,
            teardown_notified: false,
        };

        Self {
            shared: Arc::new(ChannelShared {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                inner: Mutex::new(inner),
                cond: Condvar::new(),
            }),
        }
    }

    /// Spawn a child for an inbound request on a listening channel. The
    /// child inherits the listener's MTU preferences and priority.
    pub(crate) fn new_child(parent: &L2capChannel, parent_inner: &ChannelInner) -> Self {
        let child = Self::new(L2capChannelType::ConnectionOriented, parent_inner.options.in_mtu);
        {
            let mut inner = child.lock();
            inner.local_addr = parent_inner.local_addr;
            inner.psm = parent_inner.psm;
            inner.options = parent_inner.options;
            inner.required_out_mtu = parent_inner.required_out_mtu;
            inner.priority = parent_inner.priority;
            inner.parent = Some(Arc::downgrade(&parent.shared));
        }
        child
    }

    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    /// Process-unique identifier of this channel
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelShared> {
        Arc::downgrade(&self.shared)
    }

    /// Wake every thread blocked on this channel
    pub(crate) fn notify(&self) {
        self.shared.cond.notify_all();
    }

    pub fn ptr_eq(&self, other: &L2capChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether `weak` refers to this channel
    pub(crate) fn is(&self, weak: &Weak<ChannelShared>) -> bool {
        std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.shared))
    }

    /// Get the channel state
    pub fn state(&self) -> L2capChannelState {
        self.lock().state
    }

    /// Get the channel type
    pub fn channel_type(&self) -> L2capChannelType {
        self.lock().kind
    }

    /// Get the local Channel Identifier (CID)
    pub fn local_cid(&self) -> ChannelId {
        self.lock().local_cid
    }

    /// Get the remote Channel Identifier (CID), if known
    pub fn remote_cid(&self) -> Option<ChannelId> {
        self.lock().remote_cid
    }

    /// Get the Protocol/Service Multiplexer (PSM)
    pub fn psm(&self) -> Psm {
        self.lock().psm
    }

    pub fn local_addr(&self) -> BdAddr {
        self.lock().local_addr
    }

    pub fn remote_addr(&self) -> BdAddr {
        self.lock().remote_addr
    }

    pub fn config_state(&self) -> ConfigState {
        self.lock().config_state
    }

    /// Take the channel-fatal error, if one is pending. Subsequent calls
    /// return `None`.
    pub fn take_error(&self) -> Option<L2capError> {
        self.lock().error.take()
    }

    /// Number of children counted against the listen backlog
    pub fn backlog(&self) -> Option<usize> {
        self.lock().listen.as_ref().map(ListenQueue::backlog_current)
    }

    /// Cancel the waits currently blocked on this channel with
    /// `Interrupted`. Waits started afterwards are unaffected.
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupts = inner.interrupts.wrapping_add(1);
        drop(inner);
        self.notify();
    }

    /// Block until `poll` yields a result, the channel is interrupted, or
    /// `timeout` elapses.
    pub(crate) fn wait<T, F>(&self, timeout: Option<Duration>, mut poll: F) -> L2capResult<T>
    where
        F: FnMut(&mut ChannelInner) -> Option<L2capResult<T>>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        let interrupts = inner.interrupts;

        loop {
            if let Some(result) = poll(&mut inner) {
                return result;
            }

            if inner.interrupts != interrupts {
                return Err(L2capError::Interrupted);
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(L2capError::Timeout);
                    }
                    self.shared
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .cond
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("L2capChannel")
            .field("id", &self.shared.id)
            .field("kind", &inner.kind)
            .field("state", &inner.state)
            .field("psm", &inner.psm)
            .field("local_cid", &inner.local_cid)
            .field("remote_cid", &inner.remote_cid)
            .field("options", &inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_channel_defaults() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(channel.local_cid(), L2CAP_NULL_CID);
        assert_eq!(channel.remote_cid(), None);
        assert!(channel.config_state().is_empty());
        assert_eq!(channel.lock().options, ChannelOptions::default());

        let other = L2capChannel::new(L2capChannelType::Raw, 1000);
        assert_ne!(channel.id(), other.id());
        assert_eq!(other.lock().options.in_mtu, L2CAP_DEFAULT_MTU);
    }

    #[test]
    fn test_wait_times_out() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        let result: L2capResult<()> = channel.wait(Some(Duration::from_millis(10)), |_| None);
        assert_eq!(result, Err(L2capError::Timeout));
    }

    #[test]
    fn test_wait_is_interrupted() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        let waiter = channel.clone();
        let handle =
            thread::spawn(move || waiter.wait::<(), _>(Some(Duration::from_secs(5)), |_| None));

        // only a wait already in progress is cancelled
        while !handle.is_finished() {
            channel.interrupt();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.join().unwrap(), Err(L2capError::Interrupted));
    }

    #[test]
    fn test_interrupt_without_waiter_is_not_kept() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        channel.interrupt();
        let result: L2capResult<()> = channel.wait(Some(Duration::from_millis(10)), |_| None);
        assert_eq!(result, Err(L2capError::Timeout));
    }

    #[test]
    fn test_child_inherits_listener_options() {
        let listener = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        {
            let mut inner = listener.lock();
            inner.options.in_mtu = 1024;
            inner.options.out_mtu = 48;
            inner.required_out_mtu = Some(48);
        }

        let child = L2capChannel::new_child(&listener, &listener.lock());
        let inner = child.lock();
        assert_eq!(inner.options.in_mtu, 1024);
        assert_eq!(inner.options.out_mtu, 48);
        assert_eq!(inner.required_out_mtu, Some(48));
        assert!(inner.parent.as_ref().is_some_and(|weak| listener.is(weak)));
    }

    #[test]
    fn test_wait_wakes_on_state_change() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        let waiter = channel.clone();
        let handle = thread::spawn(move || {
            waiter.wait(Some(Duration::from_secs(5)), |inner| {
                (inner.state == L2capChannelState::Connected).then_some(Ok(()))
            })
        });

        thread::sleep(Duration::from_millis(20));
        channel.lock().state = L2capChannelState::Connected;
        channel.notify();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_error_read_once() {
        let channel = L2capChannel::new(L2capChannelType::ConnectionOriented, 672);
        channel.lock().error = Some(L2capError::ConnectionReset);
        assert_eq!(channel.take_error(), Some(L2capError::ConnectionReset));
        assert_eq!(channel.take_error(), None);
    }
}
