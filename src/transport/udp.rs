//! Datagram transport: connection-oriented channels over one shared UDP
//! socket.
//!
//! One receive loop owns all reads from the socket and demultiplexes by the
//! 4-byte discriminant: opcodes 1/2/3 route to the SYN/ACK/FIN handshake
//! logic, anything else is an established channel's connection id. Channels
//! write back through the same shared socket; no locking is layered on top of
//! what the socket already guarantees for concurrent sends.
//!
//! Servicing is tick-driven: an external driver calls [`Service::update`]
//! once per cycle. The pass advances the service's coarse clock, drains the
//! deferred-event index into the dirty set, services every dirty channel that
//! is still registered, and finally purges channels queued for removal during
//! the tick — so a channel marked dirty and removed in the same tick is still
//! serviced once before it goes, and the registry is never mutated while it
//! is being iterated.
//!
//! ## Handshake
//! ```text
//! client                              server
//!   |-- SYN{request} ------------------>|  needs a pending accept waiter
//!   |<-- ACK{request, response} --------|  fresh server-local id
//!   |   (Handshaking -> Connected)      |
//!   |-- FIN{sender, target} ----------->|  best effort, either direction
//! ```
//! A retransmitted SYN for an already-registered request id is answered with
//! the same ACK and creates no second channel. Malformed or unknown packets
//! are dropped silently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::completion::{completion, Completion};
use crate::core::deferred::DeferredIndex;
use crate::error::{Result, TransportError};
use crate::protocol::packet::{Packet, FIRST_CONN_ID};
use crate::transport::{Channel, ChannelState, ErrorHandler, RecvHandler, Service};
use crate::utils::time::now_ms;

/// Largest datagram the receive loop will accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Interval between SYN retransmissions while a connect is in flight.
const HANDSHAKE_RETRY_MS: u64 = 300;

/// Datagram transport service: shared socket, handshake, tick scheduling.
pub struct UdpService {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    inner: Arc<Mutex<UdpInner>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UdpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpService")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct UdpInner {
    /// Local connection id -> channel. Keys are unique per service.
    channels: HashMap<u32, Arc<UdpChannel>>,
    /// Peer-chosen request id -> local id, for idempotent duplicate-SYN ACKs.
    accepted: HashMap<u32, u32>,
    /// Single-slot accept waiter; a new accept call replaces it.
    pending_accept: Option<Completion<Arc<UdpChannel>>>,
    /// Channels to service on the next update pass.
    dirty: HashSet<u32>,
    /// Channels queued for removal; purged at end of tick.
    removed: VecDeque<u32>,
    /// Channels waiting for a future tick.
    scheduled: DeferredIndex<u32>,
    /// Coarse clock, advanced once per update pass.
    time_now: u64,
    next_id: u32,
    disposed: bool,
}

impl UdpInner {
    fn alloc_conn_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl UdpService {
    /// Bind a service on `addr`. Server role, though the same instance can
    /// also originate outbound connections.
    ///
    /// # Errors
    /// Fails with [`TransportError::Bind`] (carrying `addr`) if the local
    /// port cannot be bound; construction is not retried internally.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Self::from_socket(socket)
    }

    /// Client-only service on an ephemeral local port.
    pub async fn client() -> Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await
    }

    fn from_socket(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let inner = Arc::new(Mutex::new(UdpInner {
            channels: HashMap::new(),
            accepted: HashMap::new(),
            pending_accept: None,
            dirty: HashSet::new(),
            removed: VecDeque::new(),
            scheduled: DeferredIndex::new(),
            time_now: now_ms(),
            next_id: FIRST_CONN_ID,
            disposed: false,
        }));
        let recv_task = tokio::spawn(Self::recv_loop(
            Arc::clone(&socket),
            Arc::downgrade(&inner),
        ));
        debug!(%local_addr, "udp service bound");
        Ok(Self {
            socket,
            local_addr,
            inner,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Coarse clock value of the last update pass, in milliseconds.
    pub fn time_now(&self) -> u64 {
        self.inner.lock().map(|inner| inner.time_now).unwrap_or(0)
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.channels.len())
            .unwrap_or(0)
    }

    /// Mark a channel for servicing on the next update pass.
    pub fn mark_dirty(&self, id: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.dirty.insert(id);
        }
    }

    /// Schedule a channel for servicing at or after `time` (service clock).
    pub fn schedule_update(&self, time: u64, id: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scheduled.add(time, id);
        }
    }

    /// Single receive loop; owns all reads from the shared socket. Transient
    /// receive errors are logged and the loop keeps running.
    async fn recv_loop(socket: Arc<UdpSocket>, weak: Weak<Mutex<UdpInner>>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "udp receive failed, continuing");
                    continue;
                }
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.lock().map(|g| g.disposed).unwrap_or(true) {
                return;
            }
            match Packet::parse(&buf[..len]) {
                Some(Packet::Syn { request }) => {
                    Self::handle_accept(&socket, &inner, request, peer);
                }
                Some(Packet::Ack { request, response }) => {
                    Self::handle_connect(&inner, request, response);
                }
                Some(Packet::Fin { conn }) => {
                    Self::handle_disconnect(&inner, conn);
                }
                Some(Packet::Data { conn, payload }) => {
                    Self::handle_data(&inner, conn, payload);
                }
                None => {
                    trace!(len, %peer, "dropping malformed datagram");
                }
            }
        }
    }

    /// Inbound SYN. Duplicate request ids get the previous ACK re-sent; a
    /// fresh request needs the pending accept waiter, otherwise it is
    /// dropped — unsolicited connections are not queued.
    fn handle_accept(
        socket: &Arc<UdpSocket>,
        inner: &Arc<Mutex<UdpInner>>,
        request: u32,
        peer: SocketAddr,
    ) {
        let (mut waiter, channel) = {
            let Ok(mut guard) = inner.lock() else {
                return;
            };
            if let Some(&local) = guard.accepted.get(&request) {
                trace!(request, local, %peer, "retransmitted syn, re-acking");
                if let Err(e) = socket.try_send_to(&Packet::ack(request, local), peer) {
                    trace!(error = %e, %peer, "ack resend failed");
                }
                return;
            }
            let Some(waiter) = guard.pending_accept.take() else {
                trace!(request, %peer, "syn dropped, no pending accept");
                return;
            };
            let local = guard.alloc_conn_id();
            let channel = Arc::new(UdpChannel::new(
                local,
                Some(request),
                peer,
                ChannelState::Connected,
                Arc::clone(socket),
                Arc::downgrade(inner),
            ));
            guard.channels.insert(local, Arc::clone(&channel));
            guard.accepted.insert(request, local);
            (waiter, channel)
        };
        debug!(request, local = channel.id(), %peer, "accepted inbound channel");
        if let Err(e) = socket.try_send_to(&Packet::ack(request, channel.id()), peer) {
            warn!(error = %e, %peer, "ack send failed");
        }
        waiter.resolve(channel);
    }

    /// Inbound ACK completes a client-side connect: bind the remote id and
    /// flip the channel to Connected on the next servicing pass.
    fn handle_connect(inner: &Arc<Mutex<UdpInner>>, request: u32, response: u32) {
        let channel = {
            let Ok(mut guard) = inner.lock() else {
                return;
            };
            let Some(channel) = guard.channels.get(&request).cloned() else {
                trace!(request, "ack for unknown request id dropped");
                return;
            };
            // Flush anything queued while the handshake was in flight.
            guard.dirty.insert(request);
            channel
        };
        channel.handle_connect(response);
    }

    /// Inbound FIN: remove and dispose immediately. Teardown has no
    /// handshake and may itself be lost without retry.
    fn handle_disconnect(inner: &Arc<Mutex<UdpInner>>, conn: u32) {
        let channel = {
            let Ok(mut guard) = inner.lock() else {
                return;
            };
            let Some(channel) = guard.channels.remove(&conn) else {
                trace!(conn, "fin for unknown channel dropped");
                return;
            };
            guard.dirty.remove(&conn);
            guard.scheduled.remove(&conn);
            channel
        };
        if let Some(remote) = channel.remote_id() {
            if let Ok(mut guard) = inner.lock() {
                guard.accepted.remove(&remote);
            }
        }
        debug!(conn, "peer closed channel");
        channel.signal_error(TransportError::PeerReset);
        channel.close(false);
    }

    /// Inbound payload for an established channel. Unknown ids are dropped
    /// with no registry mutation.
    fn handle_data(inner: &Arc<Mutex<UdpInner>>, conn: u32, payload: &[u8]) {
        let (channel, tick) = {
            let Ok(mut guard) = inner.lock() else {
                return;
            };
            let Some(channel) = guard.channels.get(&conn).cloned() else {
                trace!(conn, "data for unknown channel dropped");
                return;
            };
            guard.dirty.insert(conn);
            (channel, guard.time_now)
        };
        channel.handle_recv(payload, tick);
    }
}

#[async_trait]
impl Service for UdpService {
    async fn accept_channel(&self) -> Result<Arc<dyn Channel>> {
        let awaitable = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| TransportError::Custom("udp service state poisoned".into()))?;
            if inner.disposed {
                return Err(TransportError::ServiceDisposed);
            }
            let (next, awaitable) = completion();
            if let Some(mut replaced) = inner.pending_accept.replace(next) {
                replaced.cancel();
            }
            awaitable
        };
        match awaitable.wait().await {
            Some(channel) => Ok(channel as Arc<dyn Channel>),
            None => Err(TransportError::AcceptCanceled),
        }
    }

    fn connect_channel(&self, addr: SocketAddr) -> Result<Arc<dyn Channel>> {
        let channel = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| TransportError::Custom("udp service state poisoned".into()))?;
            if inner.disposed {
                return Err(TransportError::ServiceDisposed);
            }
            // Random request id outside the control-opcode range; regenerate
            // on the off chance it collides with a live local id.
            let mut rng = rand::rng();
            let mut id = rng.random_range(FIRST_CONN_ID..u32::MAX);
            while inner.channels.contains_key(&id) {
                id = rng.random_range(FIRST_CONN_ID..u32::MAX);
            }
            let channel = Arc::new(UdpChannel::new(
                id,
                None,
                addr,
                ChannelState::Handshaking,
                Arc::clone(&self.socket),
                Arc::downgrade(&self.inner),
            ));
            inner.channels.insert(id, Arc::clone(&channel));
            let retry_at = inner.time_now + HANDSHAKE_RETRY_MS;
            inner.scheduled.add(retry_at, id);
            channel
        };
        debug!(id = channel.id(), %addr, "connecting");
        if let Err(e) = self.socket.try_send_to(&Packet::syn(channel.id()), addr) {
            // The scheduled handshake retry covers this.
            debug!(error = %e, %addr, "initial syn send failed");
        }
        Ok(channel as Arc<dyn Channel>)
    }

    fn channel(&self, id: u32) -> Option<Arc<dyn Channel>> {
        let inner = self.inner.lock().ok()?;
        inner
            .channels
            .get(&id)
            .cloned()
            .map(|channel| channel as Arc<dyn Channel>)
    }

    fn remove(&self, id: u32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.channels.contains_key(&id) {
            return;
        }
        // Purge is deferred to end-of-tick: a channel already dirty this tick
        // is serviced once more before it goes.
        if !inner.removed.contains(&id) {
            inner.removed.push_back(id);
        }
    }

    fn update(&self) {
        // Advance the clock, fold due scheduled ids into the dirty set, and
        // snapshot the channels to service.
        let (tick, due) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.disposed {
                return;
            }
            inner.time_now = now_ms();
            let now = inner.time_now;
            let due_ids = inner.scheduled.drain(now);
            inner.dirty.extend(due_ids);
            let channels: Vec<Arc<UdpChannel>> = inner
                .dirty
                .iter()
                .filter_map(|id| inner.channels.get(id).cloned())
                .collect();
            inner.dirty.clear();
            (now, channels)
        };

        // Service outside the lock so handlers may send or reschedule.
        for channel in &due {
            channel.update(tick);
        }

        // Purge removals queued during the tick.
        let victims: Vec<Arc<UdpChannel>> = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let mut victims = Vec::new();
            while let Some(id) = inner.removed.pop_front() {
                if let Some(channel) = inner.channels.remove(&id) {
                    inner.dirty.remove(&id);
                    inner.scheduled.remove(&id);
                    victims.push(channel);
                }
            }
            for victim in &victims {
                if let Some(remote) = victim.remote_id() {
                    inner.accepted.remove(&remote);
                }
            }
            victims
        };
        for victim in victims {
            victim.close(true);
        }
    }

    fn dispose(&self) {
        let (channels, waiter) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            let channels: Vec<Arc<UdpChannel>> =
                inner.channels.drain().map(|(_, channel)| channel).collect();
            inner.accepted.clear();
            inner.dirty.clear();
            inner.removed.clear();
            inner.scheduled.clear();
            (channels, inner.pending_accept.take())
        };
        if let Some(mut waiter) = waiter {
            waiter.cancel();
        }
        for channel in channels {
            channel.close(true);
        }
        if let Some(task) = self.recv_task.lock().ok().and_then(|mut g| g.take()) {
            task.abort();
        }
        debug!(local_addr = %self.local_addr, "udp service disposed");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Drop for UdpService {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// One datagram-backed logical connection.
///
/// Outbound bytes are queued and flushed by this channel's servicing pass;
/// queuing marks the channel dirty with its service. While the handshake is
/// in flight the servicing pass re-sends the SYN instead.
pub struct UdpChannel {
    id: u32,
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    service: Weak<Mutex<UdpInner>>,
    inner: Mutex<UdpChannelInner>,
}

struct UdpChannelInner {
    state: ChannelState,
    /// Peer-local connection id; data frames are addressed with it.
    remote_id: Option<u32>,
    /// Outbound payloads awaiting the next servicing pass.
    pending: Vec<Bytes>,
    recv_handler: Option<RecvHandler>,
    error_handler: Option<ErrorHandler>,
    errored: bool,
}

impl UdpChannel {
    fn new(
        id: u32,
        remote_id: Option<u32>,
        remote: SocketAddr,
        state: ChannelState,
        socket: Arc<UdpSocket>,
        service: Weak<Mutex<UdpInner>>,
    ) -> Self {
        Self {
            id,
            remote,
            socket,
            service,
            inner: Mutex::new(UdpChannelInner {
                state,
                remote_id,
                pending: Vec::new(),
                recv_handler: None,
                error_handler: None,
                errored: false,
            }),
        }
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.inner.lock().ok().and_then(|inner| inner.remote_id)
    }

    /// Client side: matching ACK received, bind the peer's id.
    fn handle_connect(&self, response: u32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != ChannelState::Handshaking {
            return;
        }
        inner.remote_id = Some(response);
        inner.state = ChannelState::Connected;
        debug!(id = self.id, remote = response, "channel connected");
    }

    /// Deliver inbound payload bytes together with the service clock tick.
    fn handle_recv(&self, payload: &[u8], tick: u64) {
        // Take the handler out of the slot while invoking it so the handler
        // itself may call back into this channel.
        let handler = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.recv_handler.take()
        };
        let Some(mut handler) = handler else {
            trace!(id = self.id, len = payload.len(), "no recv handler, dropping bytes");
            return;
        };
        handler(payload, tick);
        if let Ok(mut inner) = self.inner.lock() {
            if inner.recv_handler.is_none() {
                inner.recv_handler = Some(handler);
            }
        }
    }

    /// Fire the error signal. At most once per channel.
    fn signal_error(&self, error: TransportError) {
        let handler = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.errored {
                return;
            }
            inner.errored = true;
            inner.error_handler.take()
        };
        if let Some(handler) = handler {
            handler(self.id, error);
        }
    }

    /// Release channel-local state. With `notify_peer`, a best-effort FIN is
    /// sent first; teardown has no handshake and the FIN may be lost.
    fn close(&self, notify_peer: bool) {
        let fin = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.state == ChannelState::Closed {
                return;
            }
            let fin = if notify_peer {
                inner.remote_id.map(|remote| Packet::fin(self.id, remote))
            } else {
                None
            };
            inner.state = ChannelState::Closed;
            inner.pending.clear();
            inner.recv_handler = None;
            fin
        };
        if let Some(fin) = fin {
            if let Err(e) = self.socket.try_send_to(&fin, self.remote) {
                trace!(id = self.id, error = %e, "fin send failed");
            }
        }
    }

    /// One servicing pass for this channel.
    fn update(&self, tick: u64) {
        enum Pass {
            RetrySyn,
            Flush(u32, Vec<Bytes>),
            Nothing,
        }
        let pass = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            match inner.state {
                ChannelState::Handshaking => Pass::RetrySyn,
                ChannelState::Connected => match inner.remote_id {
                    Some(remote) if !inner.pending.is_empty() => {
                        Pass::Flush(remote, inner.pending.drain(..).collect())
                    }
                    _ => Pass::Nothing,
                },
                ChannelState::Closed => Pass::Nothing,
            }
        };
        match pass {
            Pass::RetrySyn => {
                trace!(id = self.id, "re-sending syn");
                if let Err(e) = self.socket.try_send_to(&Packet::syn(self.id), self.remote) {
                    trace!(id = self.id, error = %e, "syn resend failed");
                }
                self.schedule(tick + HANDSHAKE_RETRY_MS);
            }
            Pass::Flush(remote, batch) => {
                for payload in batch {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&Packet::data(remote, &payload), self.remote)
                    {
                        debug!(id = self.id, error = %e, "data send failed, dropping frame");
                    }
                }
            }
            Pass::Nothing => {}
        }
    }

    fn mark_dirty(&self) {
        if let Some(service) = self.service.upgrade() {
            if let Ok(mut inner) = service.lock() {
                inner.dirty.insert(self.id);
            }
        }
    }

    fn schedule(&self, time: u64) {
        if let Some(service) = self.service.upgrade() {
            if let Ok(mut inner) = service.lock() {
                inner.scheduled.add(time, self.id);
            }
        }
    }
}

impl Channel for UdpChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn state(&self) -> ChannelState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(ChannelState::Closed)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn send(&self, payload: &[u8]) -> Result<()> {
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| TransportError::Custom("udp channel state poisoned".into()))?;
            if inner.state == ChannelState::Closed {
                return Err(TransportError::ChannelDisposed);
            }
            inner.pending.push(Bytes::copy_from_slice(payload));
        }
        self.mark_dirty();
        Ok(())
    }

    fn set_recv_handler(&self, handler: RecvHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.recv_handler = Some(handler);
        }
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.error_handler = Some(handler);
        }
    }

    fn dispose(&self) {
        // Deregister first so packets for this id are dropped from now on.
        let remote = self.remote_id();
        if let Some(service) = self.service.upgrade() {
            if let Ok(mut inner) = service.lock() {
                inner.channels.remove(&self.id);
                inner.dirty.remove(&self.id);
                inner.scheduled.remove(&self.id);
                if let Some(remote) = remote {
                    inner.accepted.remove(&remote);
                }
            }
        }
        self.close(true);
    }
}
