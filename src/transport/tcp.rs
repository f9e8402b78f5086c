//! Stream transport: a listener on the server side, lazily-connecting
//! channels on the client side.
//!
//! The platform stream already guarantees ordering and reliability, so
//! [`Service::update`] is a deliberate no-op here; the unified service
//! interface tolerates that asymmetry with the datagram backend.
//!
//! A client channel is returned immediately from `connect_channel` bound to a
//! not-yet-connected handle; the connect sequence completes inside the
//! channel's own I/O task, and bytes sent before it completes are queued and
//! flushed afterwards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::protocol::packet::FIRST_CONN_ID;
use crate::transport::{Channel, ChannelState, ErrorHandler, RecvHandler, Service};
use crate::utils::time::now_ms;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Stream transport service.
pub struct TcpService {
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
    inner: Arc<Mutex<TcpInner>>,
}

struct TcpInner {
    channels: HashMap<u32, Arc<TcpChannel>>,
    next_id: u32,
    disposed: bool,
}

impl TcpInner {
    fn alloc_conn_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl TcpService {
    /// Bind a listening service on `addr`. Server role, though the same
    /// instance can also originate outbound connections.
    ///
    /// # Errors
    /// Fails with [`TransportError::Bind`] (carrying `addr`) if the local
    /// port cannot be bound; construction is not retried internally.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "tcp service listening");
        Ok(Self {
            listener: Some(Arc::new(listener)),
            local_addr: Some(local_addr),
            inner: Self::new_inner(),
        })
    }

    /// Client-only service: no listener, accepting is an error.
    pub fn client() -> Self {
        Self {
            listener: None,
            local_addr: None,
            inner: Self::new_inner(),
        }
    }

    fn new_inner() -> Arc<Mutex<TcpInner>> {
        Arc::new(Mutex::new(TcpInner {
            channels: HashMap::new(),
            next_id: FIRST_CONN_ID,
            disposed: false,
        }))
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.channels.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Service for TcpService {
    async fn accept_channel(&self) -> Result<Arc<dyn Channel>> {
        let listener = self
            .listener
            .as_ref()
            .cloned()
            .ok_or(TransportError::NotListening)?;
        let (stream, peer) = listener.accept().await?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Custom("tcp service state poisoned".into()))?;
        if inner.disposed {
            return Err(TransportError::ServiceDisposed);
        }
        let id = inner.alloc_conn_id();
        let channel = TcpChannel::accepted(id, peer, stream, Arc::downgrade(&self.inner));
        inner.channels.insert(id, Arc::clone(&channel));
        debug!(id, %peer, "accepted inbound channel");
        Ok(channel as Arc<dyn Channel>)
    }

    fn connect_channel(&self, addr: SocketAddr) -> Result<Arc<dyn Channel>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Custom("tcp service state poisoned".into()))?;
        if inner.disposed {
            return Err(TransportError::ServiceDisposed);
        }
        let id = inner.alloc_conn_id();
        let channel = TcpChannel::connecting(id, addr, Arc::downgrade(&self.inner));
        inner.channels.insert(id, Arc::clone(&channel));
        debug!(id, %addr, "connecting");
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
        let channel = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.channels.remove(&id)
        };
        // Removing an unknown id is a no-op.
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn update(&self) {
        // Ordering and reliability come from the stream transport itself;
        // there is nothing to service per tick.
    }

    fn dispose(&self) {
        let channels = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner
                .channels
                .drain()
                .map(|(_, channel)| channel)
                .collect::<Vec<_>>()
        };
        for channel in channels {
            channel.close();
        }
        if let Some(local_addr) = self.local_addr {
            debug!(%local_addr, "tcp service disposed");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.dispose();
    }
}

enum IoSource {
    /// Accepted stream, already connected.
    Stream(TcpStream),
    /// Client side: connect to this address inside the I/O task.
    Connect(SocketAddr),
}

/// One stream-backed logical connection.
pub struct TcpChannel {
    id: u32,
    remote: SocketAddr,
    service: Weak<Mutex<TcpInner>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    inner: Mutex<TcpChannelInner>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

struct TcpChannelInner {
    state: ChannelState,
    recv_handler: Option<RecvHandler>,
    error_handler: Option<ErrorHandler>,
    errored: bool,
}

impl TcpChannel {
    fn accepted(
        id: u32,
        peer: SocketAddr,
        stream: TcpStream,
        service: Weak<Mutex<TcpInner>>,
    ) -> Arc<Self> {
        Self::spawn(id, peer, ChannelState::Connected, IoSource::Stream(stream), service)
    }

    fn connecting(id: u32, addr: SocketAddr, service: Weak<Mutex<TcpInner>>) -> Arc<Self> {
        Self::spawn(
            id,
            addr,
            ChannelState::Handshaking,
            IoSource::Connect(addr),
            service,
        )
    }

    fn spawn(
        id: u32,
        remote: SocketAddr,
        state: ChannelState,
        source: IoSource,
        service: Weak<Mutex<TcpInner>>,
    ) -> Arc<Self> {
        let (outbound, queued) = mpsc::unbounded_channel();
        let channel = Arc::new(TcpChannel {
            id,
            remote,
            service,
            outbound,
            inner: Mutex::new(TcpChannelInner {
                state,
                recv_handler: None,
                error_handler: None,
                errored: false,
            }),
            io_task: Mutex::new(None),
        });
        let io_task = tokio::spawn(Self::run_io(Arc::downgrade(&channel), source, queued));
        if let Ok(mut slot) = channel.io_task.lock() {
            *slot = Some(io_task);
        }
        channel
    }

    /// The channel's whole life on the wire: finish the connect if needed,
    /// then pump reads to the recv handler and queued sends to the socket
    /// until either side fails.
    async fn run_io(
        weak: Weak<TcpChannel>,
        source: IoSource,
        mut queued: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let stream = match source {
            IoSource::Stream(stream) => stream,
            IoSource::Connect(addr) => match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Some(channel) = weak.upgrade() {
                        channel.mark_connected();
                    }
                    stream
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connect failed");
                    if let Some(channel) = weak.upgrade() {
                        channel.fail(TransportError::Io(e));
                    }
                    return;
                }
            },
        };
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let Some(channel) = weak.upgrade() else { return };
                    match read {
                        Ok(0) => {
                            channel.fail(TransportError::ConnectionClosed);
                            return;
                        }
                        Ok(n) => channel.deliver(&buf[..n]),
                        Err(e) => {
                            channel.fail(TransportError::Io(e));
                            return;
                        }
                    }
                }
                send = queued.recv() => {
                    let Some(payload) = send else { return };
                    if let Err(e) = writer.write_all(&payload).await {
                        if let Some(channel) = weak.upgrade() {
                            channel.fail(TransportError::Io(e));
                        }
                        return;
                    }
                }
            }
        }
    }

    fn mark_connected(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state == ChannelState::Handshaking {
            inner.state = ChannelState::Connected;
            debug!(id = self.id, remote = %self.remote, "channel connected");
        }
    }

    fn deliver(&self, bytes: &[u8]) {
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
            trace!(id = self.id, len = bytes.len(), "no recv handler, dropping bytes");
            return;
        };
        handler(bytes, now_ms());
        if let Ok(mut inner) = self.inner.lock() {
            if inner.recv_handler.is_none() {
                inner.recv_handler = Some(handler);
            }
        }
    }

    /// Terminal I/O failure: mark closed and fire the error signal once.
    /// Registry removal is driven by the error handler's owner.
    fn fail(&self, error: TransportError) {
        let handler = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.state = ChannelState::Closed;
            inner.recv_handler = None;
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

    fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = ChannelState::Closed;
            inner.recv_handler = None;
        }
        if let Some(task) = self.io_task.lock().ok().and_then(|mut g| g.take()) {
            task.abort();
        }
    }
}

impl Channel for TcpChannel {
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
            let inner = self
                .inner
                .lock()
                .map_err(|_| TransportError::Custom("tcp channel state poisoned".into()))?;
            if inner.state == ChannelState::Closed {
                return Err(TransportError::ChannelDisposed);
            }
        }
        self.outbound
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| TransportError::ConnectionClosed)
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
        // Deregister first; the id is gone from the registry before any
        // teardown runs.
        if let Some(service) = self.service.upgrade() {
            if let Ok(mut inner) = service.lock() {
                inner.channels.remove(&self.id);
            }
        }
        self.close();
    }
}
