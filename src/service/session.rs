//! Protocol-agnostic session registry on top of a transport service.
//!
//! A [`SessionManager`] wraps exactly one [`Service`] backend, selected at
//! construction. In server mode it binds immediately and runs an accept loop
//! for its whole lifetime: each inbound channel is wrapped in a [`Session`]
//! registered under a fresh id, and the channel's error signal is wired to
//! auto-remove that session. In client-only mode it constructs without
//! binding and sessions are created explicitly via [`SessionManager::create`].
//!
//! Application framing and request/response correlation ride on top of the
//! raw channel a session exposes; they are not this layer's concern.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{NetworkConfig, Protocol};
use crate::error::{Result, TransportError};
use crate::transport::tcp::TcpService;
use crate::transport::udp::UdpService;
use crate::transport::{Channel, RecvHandler, Service};

/// One logical peer: a registry id plus the channel carrying its bytes.
pub struct Session {
    id: u64,
    channel: Arc<dyn Channel>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw transport channel. Application framing lives above this.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.channel.send(payload)
    }

    pub fn set_recv_handler(&self, handler: RecvHandler) {
        self.channel.set_recv_handler(handler);
    }

    /// Dispose the underlying channel. Idempotent.
    pub fn dispose(&self) {
        self.channel.dispose();
    }
}

/// Session registry, accept loop, and connect path over one backend.
pub struct SessionManager {
    service: Arc<dyn Service>,
    inner: Arc<Mutex<ManagerInner>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    sessions: HashMap<u64, Arc<Session>>,
    next_id: u64,
    disposed: bool,
}

impl SessionManager {
    /// Client-only component: constructs without binding a listen address.
    pub async fn client(protocol: Protocol) -> Result<Self> {
        let service: Arc<dyn Service> = match protocol {
            Protocol::Tcp => Arc::new(TcpService::client()),
            Protocol::Udp => Arc::new(UdpService::client().await?),
        };
        Ok(Self::wrap(service, false))
    }

    /// Server component: binds `addr` immediately and runs the accept loop
    /// until disposal.
    ///
    /// # Errors
    /// Bind failures are fatal to construction and carry `addr`.
    pub async fn server(protocol: Protocol, addr: SocketAddr) -> Result<Self> {
        let service: Arc<dyn Service> = match protocol {
            Protocol::Tcp => Arc::new(TcpService::bind(addr).await?),
            Protocol::Udp => Arc::new(UdpService::bind(addr).await?),
        };
        Ok(Self::wrap(service, true))
    }

    /// Construct from configuration: a listen address selects server mode.
    pub async fn from_config(config: &NetworkConfig) -> Result<Self> {
        match config.listen_addr()? {
            Some(addr) => Self::server(config.protocol, addr).await,
            None => Self::client(config.protocol).await,
        }
    }

    fn wrap(service: Arc<dyn Service>, accept: bool) -> Self {
        let inner = Arc::new(Mutex::new(ManagerInner {
            sessions: HashMap::new(),
            next_id: 1,
            disposed: false,
        }));
        let manager = Self {
            service: Arc::clone(&service),
            inner,
            accept_task: Mutex::new(None),
        };
        if accept {
            let task = tokio::spawn(Self::accept_loop(
                service,
                Arc::downgrade(&manager.inner),
            ));
            if let Ok(mut slot) = manager.accept_task.lock() {
                *slot = Some(task);
            }
        }
        manager
    }

    /// Accept loop: runs for the component's lifetime, wrapping each inbound
    /// channel in a registered session. Transient failures keep it alive.
    async fn accept_loop(service: Arc<dyn Service>, inner: Weak<Mutex<ManagerInner>>) {
        loop {
            let channel = match service.accept_channel().await {
                Ok(channel) => channel,
                Err(TransportError::ServiceDisposed) | Err(TransportError::NotListening) => return,
                Err(TransportError::AcceptCanceled) => {
                    let Some(strong) = inner.upgrade() else { return };
                    if strong.lock().map(|g| g.disposed).unwrap_or(true) {
                        return;
                    }
                    // Someone accepted on the wrapped service directly; the
                    // single-waiter contract means we just re-arm.
                    warn!("accept waiter replaced externally, re-arming");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let Some(strong) = inner.upgrade() else {
                channel.dispose();
                return;
            };
            if Self::register(&strong, channel).is_none() {
                return;
            }
        }
    }

    /// Wrap a channel in a new session and wire its error signal to remove
    /// the session again.
    fn register(
        inner: &Arc<Mutex<ManagerInner>>,
        channel: Arc<dyn Channel>,
    ) -> Option<Arc<Session>> {
        let session = {
            let mut guard = inner.lock().ok()?;
            if guard.disposed {
                return None;
            }
            let id = guard.next_id;
            guard.next_id += 1;
            let session = Arc::new(Session {
                id,
                channel: Arc::clone(&channel),
            });
            guard.sessions.insert(id, Arc::clone(&session));
            session
        };
        let weak = Arc::downgrade(inner);
        let session_id = session.id;
        channel.set_error_handler(Box::new(move |conn, err| {
            debug!(session = session_id, conn, error = %err, "channel error, removing session");
            if let Some(inner) = weak.upgrade() {
                Self::remove_session(&inner, session_id);
            }
        }));
        debug!(session = session.id, "session registered");
        Some(session)
    }

    fn remove_session(inner: &Arc<Mutex<ManagerInner>>, id: u64) {
        let session = {
            let Ok(mut guard) = inner.lock() else {
                return;
            };
            guard.sessions.remove(&id)
        };
        // Removing an unregistered id is a no-op.
        if let Some(session) = session {
            session.dispose();
        }
    }

    /// Accept one inbound channel and register it as a session.
    ///
    /// The internal accept loop normally drives this in server mode; it is
    /// public for components that serialize their own accepts on a service
    /// without the loop. The single-waiter contract of the underlying
    /// service applies.
    pub async fn accept(&self) -> Result<Arc<Session>> {
        let channel = self.service.accept_channel().await?;
        Self::register(&self.inner, channel).ok_or(TransportError::ServiceDisposed)
    }

    /// Connect to `addr` and register a session for the new channel.
    ///
    /// Connect failures are logged and yield `None`; callers check for
    /// absence rather than catch a propagated failure.
    pub fn create(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        match self.service.connect_channel(addr) {
            Ok(channel) => Self::register(&self.inner, channel),
            Err(e) => {
                error!(error = %e, %addr, "connect failed");
                None
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.lock().ok()?.sessions.get(&id).cloned()
    }

    /// Remove and dispose a session. Idempotent.
    pub fn remove(&self, id: u64) {
        Self::remove_session(&self.inner, id);
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .map(|guard| guard.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .map(|guard| guard.sessions.len())
            .unwrap_or(0)
    }

    /// Forward one driving cycle to the wrapped service.
    pub fn update(&self) {
        self.service.update();
    }

    /// The wrapped transport service.
    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.service.local_addr()
    }

    /// Dispose every live session, then the service. Idempotent.
    pub fn dispose(&self) {
        let sessions = {
            let Ok(mut guard) = self.inner.lock() else {
                return;
            };
            if guard.disposed {
                return;
            }
            guard.disposed = true;
            guard.sessions.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };
        if let Some(task) = self.accept_task.lock().ok().and_then(|mut g| g.take()) {
            task.abort();
        }
        for session in sessions {
            session.dispose();
        }
        self.service.dispose();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
