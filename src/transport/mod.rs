//! # Transport Layer
//!
//! Logical connections (channels) multiplexed over protocol services.
//!
//! A [`Service`] owns one socket or listener plus the registry of its
//! [`Channel`]s. Two backends implement the contract:
//! - [`udp::UdpService`] — connection-oriented protocol over a shared
//!   datagram socket: SYN/ACK/FIN handshake, per-connection demultiplexing,
//!   and tick-driven channel servicing.
//! - [`tcp::TcpService`] — stream transport: listener accept on the server
//!   side, lazily-connecting channels on the client side, no per-tick work.
//!
//! The [`Service`] interface deliberately tolerates that asymmetry: `update`
//! is a real scheduling pass for UDP and a no-op for TCP.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, TransportError};

/// Receive handler: payload bytes plus the service's coarse clock tick at
/// delivery time.
pub type RecvHandler = Box<dyn FnMut(&[u8], u64) + Send + 'static>;

/// Error handler: channel id plus the terminal error. Single-consumer slot;
/// fires at most once per channel.
pub type ErrorHandler = Box<dyn FnOnce(u32, TransportError) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, handshake (or lazy connect) not yet complete.
    Handshaking,
    Connected,
    Closed,
}

/// One logical bidirectional connection multiplexed over a [`Service`].
///
/// A channel holds a non-owning back-reference to its service; disposing a
/// channel removes it from the service registry immediately, after which
/// packets addressed to its id are silently dropped.
pub trait Channel: Send + Sync {
    /// Local connection id, unique within the owning service.
    fn id(&self) -> u32;

    fn state(&self) -> ChannelState;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Queue payload bytes for delivery to the remote side. Bytes queued
    /// before the connection is established are flushed once it is.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Install the receive handler. Inbound bytes arriving while no handler
    /// is installed are dropped.
    fn set_recv_handler(&self, handler: RecvHandler);

    /// Install the error handler. The slot is single-consumer and the signal
    /// fires at most once.
    fn set_error_handler(&self, handler: ErrorHandler);

    /// Tear the channel down: remove it from the service registry, then
    /// release its resources. Idempotent.
    fn dispose(&self);
}

/// Owner of a socket/listener and the registry of channels for one protocol.
#[async_trait]
pub trait Service: Send + Sync {
    /// Await the next inbound channel.
    ///
    /// At most one waiter may be outstanding per service; a second call
    /// replaces the pending waiter, which then resolves with
    /// [`TransportError::AcceptCanceled`]. Callers serialize their own
    /// accepts.
    async fn accept_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Create an outbound channel toward `addr`. Returns synchronously; the
    /// connection completes asynchronously (handshake or lazy connect).
    fn connect_channel(&self, addr: SocketAddr) -> Result<Arc<dyn Channel>>;

    fn channel(&self, id: u32) -> Option<Arc<dyn Channel>>;

    /// Queue `id` for removal. Removing an unknown id is a no-op. For the
    /// datagram service the purge is deferred to end-of-tick so a channel
    /// already marked dirty is still serviced once before it goes.
    fn remove(&self, id: u32);

    /// One external driving cycle: advance the clock, service due channels,
    /// purge queued removals. A no-op for backends with nothing to service.
    fn update(&self);

    /// Dispose the service and every registered channel.
    fn dispose(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}
