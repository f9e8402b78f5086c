//! # network-transport
//!
//! Tick-driven transport core multiplexing logical connections over two
//! protocol backends behind one abstraction: a connection-oriented protocol
//! over UDP (custom SYN/ACK/FIN handshake, per-connection demultiplexing on
//! one shared socket) and a TCP stream transport.
//!
//! ## Architecture
//! - [`core`]: keyed queue, single-shot completions, deferred-event index
//! - [`protocol`]: datagram wire format (SYN/ACK/FIN/Data)
//! - [`transport`]: the [`Channel`]/[`Service`] contract and both backends
//! - [`service`]: the session registry and tick-resolved timed waits
//! - [`config`] / [`error`] / [`utils`]: configuration, errors, logging, time
//!
//! ## Driving model
//! Execution is cooperative: inbound bytes are demultiplexed to channels by
//! each service's receive path, while an external driver calls `update()`
//! once per cycle to advance the coarse clock, service dirty channels, and
//! purge removals. The TCP backend's `update()` is a no-op; the stream
//! already guarantees ordering and reliability.
//!
//! ## Example
//! ```no_run
//! use network_transport::{Protocol, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> network_transport::Result<()> {
//!     let server =
//!         SessionManager::server(Protocol::Udp, "127.0.0.1:9000".parse().unwrap()).await?;
//!     let client = SessionManager::client(Protocol::Udp).await?;
//!     let _session = client.create("127.0.0.1:9000".parse().unwrap());
//!
//!     // The embedding runtime ticks both components once per frame.
//!     loop {
//!         client.update();
//!         server.update();
//!         # break;
//!     }
//!     # Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{NetworkConfig, Protocol};
pub use error::{Result, TransportError};
pub use service::session::{Session, SessionManager};
pub use service::timer::TimerService;
pub use transport::tcp::TcpService;
pub use transport::udp::UdpService;
pub use transport::{Channel, ChannelState, Service};
