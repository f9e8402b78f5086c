//! # Error Types
//!
//! Error handling for the transport core.
//!
//! This module defines all error variants that can occur while driving the
//! transport, from low-level I/O failures to contract violations such as
//! accepting on a client-only service.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and bind failures
//! - **Lifecycle Errors**: disposed services/channels, replaced accept waiters
//! - **Configuration Errors**: unparsable addresses, invalid settings
//!
//! Bind failures carry the target address so a busy local port can be
//! diagnosed from the error alone.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Primary error type for all transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection reset by peer")]
    PeerReset,

    #[error("channel disposed")]
    ChannelDisposed,

    #[error("service disposed")]
    ServiceDisposed,

    #[error("accept waiter canceled: replaced by a newer accept or service disposed")]
    AcceptCanceled,

    #[error("service has no listener: construct with a bind address to accept")]
    NotListening,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("send failed: {0}")]
    SendError(String),

    #[error("custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
