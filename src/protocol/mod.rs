//! # Protocol Layer
//!
//! Wire format for the datagram transport's control traffic.
//!
//! ## Wire Format
//! ```text
//! [Discriminant(4, LE)] [Fields...]
//! ```
//! Discriminants 1/2/3 are the SYN/ACK/FIN control opcodes; anything else is
//! an established connection id followed by payload bytes.

pub mod packet;
