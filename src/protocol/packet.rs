//! Datagram wire format.
//!
//! Every inbound datagram starts with a little-endian u32 discriminant:
//!
//! | Packet | Bytes | Layout |
//! |--------|-------|------------------------------------------|
//! | SYN    | 8     | `[1][requestConnId]`                     |
//! | ACK    | 12    | `[2][requestConnId][responseConnId]`     |
//! | FIN    | 12    | `[3][senderConnId][targetConnId]`        |
//! | Data   | >=4   | `[connId][payload...]`                   |
//!
//! Control packets with the wrong length for their opcode parse to `None`
//! and are dropped silently by the service; this is an accepted robustness
//! tradeoff, not hardening against spoofing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Connection request.
pub const SYN: u32 = 1;
/// Connection accepted.
pub const ACK: u32 = 2;
/// Teardown notification. Best effort, no handshake.
pub const FIN: u32 = 3;

pub const SYN_LEN: usize = 8;
pub const ACK_LEN: usize = 12;
pub const FIN_LEN: usize = 12;

/// First id handed out by a service-side allocator. Ids start well above the
/// control opcodes; the only enforced exclusion is 1/2/3 themselves.
pub const FIRST_CONN_ID: u32 = 1000;

#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Client asks to connect, carrying its self-chosen connection id.
    Syn { request: u32 },
    /// Server acknowledges `request` and announces its own id for the pair.
    Ack { request: u32, response: u32 },
    /// Either side tears down the receiver-local channel `conn`.
    Fin { conn: u32 },
    /// Established-channel payload addressed to the receiver-local id `conn`.
    Data { conn: u32, payload: &'a [u8] },
}

impl<'a> Packet<'a> {
    /// Parse one inbound datagram. `None` means malformed (short buffer or a
    /// control packet of the wrong length); such datagrams are dropped.
    pub fn parse(mut buf: &'a [u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let total = buf.len();
        let discriminant = buf.get_u32_le();
        match discriminant {
            SYN => {
                if total != SYN_LEN {
                    return None;
                }
                Some(Packet::Syn {
                    request: buf.get_u32_le(),
                })
            }
            ACK => {
                if total != ACK_LEN {
                    return None;
                }
                Some(Packet::Ack {
                    request: buf.get_u32_le(),
                    response: buf.get_u32_le(),
                })
            }
            FIN => {
                if total != FIN_LEN {
                    return None;
                }
                let _sender = buf.get_u32_le();
                Some(Packet::Fin {
                    conn: buf.get_u32_le(),
                })
            }
            conn => Some(Packet::Data { conn, payload: buf }),
        }
    }

    pub fn syn(request: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYN_LEN);
        buf.put_u32_le(SYN);
        buf.put_u32_le(request);
        buf.freeze()
    }

    pub fn ack(request: u32, response: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        buf.put_u32_le(ACK);
        buf.put_u32_le(request);
        buf.put_u32_le(response);
        buf.freeze()
    }

    pub fn fin(sender: u32, target: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIN_LEN);
        buf.put_u32_le(FIN);
        buf.put_u32_le(sender);
        buf.put_u32_le(target);
        buf.freeze()
    }

    /// Frame payload bytes for the channel the receiver knows as `conn`.
    pub fn data(conn: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32_le(conn);
        buf.put_slice(payload);
        buf.freeze()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_layout_is_little_endian() {
        let bytes = Packet::syn(0x1234_5678);
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            Packet::parse(&bytes),
            Some(Packet::Syn {
                request: 0x1234_5678
            })
        );
    }

    #[test]
    fn test_ack_roundtrip() {
        let bytes = Packet::ack(4242, 1001);
        assert_eq!(bytes.len(), ACK_LEN);
        assert_eq!(
            Packet::parse(&bytes),
            Some(Packet::Ack {
                request: 4242,
                response: 1001
            })
        );
    }

    #[test]
    fn test_fin_targets_the_receiver_local_id() {
        let bytes = Packet::fin(4242, 1001);
        assert_eq!(Packet::parse(&bytes), Some(Packet::Fin { conn: 1001 }));
    }

    #[test]
    fn test_data_keeps_payload_bytes() {
        let bytes = Packet::data(2000, &[0xAA, 0xBB, 0xCC]);
        match Packet::parse(&bytes) {
            Some(Packet::Data { conn, payload }) => {
                assert_eq!(conn, 2000);
                assert_eq!(payload, &[0xAA, 0xBB, 0xCC]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_header_only_data_has_empty_payload() {
        let bytes = 5000u32.to_le_bytes();
        match Packet::parse(&bytes) {
            Some(Packet::Data { conn, payload }) => {
                assert_eq!(conn, 5000);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_control_lengths_are_rejected() {
        // SYN must be exactly 8 bytes.
        let mut long_syn = Packet::syn(7).to_vec();
        long_syn.push(0);
        assert_eq!(Packet::parse(&long_syn), None);

        // ACK and FIN must be exactly 12 bytes.
        assert_eq!(Packet::parse(&ACK.to_le_bytes()), None);
        assert_eq!(Packet::parse(&FIN.to_le_bytes()[..3]), None);

        // Anything under 4 bytes has no discriminant.
        assert_eq!(Packet::parse(&[]), None);
        assert_eq!(Packet::parse(&[1, 2, 3]), None);
    }
}
