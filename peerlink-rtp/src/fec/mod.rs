//! ULPFEC (RFC 5109) protection with RED (RFC 2198) encapsulation.
//!
//! The generator XORs a window of sequenced media packets into protection
//! packets; the receiver unwraps RED, feeds FEC payloads to the decoder and
//! reconstructs missing media packets byte-for-byte.

pub mod generator;
pub mod receiver;

pub use generator::{FecProtectionParams, UlpFecGenerator};
pub use receiver::{FecDecoder, FecPacketCounter, UlpFecReceiver};

use crate::packet::{RtpPacket, FIXED_HEADER_SIZE};

/// RED envelope header: one byte carrying the encapsulated payload type.
pub const RED_HEADER_SIZE: usize = 1;

/// Fixed ULPFEC header (E, L, recovery fields, SN base, TS and length
/// recovery).
pub const FEC_HEADER_SIZE: usize = 10;

/// Level-0 header with a short (16-bit) mask.
pub const FEC_LEVEL_HEADER_SIZE_SHORT: usize = 4;
/// Level-0 header with a long (48-bit) mask.
pub const FEC_LEVEL_HEADER_SIZE_LONG: usize = 8;

/// Media packets per protection window with the short mask.
pub const MAX_MEDIA_PACKETS_SHORT_MASK: usize = 16;
/// Absolute per-window cap (long mask).
pub const MAX_MEDIA_PACKETS: usize = 48;

/// XOR-accumulated recovery fields of one FEC packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FecRecovery {
    /// P, X and CC bits (low 6 bits of the first header byte).
    pub byte0: u8,
    /// Marker bit and payload type.
    pub byte1: u8,
    pub timestamp: u32,
    /// Length of everything behind the fixed header.
    pub length: u16,
    pub payload: Vec<u8>,
}

impl FecRecovery {
    /// Folds one serialized media packet into the accumulator.
    pub fn xor_packet(&mut self, wire: &[u8]) {
        debug_assert!(wire.len() >= FIXED_HEADER_SIZE);
        self.byte0 ^= wire[0] & 0x3F;
        self.byte1 ^= wire[1];
        self.timestamp ^= u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]);
        let tail = &wire[FIXED_HEADER_SIZE..];
        self.length ^= tail.len() as u16;
        if self.payload.len() < tail.len() {
            self.payload.resize(tail.len(), 0);
        }
        for (dst, src) in self.payload.iter_mut().zip(tail) {
            *dst ^= *src;
        }
    }
}

/// RED-wraps a packet: the payload type moves into the first payload byte
/// and the packet itself travels under `red_payload_type`.
pub fn red_wrap(packet: &RtpPacket, red_payload_type: u8) -> RtpPacket {
    let mut wrapped = packet.clone();
    let mut payload = Vec::with_capacity(RED_HEADER_SIZE + packet.payload_size());
    // End-marker bit clear: a single RED block.
    payload.push(packet.payload_type() & 0x7F);
    payload.extend_from_slice(packet.payload());
    wrapped.set_payload(&payload);
    wrapped.set_payload_type(red_payload_type);
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_red_wrap_moves_payload_type() {
        let mut packet = RtpPacket::new();
        packet.set_payload_type(102);
        packet.set_ssrc(7);
        packet.set_payload(&[1, 2, 3]);
        let wrapped = red_wrap(&packet, 116);
        assert_eq!(wrapped.payload_type(), 116);
        assert_eq!(wrapped.payload(), &[102, 1, 2, 3]);
        assert_eq!(wrapped.ssrc(), 7);
    }

    #[test]
    fn test_recovery_xor_is_involutive() {
        let mut a = RtpPacket::new();
        a.set_payload_type(100);
        a.set_timestamp(0x1111_2222);
        a.set_payload(&[9, 8, 7, 6]);
        let wire = a.build();

        let mut acc = FecRecovery::default();
        acc.xor_packet(wire.data());
        acc.xor_packet(wire.data());
        assert_eq!(acc, FecRecovery {
            payload: vec![0; 4],
            ..Default::default()
        });
    }
}
