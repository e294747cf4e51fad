//! Receive-side RED unwrap and ULPFEC recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use shared::error::{Error, Result};
use shared::units::Timestamp;
use shared::Clock;

use super::{FEC_HEADER_SIZE, FEC_LEVEL_HEADER_SIZE_SHORT, RED_HEADER_SIZE};
use crate::packet::{RtpPacket, RtpPacketReceived, FIXED_HEADER_SIZE};
use crate::MAX_IP_PACKET_SIZE;

/// Media packets remembered for recovery, per stream.
const MEDIA_WINDOW: u16 = 192;

/// A reconstructed media packet in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredMediaPacket {
    pub seq: u16,
    pub wire: Vec<u8>,
}

struct ReceivedFecPacket {
    sn_base: u16,
    protected_offsets: Vec<u16>,
    byte0: u8,
    byte1: u8,
    timestamp_recovery: u32,
    length_recovery: u16,
    payload: Vec<u8>,
}

/// XOR decoder over one SSRC.
///
/// Holds recently seen media packets (serialized) and pending FEC packets;
/// whenever exactly one protected packet of a FEC packet is missing it is
/// reconstructed, which may unlock further recoveries in cascade.
pub struct FecDecoder {
    ssrc: u32,
    media_packets: BTreeMap<u16, Vec<u8>>,
    fec_packets: Vec<ReceivedFecPacket>,
    newest_seq: Option<u16>,
}

impl FecDecoder {
    pub fn new(ssrc: u32) -> Self {
        FecDecoder {
            ssrc,
            media_packets: BTreeMap::new(),
            fec_packets: Vec::new(),
            newest_seq: None,
        }
    }

    pub fn reset(&mut self) {
        self.media_packets.clear();
        self.fec_packets.clear();
        self.newest_seq = None;
    }

    /// Feeds one packet (media wire bytes or a bare FEC payload) and
    /// returns everything recoverable right now.
    pub fn decode(
        &mut self,
        seq: u16,
        is_fec: bool,
        data: &[u8],
    ) -> Vec<RecoveredMediaPacket> {
        if is_fec {
            match parse_fec_payload(data) {
                Ok(fec) => self.fec_packets.push(fec),
                Err(e) => {
                    warn!("dropping malformed fec payload: {e}");
                    return Vec::new();
                }
            }
        } else {
            self.insert_media(seq, data.to_vec());
        }
        self.prune();
        self.try_recover()
    }

    fn insert_media(&mut self, seq: u16, wire: Vec<u8>) {
        self.media_packets.insert(seq, wire);
        let newer = match self.newest_seq {
            None => true,
            Some(newest) => seq.wrapping_sub(newest) < 0x8000,
        };
        if newer {
            self.newest_seq = Some(seq);
        }
    }

    fn prune(&mut self) {
        let Some(newest) = self.newest_seq else {
            return;
        };
        self.media_packets
            .retain(|seq, _| newest.wrapping_sub(*seq) < MEDIA_WINDOW);
        self.fec_packets
            .retain(|fec| newest.wrapping_sub(fec.sn_base) < MEDIA_WINDOW);
    }

    fn try_recover(&mut self) -> Vec<RecoveredMediaPacket> {
        let mut recovered = Vec::new();
        loop {
            let mut progress = false;
            let mut index = 0;
            while index < self.fec_packets.len() {
                let fec = &self.fec_packets[index];
                let missing: Vec<u16> = fec
                    .protected_offsets
                    .iter()
                    .map(|offset| fec.sn_base.wrapping_add(*offset))
                    .filter(|seq| !self.media_packets.contains_key(seq))
                    .collect();
                match missing.len() {
                    0 => {
                        // Fully received; the FEC packet has served its
                        // purpose.
                        self.fec_packets.swap_remove(index);
                    }
                    1 => {
                        let seq = missing[0];
                        let fec = self.fec_packets.swap_remove(index);
                        match self.recover_packet(&fec, seq) {
                            Some(wire) => {
                                debug!("recovered packet {seq} via ulpfec");
                                self.insert_media(seq, wire.clone());
                                recovered.push(RecoveredMediaPacket { seq, wire });
                                progress = true;
                            }
                            None => warn!("ulpfec recovery of {seq} failed"),
                        }
                    }
                    _ => index += 1,
                }
            }
            if !progress {
                break;
            }
        }
        recovered
    }

    fn recover_packet(&self, fec: &ReceivedFecPacket, seq: u16) -> Option<Vec<u8>> {
        let mut byte0 = fec.byte0 & 0x3F;
        let mut byte1 = fec.byte1;
        let mut timestamp = fec.timestamp_recovery;
        let mut length = fec.length_recovery;
        let mut payload = fec.payload.clone();

        for offset in &fec.protected_offsets {
            let other = fec.sn_base.wrapping_add(*offset);
            if other == seq {
                continue;
            }
            let wire = self.media_packets.get(&other)?;
            byte0 ^= wire[0] & 0x3F;
            byte1 ^= wire[1];
            timestamp ^= u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]);
            let tail = &wire[FIXED_HEADER_SIZE..];
            length ^= tail.len() as u16;
            for (dst, src) in payload.iter_mut().zip(tail) {
                *dst ^= *src;
            }
        }

        let recovered_length = length as usize;
        if recovered_length > payload.len() {
            return None;
        }
        let mut wire = Vec::with_capacity(FIXED_HEADER_SIZE + recovered_length);
        wire.push(0x80 | byte0);
        wire.push(byte1);
        wire.extend_from_slice(&seq.to_be_bytes());
        wire.extend_from_slice(&timestamp.to_be_bytes());
        wire.extend_from_slice(&self.ssrc.to_be_bytes());
        wire.extend_from_slice(&payload[..recovered_length]);
        Some(wire)
    }
}

fn parse_fec_payload(data: &[u8]) -> Result<ReceivedFecPacket> {
    if data.len() < FEC_HEADER_SIZE + FEC_LEVEL_HEADER_SIZE_SHORT {
        return Err(Error::BufferTooShort);
    }
    let long_mask = data[0] & 0x40 != 0;
    let sn_base = u16::from_be_bytes([data[2], data[3]]);
    let timestamp_recovery = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let length_recovery = u16::from_be_bytes([data[8], data[9]]);
    let protection_length = u16::from_be_bytes([data[10], data[11]]) as usize;

    let (mask_len, mask_bits) = if long_mask {
        if data.len() < FEC_HEADER_SIZE + 8 {
            return Err(Error::BufferTooShort);
        }
        let mut bits = [0u8; 8];
        bits[2..8].copy_from_slice(&data[12..18]);
        (6, u64::from_be_bytes(bits))
    } else {
        let bits = u16::from_be_bytes([data[12], data[13]]) as u64;
        (2, bits << 32)
    };

    let payload_start = FEC_HEADER_SIZE + 2 + mask_len;
    if data.len() < payload_start + protection_length {
        return Err(Error::BufferTooShort);
    }

    let mut protected_offsets = Vec::new();
    for offset in 0..48u16 {
        if mask_bits & (1u64 << (47 - offset)) != 0 {
            protected_offsets.push(offset);
        }
    }
    if protected_offsets.is_empty() {
        return Err(Error::SsrcNumAndLengthMismatch);
    }

    Ok(ReceivedFecPacket {
        sn_base,
        protected_offsets,
        byte0: data[0],
        byte1: data[1],
        timestamp_recovery,
        length_recovery,
        payload: data[payload_start..payload_start + protection_length].to_vec(),
    })
}

/// Counters of one FEC receive stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FecPacketCounter {
    pub num_received_packets: u64,
    pub num_received_fec_packets: u64,
    pub num_recovered_packets: u64,
    pub first_packet_arrival_time: Option<Timestamp>,
}

/// RED entry point of one receive stream: unwraps media, routes FEC
/// payloads to the decoder and surfaces recovered packets.
pub struct UlpFecReceiver {
    ssrc: u32,
    clock: Arc<dyn Clock>,
    decoder: FecDecoder,
    counter: FecPacketCounter,
}

impl UlpFecReceiver {
    pub fn new(ssrc: u32, clock: Arc<dyn Clock>) -> Self {
        UlpFecReceiver {
            ssrc,
            clock,
            decoder: FecDecoder::new(ssrc),
            counter: FecPacketCounter::default(),
        }
    }

    pub fn counter(&self) -> FecPacketCounter {
        self.counter
    }

    /// Handles one packet carrying the RED payload type. Returns the
    /// unwrapped media packet (when the block is media) followed by any
    /// packets recovered as a consequence.
    pub fn on_red_packet(
        &mut self,
        rtp_packet: &RtpPacketReceived,
        ulpfec_payload_type: u8,
    ) -> Result<Vec<RtpPacketReceived>> {
        if rtp_packet.ssrc() != self.ssrc {
            warn!("RED packet with unexpected ssrc {}, dropping", rtp_packet.ssrc());
            return Err(Error::UnexpectedState("red ssrc mismatch".to_string()));
        }
        if rtp_packet.size() > MAX_IP_PACKET_SIZE {
            warn!("RED packet exceeds typical IP packet size, dropping");
            return Err(Error::PacketTooBig);
        }
        let red_payload = rtp_packet.payload();
        if red_payload.is_empty() {
            warn!("truncated RED packet, dropping");
            return Err(Error::BufferTooShort);
        }

        // Highest bit is the RED end marker; zero marks the last (single)
        // block. Multi-block RED is not supported.
        let is_last_block = red_payload[0] & 0x80 == 0;
        if !is_last_block {
            warn!("multi-block RED packet not supported, dropping");
            return Err(Error::BadMediaConfiguration(
                "multi-block RED".to_string(),
            ));
        }
        let encapsulated_payload_type = red_payload[0] & 0x7F;
        let is_fec = encapsulated_payload_type == ulpfec_payload_type;

        self.counter.num_received_packets += 1;
        if self.counter.first_packet_arrival_time.is_none() {
            self.counter.first_packet_arrival_time = Some(self.clock.now());
        }

        let mut out = Vec::new();
        let mut decoder_input: Option<(bool, Vec<u8>)> = None;
        if is_fec {
            self.counter.num_received_fec_packets += 1;
            decoder_input = Some((true, red_payload[RED_HEADER_SIZE..].to_vec()));
        } else {
            // Restore the media packet behind the RED header.
            let mut media_packet = rtp_packet.clone();
            media_packet.set_payload(&red_payload[RED_HEADER_SIZE..]);
            media_packet.set_payload_type(encapsulated_payload_type);
            if !rtp_packet.is_recovered {
                // Recovered packets may differ byte-wise from the original
                // and would corrupt the XOR state.
                decoder_input = Some((false, media_packet.build().into_vec()));
            }
            out.push(media_packet);
        }

        if let Some((fec, data)) = decoder_input {
            let recovered = self
                .decoder
                .decode(rtp_packet.sequence_number(), fec, &data);
            for packet in recovered {
                self.counter.num_recovered_packets += 1;
                match RtpPacket::parse(&packet.wire) {
                    Ok(parsed) => {
                        let mut received =
                            RtpPacketReceived::new(parsed, self.clock.now());
                        received.is_recovered = true;
                        out.push(received);
                    }
                    Err(e) => warn!("recovered packet {} unparseable: {e}", packet.seq),
                }
            }
        }
        Ok(out)
    }
}
