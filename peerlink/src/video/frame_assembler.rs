//! Packet-to-frame assembly.
//!
//! Buffers depacketized video payloads by sequence number and emits a
//! frame once a contiguous run up to a marker packet is present. Frames
//! are produced strictly in sequence order; a gap stalls assembly until
//! retransmission or FEC fills it (or `clear_to` skips past it).

use std::collections::BTreeMap;

use log::debug;

use rtp::packetizer::h264::H264Depacketizer;
use rtp::RtpPacketReceived;
use shared::numerics::SeqNumUnwrapper;
use shared::units::Timestamp;

/// One assembled access unit plus the metadata the reference finder keys
/// on.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub first_seq_num: u16,
    pub last_seq_num: u16,
    /// Unwrapped sequence number of the last packet, the basis of picture
    /// ids.
    pub unwrapped_last_seq: i64,
    pub rtp_timestamp: u32,
    pub is_keyframe: bool,
    pub payload: Vec<u8>,
    pub received_time: Timestamp,
}

/// What one insertion produced: complete frames and consumed padding
/// positions (the reference finder advances across the latter).
#[derive(Debug, Clone)]
pub enum AssemblyEvent {
    Frame(AssembledFrame),
    Padding(i64),
}

struct BufferedPacket {
    payload: Vec<u8>,
    rtp_timestamp: u32,
    marker: bool,
    is_padding: bool,
    arrival: Timestamp,
}

const MAX_BUFFERED_PACKETS: usize = 2048;

/// Sequential frame assembler over one video SSRC.
pub struct FrameAssembler {
    unwrapper: SeqNumUnwrapper,
    packets: BTreeMap<i64, BufferedPacket>,
    /// Next sequence number expected to start a frame.
    next_seq: Option<i64>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler {
            unwrapper: SeqNumUnwrapper::new(),
            packets: BTreeMap::new(),
            next_seq: None,
        }
    }

    /// Inserts one packet and returns every frame (and consumed padding
    /// position) completed by it.
    pub fn insert(&mut self, packet: &RtpPacketReceived) -> Vec<AssemblyEvent> {
        let seq = self.unwrapper.unwrap(packet.sequence_number());
        if let Some(next) = self.next_seq {
            if seq < next {
                // Before the assembly window: duplicate or already skipped.
                return Vec::new();
            }
        } else {
            self.next_seq = Some(seq);
        }
        self.packets.insert(
            seq,
            BufferedPacket {
                payload: packet.payload().to_vec(),
                rtp_timestamp: packet.timestamp(),
                marker: packet.marker(),
                is_padding: packet.payload_size() == 0,
                arrival: packet.arrival_time,
            },
        );
        if self.packets.len() > MAX_BUFFERED_PACKETS {
            self.shed();
        }
        self.try_assemble()
    }

    /// Marks `seq` as consumed without media content (a padding-only slot
    /// or a same-SSRC FEC packet), unblocking assembly across it.
    pub fn insert_consumed(&mut self, seq: u16, arrival: Timestamp) -> Vec<AssemblyEvent> {
        let unwrapped = self.unwrapper.unwrap(seq);
        if let Some(next) = self.next_seq {
            if unwrapped < next {
                return Vec::new();
            }
        } else {
            self.next_seq = Some(unwrapped);
        }
        self.packets.insert(
            unwrapped,
            BufferedPacket {
                payload: Vec::new(),
                rtp_timestamp: 0,
                marker: false,
                is_padding: true,
                arrival,
            },
        );
        self.try_assemble()
    }

    /// Discards state at or before `seq` and restarts assembly after it.
    pub fn clear_to(&mut self, seq: u16) {
        let up_to = self.unwrapper.unwrap(seq);
        self.packets.retain(|s, _| *s > up_to);
        let next = self.next_seq.unwrap_or(up_to + 1).max(up_to + 1);
        self.next_seq = Some(next);
    }

    fn shed(&mut self) {
        // Drop the oldest half and resume at the first survivor.
        let keys: Vec<i64> = self.packets.keys().copied().collect();
        let cut = keys[keys.len() / 2];
        self.packets.retain(|s, _| *s >= cut);
        self.next_seq = Some(cut);
        debug!("frame assembler shed packets below {cut}");
    }

    fn try_assemble(&mut self) -> Vec<AssemblyEvent> {
        let mut events = Vec::new();
        loop {
            let Some(start) = self.next_seq else {
                break;
            };
            // Padding packets stand alone between frames.
            if let Some(packet) = self.packets.get(&start) {
                if packet.is_padding {
                    self.packets.remove(&start);
                    self.next_seq = Some(start + 1);
                    events.push(AssemblyEvent::Padding(start));
                    continue;
                }
            }
            // Walk the contiguous run from `start` to the first marker.
            let mut end = None;
            let mut cursor = start;
            loop {
                match self.packets.get(&cursor) {
                    None => break,
                    Some(packet) if packet.is_padding => break,
                    Some(packet) if packet.marker => {
                        end = Some(cursor);
                        break;
                    }
                    Some(_) => cursor += 1,
                }
            }
            let Some(end) = end else {
                break;
            };

            if let Some(frame) = self.assemble_range(start, end) {
                events.push(AssemblyEvent::Frame(frame));
            }
            for seq in start..=end {
                self.packets.remove(&seq);
            }
            self.next_seq = Some(end + 1);
        }
        events
    }

    fn assemble_range(&mut self, start: i64, end: i64) -> Option<AssembledFrame> {
        let mut depacketizer = H264Depacketizer::new();
        let mut payload = Vec::new();
        let mut is_keyframe = false;
        let mut rtp_timestamp = 0;
        let mut received_time = Timestamp::ZERO;

        for seq in start..=end {
            let packet = self.packets.get(&seq)?;
            rtp_timestamp = packet.rtp_timestamp;
            received_time = received_time.max(packet.arrival);
            match depacketizer.depacketize(&packet.payload, seq as u16) {
                Ok(Some(unit)) => {
                    is_keyframe |= unit.is_keyframe;
                    payload.extend_from_slice(&unit.data);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("dropping broken access unit at {seq}: {e}");
                    return None;
                }
            }
        }
        if payload.is_empty() {
            return None;
        }
        Some(AssembledFrame {
            first_seq_num: start as u16,
            last_seq_num: end as u16,
            unwrapped_last_seq: end,
            rtp_timestamp,
            is_keyframe,
            payload,
            received_time,
        })
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::packetizer::h264::{H264Packetizer, PacketizationMode};
    use rtp::packetizer::PayloadSizeLimits;
    use rtp::RtpPacket;

    fn frame_bitstream(keyframe: bool, size: usize) -> Vec<u8> {
        let mut bitstream = vec![0, 0, 0, 1];
        bitstream.push(if keyframe { 0x65 } else { 0x41 });
        bitstream.extend((0..size).map(|i| i as u8));
        bitstream
    }

    fn packetize(bitstream: &[u8], start_seq: u16, timestamp: u32) -> Vec<RtpPacketReceived> {
        let mut packetizer = H264Packetizer::new(
            bitstream,
            PayloadSizeLimits {
                max_payload_len: 300,
                ..Default::default()
            },
            PacketizationMode::NonInterleaved,
        )
        .unwrap();
        let mut packets = Vec::new();
        let mut seq = start_seq;
        loop {
            let mut packet = RtpPacket::new();
            if !packetizer.next_packet(&mut packet) {
                break;
            }
            packet.set_sequence_number(seq);
            packet.set_timestamp(timestamp);
            seq = seq.wrapping_add(1);
            packets.push(RtpPacketReceived::new(packet, Timestamp::from_millis(100)));
        }
        packets
    }

    fn frames(events: Vec<AssemblyEvent>) -> Vec<AssembledFrame> {
        events
            .into_iter()
            .filter_map(|event| match event {
                AssemblyEvent::Frame(frame) => Some(frame),
                AssemblyEvent::Padding(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_single_packet_frame() {
        let mut assembler = FrameAssembler::new();
        let packets = packetize(&frame_bitstream(true, 50), 10, 90_000);
        assert_eq!(packets.len(), 1);
        let frames = frames(assembler.insert(&packets[0]));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_keyframe);
        assert_eq!(frames[0].first_seq_num, 10);
        assert_eq!(frames[0].last_seq_num, 10);
        assert_eq!(frames[0].payload, frame_bitstream(true, 50));
    }

    #[test]
    fn test_fragmented_frame_requires_all_packets() {
        let mut assembler = FrameAssembler::new();
        let packets = packetize(&frame_bitstream(true, 2000), 0, 90_000);
        assert!(packets.len() > 2);
        for packet in &packets[..packets.len() - 1] {
            assert!(assembler.insert(packet).is_empty());
        }
        let frames = frames(assembler.insert(packets.last().unwrap()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame_bitstream(true, 2000));
    }

    #[test]
    fn test_out_of_order_within_frame() {
        let mut assembler = FrameAssembler::new();
        let packets = packetize(&frame_bitstream(false, 2000), 0, 90_000);
        // Deliver the middle last.
        let mut order: Vec<usize> = (0..packets.len()).collect();
        order.swap(1, packets.len() - 1);
        let mut events = Vec::new();
        for index in order {
            events.extend(assembler.insert(&packets[index]));
        }
        let frames = frames(events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame_bitstream(false, 2000));
    }

    #[test]
    fn test_gap_stalls_until_cleared() {
        let mut assembler = FrameAssembler::new();
        let first = packetize(&frame_bitstream(true, 50), 0, 90_000);
        let second = packetize(&frame_bitstream(false, 50), 2, 93_000);
        assert_eq!(assembler.insert(&first[0]).len(), 1);
        // Seq 1 lost; the frame at seq 2 cannot assemble.
        assert!(assembler.insert(&second[0]).is_empty());
        // Skipping the hole releases it.
        assembler.clear_to(1);
        let frames = frames(assembler.try_assemble());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].first_seq_num, 2);
    }

    #[test]
    fn test_consecutive_frames_in_one_insert() {
        let mut assembler = FrameAssembler::new();
        let first = packetize(&frame_bitstream(true, 50), 0, 90_000);
        let second = packetize(&frame_bitstream(false, 50), 1, 93_000);
        // Deliver out of order: the second frame first.
        assert!(assembler.insert(&second[0]).is_empty());
        let frames = frames(assembler.insert(&first[0]));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_keyframe);
        assert!(!frames[1].is_keyframe);
    }

    #[test]
    fn test_padding_packet_consumed_between_frames() {
        let mut assembler = FrameAssembler::new();
        let first = packetize(&frame_bitstream(true, 50), 0, 90_000);
        assert_eq!(assembler.insert(&first[0]).len(), 1);

        let mut padding = RtpPacket::new();
        padding.set_sequence_number(1);
        padding.set_timestamp(90_000);
        padding.set_padding(255);
        let padding = RtpPacketReceived::new(padding, Timestamp::from_millis(100));
        let events = assembler.insert(&padding);
        assert!(matches!(events[..], [AssemblyEvent::Padding(1)]));

        // The next frame assembles right across the padding.
        let second = packetize(&frame_bitstream(false, 50), 2, 93_000);
        let frames = frames(assembler.insert(&second[0]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].first_seq_num, 2);
    }
}
