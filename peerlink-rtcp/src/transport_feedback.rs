//! Transport-wide congestion control feedback
//! (draft-holmer-rmcat-transport-wide-cc-extensions-01).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, FMT_TRANSPORT_FEEDBACK, PT_RTPFB};

/// Arrival-time resolution: 250 microseconds per tick.
pub const DELTA_TICK_US: i64 = 250;
/// Reference-time resolution: 64 milliseconds per unit.
pub const REFERENCE_TIME_UNIT_US: i64 = 64_000;

const CHUNK_RUN_LENGTH_MAX: usize = 0x1FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusSymbol {
    NotReceived,
    SmallDelta,
    LargeDelta,
}

impl StatusSymbol {
    fn code(self) -> u16 {
        match self {
            StatusSymbol::NotReceived => 0,
            StatusSymbol::SmallDelta => 1,
            StatusSymbol::LargeDelta => 2,
        }
    }

    fn from_code(code: u16) -> StatusSymbol {
        match code {
            1 => StatusSymbol::SmallDelta,
            2 => StatusSymbol::LargeDelta,
            _ => StatusSymbol::NotReceived,
        }
    }
}

/// Per-packet feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketResult {
    pub sequence_number: u16,
    /// Inter-arrival delta in 250 us ticks; `None` for lost packets.
    pub delta_ticks: Option<i32>,
}

impl PacketResult {
    fn symbol(&self) -> StatusSymbol {
        match self.delta_ticks {
            None => StatusSymbol::NotReceived,
            Some(delta) if (0..=255).contains(&delta) => StatusSymbol::SmallDelta,
            Some(_) => StatusSymbol::LargeDelta,
        }
    }
}

/// A transport feedback message covering a contiguous run of transport
/// sequence numbers starting at `base_sequence_number`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub base_sequence_number: u16,
    /// Absolute reference time in 64 ms units (24-bit signed).
    pub reference_time: i32,
    pub feedback_packet_count: u8,
    pub packets: Vec<PacketResult>,
}

impl TransportFeedback {
    pub fn new(base_sequence_number: u16, reference_time: i32, feedback_packet_count: u8) -> Self {
        TransportFeedback {
            base_sequence_number,
            reference_time,
            feedback_packet_count,
            ..Default::default()
        }
    }

    /// Appends the next packet in sequence order.
    pub fn push_packet(&mut self, delta_ticks: Option<i32>) {
        let sequence_number = self
            .base_sequence_number
            .wrapping_add(self.packets.len() as u16);
        self.packets.push(PacketResult {
            sequence_number,
            delta_ticks,
        });
    }

    pub fn packet_size(&self) -> usize {
        let mut size = 4 + 16; // header + ssrcs + base/count/ref/fbcount
        let mut i = 0;
        while i < self.packets.len() {
            let run = self.run_length_at(i);
            size += 2;
            i += run;
        }
        for packet in &self.packets {
            size += match packet.symbol() {
                StatusSymbol::NotReceived => 0,
                StatusSymbol::SmallDelta => 1,
                StatusSymbol::LargeDelta => 2,
            };
        }
        (size + 3) / 4 * 4
    }

    fn run_length_at(&self, start: usize) -> usize {
        let symbol = self.packets[start].symbol();
        let mut run = 1;
        while start + run < self.packets.len()
            && self.packets[start + run].symbol() == symbol
            && run < CHUNK_RUN_LENGTH_MAX
        {
            run += 1;
        }
        run
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(
            PT_RTPFB,
            FMT_TRANSPORT_FEEDBACK,
            self.packet_size() - 4,
        );
        header.pack_into(out);
        let start = out.len();
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        out.extend_from_slice(&self.media_ssrc.to_be_bytes());
        out.extend_from_slice(&self.base_sequence_number.to_be_bytes());
        out.extend_from_slice(&(self.packets.len() as u16).to_be_bytes());
        let reference = self.reference_time as u32 & 0x00FF_FFFF;
        out.extend_from_slice(&[
            (reference >> 16) as u8,
            (reference >> 8) as u8,
            reference as u8,
            self.feedback_packet_count,
        ]);

        // Run-length status chunks.
        let mut i = 0;
        while i < self.packets.len() {
            let run = self.run_length_at(i);
            let symbol = self.packets[i].symbol();
            let chunk = (symbol.code() << 13) | run as u16;
            out.extend_from_slice(&chunk.to_be_bytes());
            i += run;
        }

        // Receive deltas.
        for packet in &self.packets {
            match (packet.symbol(), packet.delta_ticks) {
                (StatusSymbol::SmallDelta, Some(delta)) => out.push(delta as u8),
                (StatusSymbol::LargeDelta, Some(delta)) => {
                    out.extend_from_slice(&(delta as i16).to_be_bytes())
                }
                _ => {}
            }
        }

        while (out.len() - start + 4) % 4 != 0 {
            out.push(0);
        }
    }

    pub fn parse(payload: &[u8]) -> Result<TransportFeedback> {
        if payload.len() < 16 {
            return Err(Error::PacketTooShort);
        }
        let base_sequence_number = u16::from_be_bytes(payload[8..10].try_into().unwrap());
        let status_count = u16::from_be_bytes(payload[10..12].try_into().unwrap()) as usize;
        let raw_reference =
            ((payload[12] as u32) << 16) | ((payload[13] as u32) << 8) | payload[14] as u32;
        let reference_time = ((raw_reference << 8) as i32) >> 8;

        let mut feedback = TransportFeedback {
            sender_ssrc: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            media_ssrc: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
            base_sequence_number,
            reference_time,
            feedback_packet_count: payload[15],
            packets: Vec::with_capacity(status_count),
        };

        // Status chunks.
        let mut symbols = Vec::with_capacity(status_count);
        let mut offset = 16;
        while symbols.len() < status_count {
            if offset + 2 > payload.len() {
                return Err(Error::PacketTooShort);
            }
            let chunk = u16::from_be_bytes(payload[offset..offset + 2].try_into().unwrap());
            offset += 2;
            if chunk & 0x8000 == 0 {
                // Run-length chunk.
                let symbol = StatusSymbol::from_code((chunk >> 13) & 0x03);
                let run = (chunk & 0x1FFF) as usize;
                for _ in 0..run.min(status_count - symbols.len()) {
                    symbols.push(symbol);
                }
            } else {
                // Status vector chunk: one or two bits per symbol.
                let two_bit = chunk & 0x4000 != 0;
                let slots = if two_bit { 7 } else { 14 };
                for slot in 0..slots {
                    if symbols.len() >= status_count {
                        break;
                    }
                    let symbol = if two_bit {
                        StatusSymbol::from_code((chunk >> (2 * (slots - 1 - slot))) & 0x03)
                    } else if chunk & (1 << (13 - slot)) != 0 {
                        StatusSymbol::SmallDelta
                    } else {
                        StatusSymbol::NotReceived
                    };
                    symbols.push(symbol);
                }
            }
        }

        // Deltas.
        for (index, symbol) in symbols.iter().enumerate() {
            let sequence_number = base_sequence_number.wrapping_add(index as u16);
            let delta_ticks = match symbol {
                StatusSymbol::NotReceived => None,
                StatusSymbol::SmallDelta => {
                    if offset >= payload.len() {
                        return Err(Error::PacketTooShort);
                    }
                    let delta = payload[offset] as i32;
                    offset += 1;
                    Some(delta)
                }
                StatusSymbol::LargeDelta => {
                    if offset + 2 > payload.len() {
                        return Err(Error::PacketTooShort);
                    }
                    let delta =
                        i16::from_be_bytes(payload[offset..offset + 2].try_into().unwrap()) as i32;
                    offset += 2;
                    Some(delta)
                }
            };
            feedback.packets.push(PacketResult {
                sequence_number,
                delta_ticks,
            });
        }
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed_statuses() {
        let mut feedback = TransportFeedback::new(1000, -3, 5);
        feedback.sender_ssrc = 0x0102_0304;
        feedback.media_ssrc = 0x0506_0708;
        feedback.push_packet(Some(4));
        feedback.push_packet(Some(200));
        feedback.push_packet(None);
        feedback.push_packet(Some(-17)); // large (negative) delta
        feedback.push_packet(Some(1000)); // large delta

        let mut wire = Vec::new();
        feedback.pack_into(&mut wire);
        assert_eq!(wire.len(), feedback.packet_size());
        assert_eq!(wire.len() % 4, 0);

        let parsed = TransportFeedback::parse(&wire[4..]).unwrap();
        assert_eq!(parsed, feedback);
        assert_eq!(parsed.packets[2].delta_ticks, None);
        assert_eq!(parsed.packets[3].sequence_number, 1003);
    }

    #[test]
    fn test_long_loss_run_is_compact() {
        let mut feedback = TransportFeedback::new(0, 0, 0);
        for _ in 0..1000 {
            feedback.push_packet(None);
        }
        let mut wire = Vec::new();
        feedback.pack_into(&mut wire);
        // One run-length chunk covers the whole burst.
        assert_eq!(wire.len(), 4 + 16 + 2 + 2); // padded to a word
        assert_eq!(TransportFeedback::parse(&wire[4..]).unwrap(), feedback);
    }
}
