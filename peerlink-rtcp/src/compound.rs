//! Compound packet assembly with bounded-size flushing.

use crate::packet::RtcpPacket;

/// An ordered list of RTCP packets packed back to back.
///
/// Packing respects a maximum buffer size: whenever the next packet would
/// not fit, the current buffer is flushed through the callback and a fresh
/// buffer is started. Each emitted buffer re-leads with the compound's
/// opening report (SR or RR) so that every buffer is itself a valid
/// compound packet.
#[derive(Debug, Default, Clone)]
pub struct CompoundPacket {
    packets: Vec<RtcpPacket>,
}

impl CompoundPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, packet: RtcpPacket) {
        self.packets.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn packets(&self) -> &[RtcpPacket] {
        &self.packets
    }

    /// Total size when packed into a single buffer.
    pub fn packet_size(&self) -> usize {
        self.packets.iter().map(RtcpPacket::packet_size).sum()
    }

    /// Packs all packets, emitting buffers of at most `max_size` bytes via
    /// `callback`. A single packet larger than `max_size` is emitted alone.
    pub fn pack(&self, max_size: usize, callback: &mut dyn FnMut(&[u8])) {
        if self.packets.is_empty() {
            return;
        }
        let leading_report: Option<Vec<u8>> = self.packets.first().and_then(|first| {
            if first.is_report() {
                let mut bytes = Vec::with_capacity(first.packet_size());
                first.pack_into(&mut bytes);
                Some(bytes)
            } else {
                None
            }
        });

        let mut buffer: Vec<u8> = Vec::with_capacity(max_size);
        for (index, packet) in self.packets.iter().enumerate() {
            let mut bytes = Vec::with_capacity(packet.packet_size());
            packet.pack_into(&mut bytes);

            if !buffer.is_empty() && buffer.len() + bytes.len() > max_size {
                callback(&buffer);
                buffer.clear();
                if index > 0 {
                    if let Some(leading) = &leading_report {
                        if leading.len() + bytes.len() <= max_size {
                            buffer.extend_from_slice(leading);
                        }
                    }
                }
            }
            buffer.extend_from_slice(&bytes);
        }
        if !buffer.is_empty() {
            callback(&buffer);
        }
    }

    /// Packs everything into one unbounded buffer.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packet_size());
        for packet in &self.packets {
            packet.pack_into(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::RtcpHeader;
    use crate::nack::Nack;
    use crate::packet::parse_compound;
    use crate::receiver_report::ReceiverReport;
    use crate::sdes::Sdes;

    fn compound_with_nacks(nack_count: usize) -> CompoundPacket {
        let mut compound = CompoundPacket::new();
        compound.append(RtcpPacket::ReceiverReport(ReceiverReport::new(0x1111)));
        let mut sdes = Sdes::default();
        sdes.add_cname(0x1111, "compound-test").unwrap();
        compound.append(RtcpPacket::Sdes(sdes));
        for i in 0..nack_count {
            compound.append(RtcpPacket::Nack(Nack::with_sequence_numbers(
                0x1111,
                0x2222,
                &[(i * 20) as u16],
            )));
        }
        compound
    }

    #[test]
    fn test_single_buffer_when_it_fits() {
        let compound = compound_with_nacks(2);
        let mut buffers = Vec::new();
        compound.pack(1200, &mut |buf| buffers.push(buf.to_vec()));
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].len(), compound.packet_size());
        assert_eq!(parse_compound(&buffers[0]).unwrap().len(), 2 + 2);
    }

    #[test]
    fn test_flush_keeps_every_buffer_bounded_and_valid() {
        let compound = compound_with_nacks(40);
        let max_size = 100;
        let mut buffers = Vec::new();
        compound.pack(max_size, &mut |buf| buffers.push(buf.to_vec()));
        assert!(buffers.len() > 1);
        for buffer in &buffers {
            assert!(buffer.len() <= max_size);
            // Starts with an RR (a valid compound opening).
            let header = RtcpHeader::parse(buffer).unwrap();
            assert_eq!(header.packet_type, crate::header::PT_RECEIVER_REPORT);
            assert!(parse_compound(buffer).is_ok());
        }
        // No packet was lost across the buffers.
        let total: usize = buffers
            .iter()
            .map(|b| parse_compound(b).unwrap().len())
            .sum();
        // 40 nacks + sdes + one RR per buffer.
        assert_eq!(total, 40 + 1 + buffers.len());
    }

    #[test]
    fn test_build_concatenates_everything() {
        let compound = compound_with_nacks(3);
        let wire = compound.build();
        assert_eq!(parse_compound(&wire).unwrap().len(), 5);
    }
}
