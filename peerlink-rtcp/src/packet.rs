//! The closed set of RTCP packet types and the compound-level parser.

use log::debug;

use shared::error::{Error, Result};

use crate::bye::Bye;
use crate::fir::Fir;
use crate::header::{
    RtcpHeader, FMT_AFB, FMT_FIR, FMT_NACK, FMT_PLI, FMT_TMMBN, FMT_TMMBR,
    FMT_TRANSPORT_FEEDBACK, PT_BYE, PT_PSFB, PT_RECEIVER_REPORT, PT_RTPFB, PT_SDES,
    PT_SENDER_REPORT, PT_XR, RTCP_HEADER_SIZE,
};
use crate::nack::Nack;
use crate::pli::Pli;
use crate::receiver_report::ReceiverReport;
use crate::remb::Remb;
use crate::sdes::Sdes;
use crate::sender_report::SenderReport;
use crate::tmmbr::{Tmmbn, Tmmbr};
use crate::transport_feedback::TransportFeedback;
use crate::xr::Xr;

/// Any RTCP packet this stack understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Sdes(Sdes),
    Bye(Bye),
    Nack(Nack),
    Pli(Pli),
    Fir(Fir),
    Remb(Remb),
    Tmmbr(Tmmbr),
    Tmmbn(Tmmbn),
    TransportFeedback(TransportFeedback),
    Xr(Xr),
}

impl RtcpPacket {
    pub fn packet_size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(p) => p.packet_size(),
            RtcpPacket::ReceiverReport(p) => p.packet_size(),
            RtcpPacket::Sdes(p) => p.packet_size(),
            RtcpPacket::Bye(p) => p.packet_size(),
            RtcpPacket::Nack(p) => p.packet_size(),
            RtcpPacket::Pli(p) => p.packet_size(),
            RtcpPacket::Fir(p) => p.packet_size(),
            RtcpPacket::Remb(p) => p.packet_size(),
            RtcpPacket::Tmmbr(p) => p.packet_size(),
            RtcpPacket::Tmmbn(p) => p.packet_size(),
            RtcpPacket::TransportFeedback(p) => p.packet_size(),
            RtcpPacket::Xr(p) => p.packet_size(),
        }
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        match self {
            RtcpPacket::SenderReport(p) => p.pack_into(out),
            RtcpPacket::ReceiverReport(p) => p.pack_into(out),
            RtcpPacket::Sdes(p) => p.pack_into(out),
            RtcpPacket::Bye(p) => p.pack_into(out),
            RtcpPacket::Nack(p) => p.pack_into(out),
            RtcpPacket::Pli(p) => p.pack_into(out),
            RtcpPacket::Fir(p) => p.pack_into(out),
            RtcpPacket::Remb(p) => p.pack_into(out),
            RtcpPacket::Tmmbr(p) => p.pack_into(out),
            RtcpPacket::Tmmbn(p) => p.pack_into(out),
            RtcpPacket::TransportFeedback(p) => p.pack_into(out),
            RtcpPacket::Xr(p) => p.pack_into(out),
        }
    }

    /// True for the report packets that may open a compound.
    pub fn is_report(&self) -> bool {
        matches!(
            self,
            RtcpPacket::SenderReport(_) | RtcpPacket::ReceiverReport(_)
        )
    }

    /// Parses one packet; `Ok(None)` for types we do not model (the caller
    /// skips them by the header length).
    fn parse_one(header: &RtcpHeader, payload: &[u8]) -> Result<Option<RtcpPacket>> {
        let packet = match (header.packet_type, header.count_or_format) {
            (PT_SENDER_REPORT, _) => RtcpPacket::SenderReport(SenderReport::parse(header, payload)?),
            (PT_RECEIVER_REPORT, _) => {
                RtcpPacket::ReceiverReport(ReceiverReport::parse(header, payload)?)
            }
            (PT_SDES, _) => RtcpPacket::Sdes(Sdes::parse(header, payload)?),
            (PT_BYE, _) => RtcpPacket::Bye(Bye::parse(header, payload)?),
            (PT_RTPFB, FMT_NACK) => RtcpPacket::Nack(Nack::parse(payload)?),
            (PT_RTPFB, FMT_TMMBR) => RtcpPacket::Tmmbr(Tmmbr::parse(payload)?),
            (PT_RTPFB, FMT_TMMBN) => RtcpPacket::Tmmbn(Tmmbn::parse(payload)?),
            (PT_RTPFB, FMT_TRANSPORT_FEEDBACK) => {
                RtcpPacket::TransportFeedback(TransportFeedback::parse(payload)?)
            }
            (PT_PSFB, FMT_PLI) => RtcpPacket::Pli(Pli::parse(payload)?),
            (PT_PSFB, FMT_FIR) => RtcpPacket::Fir(Fir::parse(payload)?),
            (PT_PSFB, FMT_AFB) => RtcpPacket::Remb(Remb::parse(payload)?),
            _ => {
                debug!(
                    "skipping unhandled rtcp packet type {} fmt {}",
                    header.packet_type, header.count_or_format
                );
                return Ok(None);
            }
        };
        Ok(Some(packet))
    }
}

impl From<Xr> for RtcpPacket {
    fn from(xr: Xr) -> Self {
        RtcpPacket::Xr(xr)
    }
}

/// Parses a datagram holding one or more concatenated RTCP packets.
///
/// Unknown packet types are skipped; structurally broken ones abort the
/// whole parse.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    if data.is_empty() {
        return Err(Error::PacketTooShort);
    }
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = RtcpHeader::parse(&data[offset..])?;
        let payload_start = offset + RTCP_HEADER_SIZE;
        let payload = &data[payload_start..payload_start + header.payload_size];
        if header.packet_type == PT_XR {
            packets.push(RtcpPacket::Xr(Xr::parse(payload)?));
        } else if let Some(packet) = RtcpPacket::parse_one(&header, payload)? {
            packets.push(packet);
        }
        offset = payload_start + header.payload_size;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report_block::ReportBlock;

    #[test]
    fn test_parse_compound_mixed() {
        let mut wire = Vec::new();
        let mut rr = ReceiverReport::new(0x1111);
        let mut block = ReportBlock::new();
        block.set_source_ssrc(0x2222);
        rr.add_report_block(block).unwrap();
        rr.pack_into(&mut wire);

        let mut sdes = Sdes::default();
        sdes.add_cname(0x1111, "cname").unwrap();
        sdes.pack_into(&mut wire);

        let nack = Nack::with_sequence_numbers(0x1111, 0x2222, &[7, 8]);
        nack.pack_into(&mut wire);

        let packets = parse_compound(&wire).unwrap();
        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[0], RtcpPacket::ReceiverReport(_)));
        assert!(matches!(packets[1], RtcpPacket::Sdes(_)));
        match &packets[2] {
            RtcpPacket::Nack(nack) => assert_eq!(nack.sequence_numbers(), vec![7, 8]),
            other => panic!("expected nack, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_skipped() {
        let mut wire = Vec::new();
        Pli::new(1, 2).pack_into(&mut wire);
        // APP packet (204), one word of payload.
        wire.extend_from_slice(&[0x80, 204, 0, 1, 0, 0, 0, 0]);
        let packets = parse_compound(&wire).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_truncated_compound_fails() {
        let mut wire = Vec::new();
        Pli::new(1, 2).pack_into(&mut wire);
        wire.truncate(wire.len() - 2);
        assert!(parse_compound(&wire).is_err());
    }
}
