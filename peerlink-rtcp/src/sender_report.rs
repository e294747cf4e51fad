//! Sender report (RFC 3550 §6.4.1).

use shared::error::{Error, Result};
use shared::units::NtpTime;

use crate::header::{RtcpHeader, PT_SENDER_REPORT};
use crate::report_block::{ReportBlock, REPORT_BLOCK_SIZE};

const SENDER_INFO_SIZE: usize = 24;
const MAX_REPORT_BLOCKS: usize = 31;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_ssrc: u32,
    pub ntp_timestamp: NtpTime,
    pub rtp_timestamp: u32,
    pub sender_packet_count: u32,
    pub sender_octet_count: u32,
    pub report_blocks: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn add_report_block(&mut self, block: ReportBlock) -> Result<()> {
        if self.report_blocks.len() >= MAX_REPORT_BLOCKS {
            return Err(Error::TooManyReports);
        }
        self.report_blocks.push(block);
        Ok(())
    }

    pub fn packet_size(&self) -> usize {
        4 + SENDER_INFO_SIZE + REPORT_BLOCK_SIZE * self.report_blocks.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(
            PT_SENDER_REPORT,
            self.report_blocks.len() as u8,
            self.packet_size() - 4,
        );
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        out.extend_from_slice(&self.ntp_timestamp.as_u64().to_be_bytes());
        out.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        out.extend_from_slice(&self.sender_packet_count.to_be_bytes());
        out.extend_from_slice(&self.sender_octet_count.to_be_bytes());
        for block in &self.report_blocks {
            block.pack_into(out);
        }
    }

    pub fn parse(header: &RtcpHeader, payload: &[u8]) -> Result<SenderReport> {
        if payload.len() < SENDER_INFO_SIZE {
            return Err(Error::PacketTooShort);
        }
        let count = header.count_or_format as usize;
        if payload.len() < SENDER_INFO_SIZE + count * REPORT_BLOCK_SIZE {
            return Err(Error::PacketTooShort);
        }
        let mut report = SenderReport {
            sender_ssrc: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            ntp_timestamp: NtpTime::from_u64(u64::from_be_bytes(
                payload[4..12].try_into().unwrap(),
            )),
            rtp_timestamp: u32::from_be_bytes(payload[12..16].try_into().unwrap()),
            sender_packet_count: u32::from_be_bytes(payload[16..20].try_into().unwrap()),
            sender_octet_count: u32::from_be_bytes(payload[20..24].try_into().unwrap()),
            report_blocks: Vec::with_capacity(count),
        };
        let mut offset = SENDER_INFO_SIZE;
        for _ in 0..count {
            report
                .report_blocks
                .push(ReportBlock::parse(&payload[offset..])?);
            offset += REPORT_BLOCK_SIZE;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_blocks() {
        let mut report = SenderReport {
            sender_ssrc: 0x1111_2222,
            ntp_timestamp: NtpTime::new(0x0102_0304, 0x0506_0708),
            rtp_timestamp: 0x7788_99AA,
            sender_packet_count: 1000,
            sender_octet_count: 123_456,
            report_blocks: Vec::new(),
        };
        let mut block = ReportBlock::new();
        block.set_source_ssrc(0x3333_4444);
        block.set_fraction_lost(10);
        report.add_report_block(block).unwrap();

        let mut wire = Vec::new();
        report.pack_into(&mut wire);
        assert_eq!(wire.len(), report.packet_size());

        let header = RtcpHeader::parse(&wire).unwrap();
        assert_eq!(header.packet_type, PT_SENDER_REPORT);
        let parsed = SenderReport::parse(&header, &wire[4..]).unwrap();
        assert_eq!(parsed, report);
    }
}
