//! Receiver report (RFC 3550 §6.4.2).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, PT_RECEIVER_REPORT};
use crate::report_block::{ReportBlock, REPORT_BLOCK_SIZE};

const MAX_REPORT_BLOCKS: usize = 31;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,
    pub report_blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn new(sender_ssrc: u32) -> Self {
        ReceiverReport {
            sender_ssrc,
            report_blocks: Vec::new(),
        }
    }

    pub fn add_report_block(&mut self, block: ReportBlock) -> Result<()> {
        if self.report_blocks.len() >= MAX_REPORT_BLOCKS {
            return Err(Error::TooManyReports);
        }
        self.report_blocks.push(block);
        Ok(())
    }

    pub fn packet_size(&self) -> usize {
        8 + REPORT_BLOCK_SIZE * self.report_blocks.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(
            PT_RECEIVER_REPORT,
            self.report_blocks.len() as u8,
            self.packet_size() - 4,
        );
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        for block in &self.report_blocks {
            block.pack_into(out);
        }
    }

    pub fn parse(header: &RtcpHeader, payload: &[u8]) -> Result<ReceiverReport> {
        if payload.len() < 4 {
            return Err(Error::PacketTooShort);
        }
        let count = header.count_or_format as usize;
        if payload.len() < 4 + count * REPORT_BLOCK_SIZE {
            return Err(Error::PacketTooShort);
        }
        let mut report = ReceiverReport::new(u32::from_be_bytes(payload[0..4].try_into().unwrap()));
        let mut offset = 4;
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
    fn test_empty_report_round_trip() {
        let report = ReceiverReport::new(0xCAFE_F00D);
        let mut wire = Vec::new();
        report.pack_into(&mut wire);
        assert_eq!(wire.len(), 8);
        let header = RtcpHeader::parse(&wire).unwrap();
        let parsed = ReceiverReport::parse(&header, &wire[4..]).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_truncated_block_rejected() {
        let mut report = ReceiverReport::new(1);
        report.add_report_block(ReportBlock::new()).unwrap();
        let mut wire = Vec::new();
        report.pack_into(&mut wire);
        let header = RtcpHeader {
            payload_size: 4,
            ..RtcpHeader::parse(&wire).unwrap()
        };
        assert!(ReceiverReport::parse(&header, &wire[4..12]).is_err());
    }
}
