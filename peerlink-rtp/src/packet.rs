//! RTP packet model: parse, build, typed extension access.

use std::fmt;
use std::ops::{Deref, DerefMut};

use shared::error::{Error, Result};
use shared::units::Timestamp;
use shared::CopyOnWriteBuffer;

use crate::extension::{Extension, HeaderExtensionMap, MAX_ONE_BYTE_ID};

pub const FIXED_HEADER_SIZE: usize = 12;
pub const MAX_CSRCS: usize = 15;

const RTP_VERSION: u8 = 2;
const ONE_BYTE_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_PROFILE: u16 = 0x1000;

/// Category of an outbound RTP packet, driving egress accounting and FEC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpPacketType {
    Audio,
    Video,
    Retransmission,
    ForwardErrorCorrection,
    Padding,
}

/// A parsed or under-construction RTP packet.
///
/// Equality compares the wire image: two packets are equal iff they
/// serialize to the same bytes.
#[derive(Clone)]
pub struct RtpPacket {
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: Vec<u32>,
    extension_entries: Vec<(u8, Vec<u8>)>,
    extension_map: HeaderExtensionMap,
    payload: CopyOnWriteBuffer,
    padding_size: u8,
}

impl Default for RtpPacket {
    fn default() -> Self {
        RtpPacket {
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrcs: Vec::new(),
            extension_entries: Vec::new(),
            extension_map: HeaderExtensionMap::new(),
            payload: CopyOnWriteBuffer::new(),
            padding_size: 0,
        }
    }
}

impl RtpPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension_map(extension_map: HeaderExtensionMap) -> Self {
        RtpPacket {
            extension_map,
            ..Self::default()
        }
    }

    /// Parses a packet, interpreting extension ids through `extension_map`.
    pub fn parse_with_map(data: &[u8], extension_map: HeaderExtensionMap) -> Result<RtpPacket> {
        let mut packet = Self::parse(data)?;
        packet.extension_map = extension_map;
        Ok(packet)
    }

    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(Error::HeaderTooShort);
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(Error::BadVersion);
        }
        let has_padding = (data[0] & 0x20) != 0;
        let has_extension = (data[0] & 0x10) != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = FIXED_HEADER_SIZE;
        if data.len() < offset + 4 * csrc_count {
            return Err(Error::HeaderTooShort);
        }
        let mut csrcs = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrcs.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        let mut extension_entries = Vec::new();
        if has_extension {
            if data.len() < offset + 4 {
                return Err(Error::ExtensionOverrun);
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            let block_len = words * 4;
            if data.len() < offset + block_len {
                return Err(Error::ExtensionOverrun);
            }
            let block = &data[offset..offset + block_len];
            offset += block_len;
            parse_extension_block(profile, block, &mut extension_entries)?;
        }

        let padding_size = if has_padding {
            let padding = *data.last().unwrap();
            if padding == 0 || offset + padding as usize > data.len() {
                return Err(Error::BadPadding);
            }
            padding
        } else {
            0
        };

        let payload_end = data.len() - padding_size as usize;
        if payload_end < offset {
            return Err(Error::BadPadding);
        }
        let payload = CopyOnWriteBuffer::from_slice(&data[offset..payload_end]);

        Ok(RtpPacket {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension_entries,
            extension_map: HeaderExtensionMap::new(),
            payload,
            padding_size,
        })
    }

    // Field accessors.

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        debug_assert!(payload_type <= 0x7F);
        self.payload_type = payload_type & 0x7F;
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u16) {
        self.sequence_number = sequence_number;
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    pub fn csrcs(&self) -> &[u32] {
        &self.csrcs
    }

    pub fn set_csrcs(&mut self, csrcs: Vec<u32>) -> Result<()> {
        if csrcs.len() > MAX_CSRCS {
            return Err(Error::TooManyCsrcs);
        }
        self.csrcs = csrcs;
        Ok(())
    }

    pub fn extension_map(&self) -> &HeaderExtensionMap {
        &self.extension_map
    }

    pub fn set_extension_map(&mut self, extension_map: HeaderExtensionMap) {
        self.extension_map = extension_map;
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.data()
    }

    /// Replaces the payload; any padding is dropped.
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.payload.assign(payload);
        self.padding_size = 0;
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn padding_size(&self) -> u8 {
        self.padding_size
    }

    /// Appends `size` padding bytes; the last one carries the count.
    pub fn set_padding(&mut self, size: u8) {
        self.padding_size = size;
    }

    pub fn has_padding(&self) -> bool {
        self.padding_size > 0
    }

    // Extension access.

    pub fn get_raw_extension(&self, id: u8) -> Option<&[u8]> {
        self.extension_entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, data)| data.as_slice())
    }

    pub fn set_raw_extension(&mut self, id: u8, data: Vec<u8>) {
        if let Some(entry) = self.extension_entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = data;
        } else {
            self.extension_entries.push((id, data));
        }
    }

    /// Typed extension read; `None` when unregistered, absent or
    /// undecodable.
    pub fn get_extension<E: Extension>(&self) -> Option<E> {
        let id = self.extension_map.id_of(E::TYPE)?;
        let data = self.get_raw_extension(id)?;
        E::decode(data).ok()
    }

    /// Typed extension write; fails when `E` has no registered id.
    pub fn set_extension<E: Extension>(&mut self, value: &E) -> Result<()> {
        let id = self
            .extension_map
            .id_of(E::TYPE)
            .ok_or(Error::ExtensionNotRegistered)?;
        self.set_raw_extension(id, value.encode());
        Ok(())
    }

    // Sizes.

    fn uses_one_byte_profile(&self) -> bool {
        self.extension_map.one_byte_capable()
            && self
                .extension_entries
                .iter()
                .all(|(id, data)| *id <= MAX_ONE_BYTE_ID && !data.is_empty() && data.len() <= 16)
    }

    fn extensions_block_size(&self) -> usize {
        if self.extension_entries.is_empty() {
            return 0;
        }
        let one_byte = self.uses_one_byte_profile();
        let mut payload_len = 0;
        for (_, data) in &self.extension_entries {
            payload_len += if one_byte { 1 } else { 2 } + data.len();
        }
        // Profile word + length word, then the entries padded to a word.
        4 + (payload_len + 3) / 4 * 4
    }

    /// `12 + 4·|csrc| + extensions_block_size`, word aligned.
    pub fn header_size(&self) -> usize {
        FIXED_HEADER_SIZE + 4 * self.csrcs.len() + self.extensions_block_size()
    }

    pub fn size(&self) -> usize {
        self.header_size() + self.payload.len() + self.padding_size as usize
    }

    /// Serializes the packet.
    pub fn build(&self) -> CopyOnWriteBuffer {
        let mut out = Vec::with_capacity(self.size());
        let has_extension = !self.extension_entries.is_empty();
        out.push(
            (RTP_VERSION << 6)
                | ((self.padding_size > 0) as u8) << 5
                | (has_extension as u8) << 4
                | self.csrcs.len() as u8,
        );
        out.push(((self.marker as u8) << 7) | self.payload_type);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrcs {
            out.extend_from_slice(&csrc.to_be_bytes());
        }

        if has_extension {
            let one_byte = self.uses_one_byte_profile();
            let profile = if one_byte {
                ONE_BYTE_PROFILE
            } else {
                TWO_BYTE_PROFILE
            };
            let block_size = self.extensions_block_size() - 4;
            out.extend_from_slice(&profile.to_be_bytes());
            out.extend_from_slice(&((block_size / 4) as u16).to_be_bytes());
            let block_start = out.len();
            for (id, data) in &self.extension_entries {
                if one_byte {
                    out.push((id << 4) | (data.len() as u8 - 1));
                } else {
                    out.push(*id);
                    out.push(data.len() as u8);
                }
                out.extend_from_slice(data);
            }
            while (out.len() - block_start) % 4 != 0 {
                out.push(0);
            }
        }

        out.extend_from_slice(self.payload.data());
        if self.padding_size > 0 {
            out.resize(out.len() + self.padding_size as usize - 1, 0);
            out.push(self.padding_size);
        }
        CopyOnWriteBuffer::from(out)
    }
}

fn parse_extension_block(
    profile: u16,
    block: &[u8],
    entries: &mut Vec<(u8, Vec<u8>)>,
) -> Result<()> {
    let mut i = 0;
    match profile {
        ONE_BYTE_PROFILE => {
            while i < block.len() {
                let byte = block[i];
                if byte == 0 {
                    i += 1;
                    continue;
                }
                let id = byte >> 4;
                if id == 15 {
                    break;
                }
                let len = (byte & 0x0F) as usize + 1;
                i += 1;
                if i + len > block.len() {
                    return Err(Error::ExtensionOverrun);
                }
                entries.push((id, block[i..i + len].to_vec()));
                i += len;
            }
        }
        p if p & 0xFFF0 == TWO_BYTE_PROFILE => {
            while i + 1 < block.len() {
                let id = block[i];
                if id == 0 {
                    i += 1;
                    continue;
                }
                let len = block[i + 1] as usize;
                i += 2;
                if i + len > block.len() {
                    return Err(Error::ExtensionOverrun);
                }
                entries.push((id, block[i..i + len].to_vec()));
                i += len;
            }
        }
        _ => {
            // Unknown profile: the block is opaque but the packet is fine.
        }
    }
    Ok(())
}

impl PartialEq for RtpPacket {
    fn eq(&self, other: &Self) -> bool {
        self.marker == other.marker
            && self.payload_type == other.payload_type
            && self.sequence_number == other.sequence_number
            && self.timestamp == other.timestamp
            && self.ssrc == other.ssrc
            && self.csrcs == other.csrcs
            && self.extension_entries == other.extension_entries
            && self.payload == other.payload
            && self.padding_size == other.padding_size
    }
}

impl Eq for RtpPacket {}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("marker", &self.marker)
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.ssrc)
            .field("payload_size", &self.payload.len())
            .field("padding_size", &self.padding_size)
            .finish()
    }
}

/// An inbound packet together with its receive-path metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacketReceived {
    pub packet: RtpPacket,
    pub arrival_time: Timestamp,
    pub is_recovered: bool,
}

impl RtpPacketReceived {
    pub fn new(packet: RtpPacket, arrival_time: Timestamp) -> Self {
        RtpPacketReceived {
            packet,
            arrival_time,
            is_recovered: false,
        }
    }
}

impl Deref for RtpPacketReceived {
    type Target = RtpPacket;

    fn deref(&self) -> &RtpPacket {
        &self.packet
    }
}

impl DerefMut for RtpPacketReceived {
    fn deref_mut(&mut self) -> &mut RtpPacket {
        &mut self.packet
    }
}

/// An outbound packet with its send-path metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacketToSend {
    pub packet: RtpPacket,
    pub packet_type: RtpPacketType,
    pub capture_time_ms: i64,
    /// Payload is RED-encapsulated; the real payload type sits in the first
    /// payload byte.
    pub is_red: bool,
    /// For retransmissions, the original media sequence number.
    pub retransmitted_sequence_number: Option<u16>,
}

impl RtpPacketToSend {
    pub fn new(packet: RtpPacket, packet_type: RtpPacketType) -> Self {
        RtpPacketToSend {
            packet,
            packet_type,
            capture_time_ms: 0,
            is_red: false,
            retransmitted_sequence_number: None,
        }
    }
}

impl Deref for RtpPacketToSend {
    type Target = RtpPacket;

    fn deref(&self) -> &RtpPacket {
        &self.packet
    }
}

impl DerefMut for RtpPacketToSend {
    fn deref_mut(&mut self) -> &mut RtpPacket {
        &mut self.packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{
        ExtensionType, Mid, TransmissionOffset, TransportSequenceNumber,
    };

    fn test_map() -> HeaderExtensionMap {
        let mut map = HeaderExtensionMap::new();
        map.register(1, ExtensionType::TransmissionOffset).unwrap();
        map.register(7, ExtensionType::Mid).unwrap();
        map.register(3, ExtensionType::TransportSequenceNumber)
            .unwrap();
        map
    }

    fn sample_packet() -> RtpPacket {
        let mut packet = RtpPacket::with_extension_map(test_map());
        packet.set_marker(true);
        packet.set_payload_type(102);
        packet.set_sequence_number(0x1234);
        packet.set_timestamp(0x6543_21AB);
        packet.set_ssrc(0x0BAD_CAFE);
        packet.set_csrcs(vec![0x1111_1111, 0x2222_2222]).unwrap();
        packet.set_payload(&[0xDE, 0xAD, 0xBE, 0xEF, 0x42]);
        packet
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let mut packet = sample_packet();
        packet
            .set_extension(&TransmissionOffset(0x00_1234))
            .unwrap();
        packet.set_extension(&Mid("a".into())).unwrap();
        packet.set_padding(4);

        let wire = packet.build();
        let parsed = RtpPacket::parse_with_map(wire.data(), test_map()).unwrap();

        assert!(parsed.marker());
        assert_eq!(parsed.payload_type(), 102);
        assert_eq!(parsed.sequence_number(), 0x1234);
        assert_eq!(parsed.timestamp(), 0x6543_21AB);
        assert_eq!(parsed.ssrc(), 0x0BAD_CAFE);
        assert_eq!(parsed.csrcs(), &[0x1111_1111, 0x2222_2222]);
        assert_eq!(parsed.payload(), &[0xDE, 0xAD, 0xBE, 0xEF, 0x42]);
        assert_eq!(parsed.padding_size(), 4);
        assert_eq!(
            parsed.get_extension::<TransmissionOffset>().unwrap().0,
            0x00_1234
        );
        assert_eq!(parsed.get_extension::<Mid>().unwrap().0, "a");
        assert_eq!(parsed, packet);
        // Size invariant.
        assert_eq!(wire.len(), packet.size());
        assert_eq!(packet.header_size() % 4, 0);
    }

    #[test]
    fn test_one_byte_profile_chosen_for_small_ids() {
        let mut packet = sample_packet();
        packet.set_extension(&TransportSequenceNumber(7)).unwrap();
        let wire = packet.build();
        // Profile word directly after fixed header + csrcs.
        let profile = u16::from_be_bytes([wire[20], wire[21]]);
        assert_eq!(profile, 0xBEDE);
    }

    #[test]
    fn test_two_byte_profile_chosen_for_large_ids() {
        let mut map = HeaderExtensionMap::new();
        map.register(17, ExtensionType::Mid).unwrap();
        let mut packet = RtpPacket::with_extension_map(map.clone());
        packet.set_extension(&Mid("mid-value".into())).unwrap();
        let wire = packet.build();
        let profile = u16::from_be_bytes([wire[12], wire[13]]);
        assert_eq!(profile, 0x1000);
        let parsed = RtpPacket::parse_with_map(wire.data(), map).unwrap();
        assert_eq!(parsed.get_extension::<Mid>().unwrap().0, "mid-value");
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut wire = sample_packet().build().into_vec();
        wire[0] = 0x40 | (wire[0] & 0x3F);
        assert_eq!(RtpPacket::parse(&wire), Err(Error::BadVersion));
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let wire = sample_packet().build();
        assert_eq!(RtpPacket::parse(&wire.data()[..10]), Err(Error::HeaderTooShort));
        // CSRC count says two but the buffer ends early.
        assert_eq!(RtpPacket::parse(&wire.data()[..14]), Err(Error::HeaderTooShort));
    }

    #[test]
    fn test_parse_rejects_extension_overrun() {
        let mut packet = sample_packet();
        packet.set_extension(&Mid("abcd".into())).unwrap();
        let wire = packet.build();
        let truncated = &wire.data()[..packet.header_size() - 2];
        assert_eq!(RtpPacket::parse(truncated), Err(Error::ExtensionOverrun));
    }

    #[test]
    fn test_parse_rejects_overlong_padding() {
        let mut packet = RtpPacket::new();
        packet.set_payload(&[1, 2, 3]);
        let mut wire = packet.build().into_vec();
        // Claim padding without appending any.
        wire[0] |= 0x20;
        *wire.last_mut().unwrap() = 200;
        assert_eq!(RtpPacket::parse(&wire), Err(Error::BadPadding));
    }

    #[test]
    fn test_set_payload_preserves_extensions() {
        let mut packet = sample_packet();
        packet.set_extension(&Mid("m".into())).unwrap();
        packet.set_payload(&[9, 9, 9]);
        assert_eq!(packet.get_extension::<Mid>().unwrap().0, "m");
        assert_eq!(packet.payload(), &[9, 9, 9]);
    }

    #[test]
    fn test_padding_wire_format() {
        let mut packet = RtpPacket::new();
        packet.set_payload(&[0xAA]);
        packet.set_padding(3);
        let wire = packet.build();
        assert_eq!(wire[wire.len() - 1], 3);
        assert_ne!(wire[0] & 0x20, 0);
        let parsed = RtpPacket::parse(wire.data()).unwrap();
        assert_eq!(parsed.padding_size(), 3);
        assert_eq!(parsed.payload(), &[0xAA]);
    }
}
