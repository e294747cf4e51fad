//! RTP header-extension registry and typed accessors (RFC 5285).

use shared::error::{Error, Result};

/// Known header-extension types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    TransmissionOffset,
    AbsoluteSendTime,
    AbsoluteCaptureTime,
    TransportSequenceNumber,
    PlayoutDelay,
    Mid,
    RtpStreamId,
    RepairedRtpStreamId,
}

impl ExtensionType {
    pub fn uri(&self) -> &'static str {
        match self {
            ExtensionType::TransmissionOffset => "urn:ietf:params:rtp-hdrext:toffset",
            ExtensionType::AbsoluteSendTime => {
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time"
            }
            ExtensionType::AbsoluteCaptureTime => {
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-capture-time"
            }
            ExtensionType::TransportSequenceNumber => {
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
            }
            ExtensionType::PlayoutDelay => {
                "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay"
            }
            ExtensionType::Mid => "urn:ietf:params:rtp-hdrext:sdes:mid",
            ExtensionType::RtpStreamId => "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            ExtensionType::RepairedRtpStreamId => {
                "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Option<ExtensionType> {
        const ALL: [ExtensionType; 8] = [
            ExtensionType::TransmissionOffset,
            ExtensionType::AbsoluteSendTime,
            ExtensionType::AbsoluteCaptureTime,
            ExtensionType::TransportSequenceNumber,
            ExtensionType::PlayoutDelay,
            ExtensionType::Mid,
            ExtensionType::RtpStreamId,
            ExtensionType::RepairedRtpStreamId,
        ];
        ALL.into_iter().find(|t| t.uri() == uri)
    }
}

/// Largest id usable with the one-byte extension profile.
pub const MAX_ONE_BYTE_ID: u8 = 14;
/// Largest id usable with the two-byte extension profile.
pub const MAX_TWO_BYTE_ID: u8 = 255;

/// Registry binding local extension ids to extension types.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderExtensionMap {
    entries: Vec<(u8, ExtensionType)>,
}

impl HeaderExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to `extension_type`. Re-registering either side replaces
    /// the previous binding.
    pub fn register(&mut self, id: u8, extension_type: ExtensionType) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidExtensionId(id));
        }
        self.entries
            .retain(|(eid, etype)| *eid != id && *etype != extension_type);
        self.entries.push((id, extension_type));
        Ok(())
    }

    pub fn register_by_uri(&mut self, id: u8, uri: &str) -> Result<()> {
        match ExtensionType::from_uri(uri) {
            Some(extension_type) => self.register(id, extension_type),
            None => Err(Error::ExtensionNotRegistered),
        }
    }

    pub fn id_of(&self, extension_type: ExtensionType) -> Option<u8> {
        self.entries
            .iter()
            .find(|(_, etype)| *etype == extension_type)
            .map(|(id, _)| *id)
    }

    pub fn type_of(&self, id: u8) -> Option<ExtensionType> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, etype)| *etype)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One-byte header profile applies when every registered id fits it.
    pub fn one_byte_capable(&self) -> bool {
        self.entries.iter().all(|(id, _)| *id <= MAX_ONE_BYTE_ID)
    }
}

/// A typed header extension with a fixed wire encoding.
pub trait Extension: Sized {
    const TYPE: ExtensionType;

    fn encode(&self) -> Vec<u8>;
    fn decode(data: &[u8]) -> Result<Self>;
}

/// `urn:ietf:params:rtp-hdrext:toffset`, signed 24-bit tick offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionOffset(pub i32);

impl Extension for TransmissionOffset {
    const TYPE: ExtensionType = ExtensionType::TransmissionOffset;

    fn encode(&self) -> Vec<u8> {
        let v = self.0 as u32;
        vec![(v >> 16) as u8, (v >> 8) as u8, v as u8]
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 3 {
            return Err(Error::BufferTooShort);
        }
        let raw = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
        // Sign-extend from 24 bits.
        let value = ((raw << 8) as i32) >> 8;
        Ok(TransmissionOffset(value))
    }
}

/// `abs-send-time`: 6.18 fixed-point seconds, 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsoluteSendTime(pub u32);

impl AbsoluteSendTime {
    pub fn from_micros(us: i64) -> Self {
        // 18-bit fractional seconds, wrapped into 24 bits.
        AbsoluteSendTime((((us << 18) / 1_000_000) & 0x00FF_FFFF) as u32)
    }
}

impl Extension for AbsoluteSendTime {
    const TYPE: ExtensionType = ExtensionType::AbsoluteSendTime;

    fn encode(&self) -> Vec<u8> {
        vec![(self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8]
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 3 {
            return Err(Error::BufferTooShort);
        }
        Ok(AbsoluteSendTime(
            ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32,
        ))
    }
}

/// `abs-capture-time`: NTP capture timestamp plus optional clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsoluteCaptureTime {
    pub absolute_capture_timestamp: u64,
    pub estimated_capture_clock_offset: Option<i64>,
}

impl Extension for AbsoluteCaptureTime {
    const TYPE: ExtensionType = ExtensionType::AbsoluteCaptureTime;

    fn encode(&self) -> Vec<u8> {
        let mut out = self.absolute_capture_timestamp.to_be_bytes().to_vec();
        if let Some(offset) = self.estimated_capture_clock_offset {
            out.extend_from_slice(&offset.to_be_bytes());
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        match data.len() {
            8 => Ok(AbsoluteCaptureTime {
                absolute_capture_timestamp: u64::from_be_bytes(data[..8].try_into().unwrap()),
                estimated_capture_clock_offset: None,
            }),
            16 => Ok(AbsoluteCaptureTime {
                absolute_capture_timestamp: u64::from_be_bytes(data[..8].try_into().unwrap()),
                estimated_capture_clock_offset: Some(i64::from_be_bytes(
                    data[8..16].try_into().unwrap(),
                )),
            }),
            _ => Err(Error::BufferTooShort),
        }
    }
}

/// Transport-wide sequence number, 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSequenceNumber(pub u16);

impl Extension for TransportSequenceNumber {
    const TYPE: ExtensionType = ExtensionType::TransportSequenceNumber;

    fn encode(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 2 {
            return Err(Error::BufferTooShort);
        }
        Ok(TransportSequenceNumber(u16::from_be_bytes(
            data.try_into().unwrap(),
        )))
    }
}

/// Playout delay limits in 10 ms steps, two 12-bit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutDelay {
    pub min_ms: u16,
    pub max_ms: u16,
}

impl Extension for PlayoutDelay {
    const TYPE: ExtensionType = ExtensionType::PlayoutDelay;

    fn encode(&self) -> Vec<u8> {
        let min = (self.min_ms / 10) & 0x0FFF;
        let max = (self.max_ms / 10) & 0x0FFF;
        vec![(min >> 4) as u8, ((min << 4) as u8) | (max >> 8) as u8, max as u8]
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 3 {
            return Err(Error::BufferTooShort);
        }
        let min = ((data[0] as u16) << 4) | (data[1] as u16 >> 4);
        let max = (((data[1] & 0x0F) as u16) << 8) | data[2] as u16;
        Ok(PlayoutDelay {
            min_ms: min * 10,
            max_ms: max * 10,
        })
    }
}

macro_rules! string_extension {
    ($name:ident, $etype:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub String);

        impl Extension for $name {
            const TYPE: ExtensionType = $etype;

            fn encode(&self) -> Vec<u8> {
                self.0.as_bytes().to_vec()
            }

            fn decode(data: &[u8]) -> Result<Self> {
                let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                String::from_utf8(data[..end].to_vec())
                    .map($name)
                    .map_err(|_| Error::BufferTooShort)
            }
        }
    };
}

string_extension!(Mid, ExtensionType::Mid);
string_extension!(RtpStreamId, ExtensionType::RtpStreamId);
string_extension!(RepairedRtpStreamId, ExtensionType::RepairedRtpStreamId);
