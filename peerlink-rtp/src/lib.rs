#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod extension;
pub mod fec;
pub mod packet;
pub mod packetizer;
pub mod rtx;
pub mod sequencer;

pub use extension::{ExtensionType, HeaderExtensionMap};
pub use packet::{RtpPacket, RtpPacketReceived, RtpPacketToSend, RtpPacketType};
pub use sequencer::{RtpPacketSequencer, RtpState};

/// Timestamps of the video clock tick at 90 kHz.
pub const VIDEO_TIMESTAMP_TICKS_PER_MS: u32 = 90;

/// Conservative MTU-derived ceiling used when sizing payloads.
pub const MAX_IP_PACKET_SIZE: usize = 1500;
