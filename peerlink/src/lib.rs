#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod call;
pub mod data_channel;
pub mod media;
pub mod peer_connection;
pub mod transport;
pub mod video;

#[cfg(test)]
pub(crate) mod test_support;

pub use data_channel::{DataChannel, DataChannelInit, Reliability, ReliabilityPolicy};
pub use media::track::{MediaKind, MediaTrack, MediaTrackConfiguration};
pub use peer_connection::{PeerConnection, RtcConfiguration};
pub use transport::{Transport, TransportState};
