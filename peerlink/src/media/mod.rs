//! Media tracks and their send-side streams.

pub mod send_stream;
pub mod track;

pub use send_stream::VideoSendStream;
pub use track::{Codec, MediaKind, MediaTrack, MediaTrackConfiguration};
