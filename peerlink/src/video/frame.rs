//! Assembled encoded frames flowing towards the decoder.

use shared::units::Timestamp;
use shared::CopyOnWriteBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
}

/// A fully assembled encoded frame with resolved references, ready for the
/// frame buffer.
#[derive(Debug, Clone)]
pub struct FrameToDecode {
    /// Globally ordered picture id (sequence-number derived, offset per
    /// stream epoch).
    pub id: i64,
    pub frame_type: FrameType,
    /// Picture ids this frame depends on (empty for keyframes).
    pub references: Vec<i64>,
    /// Annex B bitstream.
    pub payload: CopyOnWriteBuffer,
    pub rtp_timestamp: u32,
    pub first_seq_num: u16,
    pub last_seq_num: u16,
    pub received_time: Timestamp,
    /// Filled in by the frame buffer on release.
    pub render_time: Option<Timestamp>,
}

impl FrameToDecode {
    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}
