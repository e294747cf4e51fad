//! Jitter buffer for ref-resolved frames.
//!
//! Frames enter keyed by picture id and leave in decode order as soon as
//! every referenced frame has been released (or a keyframe supersedes the
//! wait). Release stamps the render time through [`Timing`].

use std::collections::BTreeMap;

use log::{debug, warn};

use shared::units::{TimeDelta, Timestamp};

use super::frame::FrameToDecode;
use super::timing::Timing;

const MAX_FRAMES: usize = 800;
/// A non-continuous frame this far past due gives up waiting for its
/// references.
const WAIT_FOR_REFERENCES_TIMEOUT: TimeDelta = TimeDelta::from_millis(3000);

/// Outcome of inserting one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Buffered,
    Duplicate,
    TooOld,
    /// The buffer overflowed and was flushed; ask for a keyframe.
    Overflow,
}

/// Orders ref-resolved frames for decode.
pub struct FrameBuffer {
    frames: BTreeMap<i64, FrameToDecode>,
    timing: Timing,
    last_released: Option<i64>,
}

impl FrameBuffer {
    pub fn new(timing: Timing) -> Self {
        FrameBuffer {
            frames: BTreeMap::new(),
            timing,
            last_released: None,
        }
    }

    pub fn timing_mut(&mut self) -> &mut Timing {
        &mut self.timing
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn insert_frame(&mut self, frame: FrameToDecode) -> InsertResult {
        if let Some(last) = self.last_released {
            if frame.id <= last && !frame.is_keyframe() {
                return InsertResult::TooOld;
            }
        }
        if self.frames.contains_key(&frame.id) {
            return InsertResult::Duplicate;
        }
        if self.frames.len() >= MAX_FRAMES {
            warn!("frame buffer overflow, flushing");
            self.frames.clear();
            self.last_released = None;
            return InsertResult::Overflow;
        }
        self.timing
            .incoming_timestamp(frame.rtp_timestamp, frame.received_time);
        self.frames.insert(frame.id, frame);
        InsertResult::Buffered
    }

    /// Releases the next decodable frame, if any: the lowest-id frame
    /// whose references have all been released, or a keyframe that has
    /// outwaited its predecessors.
    pub fn next_frame(&mut self, now: Timestamp) -> Option<FrameToDecode> {
        let next_id = self.find_next_decodable(now)?;
        // Everything older than the released frame is obsolete.
        let mut frame = self.frames.remove(&next_id)?;
        let stale: Vec<i64> = self
            .frames
            .range(..next_id)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            debug!("dropping stale frame {id}");
            self.frames.remove(&id);
        }
        self.last_released = Some(next_id);
        self.timing.update_current_delay();
        frame.render_time = Some(self.timing.render_time(frame.rtp_timestamp, now));
        Some(frame)
    }

    fn find_next_decodable(&self, now: Timestamp) -> Option<i64> {
        let (&first_id, first) = self.frames.iter().next()?;
        let continuous = first.references.iter().all(|reference| {
            self.last_released
                .map(|last| *reference <= last)
                .unwrap_or(false)
        });
        if continuous && (first.is_keyframe() || self.last_released.is_some()) {
            return Some(first_id);
        }
        // The head of the buffer is stuck behind a missing reference. Give
        // retransmission a chance, then jump to the next keyframe.
        if now - first.received_time < WAIT_FOR_REFERENCES_TIMEOUT {
            return None;
        }
        self.frames
            .iter()
            .find(|(_, frame)| frame.is_keyframe())
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::frame::FrameType;
    use shared::units::Timestamp;
    use shared::{Clock, SimulatedClock};
    use std::sync::Arc;

    fn timing(clock: &Arc<SimulatedClock>) -> Timing {
        Timing::new(Arc::clone(clock) as Arc<dyn Clock>)
    }

    fn frame(id: i64, references: Vec<i64>, keyframe: bool, received: Timestamp) -> FrameToDecode {
        FrameToDecode {
            id,
            frame_type: if keyframe { FrameType::Key } else { FrameType::Delta },
            references,
            payload: shared::CopyOnWriteBuffer::from_slice(&[1]),
            rtp_timestamp: id as u32 * 3000,
            first_seq_num: id as u16,
            last_seq_num: id as u16,
            received_time: received,
            render_time: None,
        }
    }

    #[test]
    fn test_frames_release_in_dependency_order() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(1000)));
        let mut buffer = FrameBuffer::new(timing(&clock));
        let now = clock.now();
        assert_eq!(
            buffer.insert_frame(frame(1, vec![0], false, now)),
            InsertResult::Buffered
        );
        // The delta frame waits for its reference.
        assert!(buffer.next_frame(now).is_none());
        buffer.insert_frame(frame(0, vec![], true, now));
        let released = buffer.next_frame(now).unwrap();
        assert_eq!(released.id, 0);
        assert!(released.render_time.is_some());
        assert_eq!(buffer.next_frame(now).unwrap().id, 1);
        assert!(buffer.next_frame(now).is_none());
    }

    #[test]
    fn test_duplicate_and_old_frames_rejected() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(1000)));
        let mut buffer = FrameBuffer::new(timing(&clock));
        let now = clock.now();
        buffer.insert_frame(frame(0, vec![], true, now));
        assert_eq!(
            buffer.insert_frame(frame(0, vec![], true, now)),
            InsertResult::Duplicate
        );
        buffer.next_frame(now);
        assert_eq!(
            buffer.insert_frame(frame(0, vec![], false, now)),
            InsertResult::TooOld
        );
    }

    #[test]
    fn test_keyframe_releases_after_timeout_despite_gap() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(1000)));
        let mut buffer = FrameBuffer::new(timing(&clock));
        let now = clock.now();
        buffer.insert_frame(frame(0, vec![], true, now));
        assert_eq!(buffer.next_frame(now).unwrap().id, 0);

        // Frames 1 lost; 2 depends on it, 5 is a fresh keyframe.
        buffer.insert_frame(frame(2, vec![1], false, now));
        buffer.insert_frame(frame(5, vec![], true, now));
        // 5 is continuous (keyframe) once nothing older is decodable...
        // but 2 blocks the order until the timeout passes.
        clock.advance(WAIT_FOR_REFERENCES_TIMEOUT);
        let released = buffer.next_frame(clock.now()).unwrap();
        assert_eq!(released.id, 5);
        // The stuck delta frame was discarded with the jump.
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_flushes() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(1000)));
        let mut buffer = FrameBuffer::new(timing(&clock));
        let now = clock.now();
        for id in 0..MAX_FRAMES as i64 {
            // References to a never-released frame keep everything queued.
            buffer.insert_frame(frame(id + 1, vec![id], false, now));
        }
        assert_eq!(
            buffer.insert_frame(frame(9999, vec![], true, now)),
            InsertResult::Overflow
        );
        assert!(buffer.is_empty());
    }
}
