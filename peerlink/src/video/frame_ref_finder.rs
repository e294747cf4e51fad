//! Sequence-number-based reference finding (the H.264-without-descriptor
//! strategy): a keyframe starts a GOP, every delta frame references the
//! previous frame of its GOP.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use shared::CopyOnWriteBuffer;

use super::frame::{FrameToDecode, FrameType};
use super::frame_assembler::AssembledFrame;

const MAX_STASHED_FRAMES: usize = 100;
const MAX_GOPS: usize = 25;

pub type FrameEmitCallback = Box<dyn FnMut(FrameToDecode) + Send>;

/// Resolves frame references by sequence number. Frames whose GOP keyframe
/// has not arrived yet are stashed and retried.
pub struct SeqNumFrameRefFinder {
    /// Offset added to every picture id, preserving global ordering across
    /// stream resets.
    picture_id_offset: i64,
    /// Keyframe seq → (last covered seq, last real picture seq). Padding
    /// advances the first without touching the second.
    gops: BTreeMap<i64, (i64, i64)>,
    stashed: VecDeque<AssembledFrame>,
    emit: FrameEmitCallback,
}

impl SeqNumFrameRefFinder {
    pub fn new(picture_id_offset: i64, emit: FrameEmitCallback) -> Self {
        SeqNumFrameRefFinder {
            picture_id_offset,
            gops: BTreeMap::new(),
            stashed: VecDeque::new(),
            emit,
        }
    }

    /// Hands one assembled frame in; emits zero or more ref-resolved
    /// frames through the callback.
    pub fn insert_frame(&mut self, frame: AssembledFrame) {
        match self.try_resolve(&frame) {
            Resolution::Emit(resolved) => {
                (self.emit)(resolved);
                self.retry_stashed();
            }
            Resolution::Stash => {
                if self.stashed.len() >= MAX_STASHED_FRAMES {
                    self.stashed.pop_front();
                }
                self.stashed.push_back(frame);
            }
            Resolution::Drop => {}
        }
    }

    /// Padding consumed a sequence number inside a GOP: advance its tail
    /// so the next frame references across the hole.
    pub fn insert_padding(&mut self, seq: i64) {
        if let Some((_, (last_seq, _))) = self.gops.range_mut(..=seq).next_back() {
            if *last_seq == seq - 1 {
                *last_seq = seq;
                self.retry_stashed();
            }
        }
    }

    /// Discards bookkeeping for frames at or before `seq`.
    pub fn clear_to(&mut self, seq: i64) {
        self.stashed.retain(|frame| frame.unwrapped_last_seq > seq);
        // Keep the newest GOP even if its keyframe is old.
        while self.gops.len() > 1 {
            let Some((&first, _)) = self.gops.iter().next() else {
                break;
            };
            let newer_exists = self.gops.range(first + 1..).next().is_some();
            if first <= seq && newer_exists {
                self.gops.remove(&first);
            } else {
                break;
            }
        }
    }

    fn try_resolve(&mut self, frame: &AssembledFrame) -> Resolution {
        let seq = frame.unwrapped_last_seq;
        if frame.is_keyframe {
            self.gops.insert(seq, (seq, seq));
            while self.gops.len() > MAX_GOPS {
                let first = *self.gops.keys().next().unwrap();
                self.gops.remove(&first);
            }
            return Resolution::Emit(self.to_frame(frame, FrameType::Key, Vec::new()));
        }

        // The GOP this frame belongs to: greatest keyframe at or before it.
        let Some((&_key, &(last_seq, last_picture))) = self.gops.range(..=seq).next_back()
        else {
            debug!("stashing frame {seq}: keyframe not yet seen");
            return Resolution::Stash;
        };
        if last_seq >= seq {
            // Out of order behind the GOP tail: already superseded.
            return Resolution::Drop;
        }
        if last_seq != frame.first_seq_num_unwrapped() - 1 {
            // The previous frame has not been resolved yet.
            return Resolution::Stash;
        }

        let reference = self.picture_id_offset + last_picture;
        let entry = self.gops.range_mut(..=seq).next_back().unwrap().1;
        *entry = (seq, seq);
        Resolution::Emit(self.to_frame(frame, FrameType::Delta, vec![reference]))
    }

    fn retry_stashed(&mut self) {
        loop {
            let mut emitted = false;
            let mut index = 0;
            while index < self.stashed.len() {
                let frame = self.stashed[index].clone();
                match self.try_resolve(&frame) {
                    Resolution::Emit(resolved) => {
                        self.stashed.remove(index);
                        (self.emit)(resolved);
                        emitted = true;
                    }
                    Resolution::Drop => {
                        self.stashed.remove(index);
                    }
                    Resolution::Stash => index += 1,
                }
            }
            if !emitted {
                break;
            }
        }
    }

    fn to_frame(
        &self,
        frame: &AssembledFrame,
        frame_type: FrameType,
        references: Vec<i64>,
    ) -> FrameToDecode {
        FrameToDecode {
            id: self.picture_id_offset + frame.unwrapped_last_seq,
            frame_type,
            references,
            payload: CopyOnWriteBuffer::from_slice(&frame.payload),
            rtp_timestamp: frame.rtp_timestamp,
            first_seq_num: frame.first_seq_num,
            last_seq_num: frame.last_seq_num,
            received_time: frame.received_time,
            render_time: None,
        }
    }
}

impl AssembledFrame {
    fn first_seq_num_unwrapped(&self) -> i64 {
        self.unwrapped_last_seq - (self.last_seq_num.wrapping_sub(self.first_seq_num)) as i64
    }
}

enum Resolution {
    Emit(FrameToDecode),
    Stash,
    Drop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::units::Timestamp;
    use std::sync::{Arc, Mutex};

    fn frame(first: i64, last: i64, keyframe: bool) -> AssembledFrame {
        AssembledFrame {
            first_seq_num: first as u16,
            last_seq_num: last as u16,
            unwrapped_last_seq: last,
            rtp_timestamp: last as u32 * 3000,
            is_keyframe: keyframe,
            payload: vec![0xAA],
            received_time: Timestamp::from_millis(0),
        }
    }

    fn finder(offset: i64) -> (SeqNumFrameRefFinder, Arc<Mutex<Vec<(i64, Vec<i64>)>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let finder = SeqNumFrameRefFinder::new(
            offset,
            Box::new(move |frame| {
                sink.lock().unwrap().push((frame.id, frame.references.clone()));
            }),
        );
        (finder, emitted)
    }

    #[test]
    fn test_keyframe_has_no_references() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(0, 2, true));
        assert_eq!(*emitted.lock().unwrap(), vec![(2, vec![])]);
    }

    #[test]
    fn test_delta_references_previous_frame() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(0, 2, true));
        finder.insert_frame(frame(3, 5, false));
        finder.insert_frame(frame(6, 6, false));
        assert_eq!(
            *emitted.lock().unwrap(),
            vec![(2, vec![]), (5, vec![2]), (6, vec![5])]
        );
    }

    #[test]
    fn test_frame_before_keyframe_is_stashed() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(3, 5, false));
        assert!(emitted.lock().unwrap().is_empty());
        finder.insert_frame(frame(0, 2, true));
        assert_eq!(
            *emitted.lock().unwrap(),
            vec![(2, vec![]), (5, vec![2])]
        );
    }

    #[test]
    fn test_gap_stalls_until_filled() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(0, 0, true));
        // Frame 2..3 arrives before frame 1.
        finder.insert_frame(frame(2, 3, false));
        assert_eq!(emitted.lock().unwrap().len(), 1);
        finder.insert_frame(frame(1, 1, false));
        assert_eq!(
            *emitted.lock().unwrap(),
            vec![(0, vec![]), (1, vec![0]), (3, vec![1])]
        );
    }

    #[test]
    fn test_padding_advances_gop() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(0, 0, true));
        finder.insert_frame(frame(2, 2, false));
        assert_eq!(emitted.lock().unwrap().len(), 1);
        // Seq 1 was a padding packet: no frame will ever cover it; the
        // next frame references the last real picture.
        finder.insert_padding(1);
        assert_eq!(
            *emitted.lock().unwrap(),
            vec![(0, vec![]), (2, vec![0])]
        );
    }

    #[test]
    fn test_picture_id_offset_applied() {
        let (mut finder, emitted) = finder(10_000);
        finder.insert_frame(frame(0, 0, true));
        finder.insert_frame(frame(1, 1, false));
        assert_eq!(
            *emitted.lock().unwrap(),
            vec![(10_000, vec![]), (10_001, vec![10_000])]
        );
    }

    #[test]
    fn test_new_keyframe_starts_fresh_gop() {
        let (mut finder, emitted) = finder(0);
        finder.insert_frame(frame(0, 0, true));
        finder.insert_frame(frame(1, 1, false));
        finder.insert_frame(frame(10, 10, true));
        finder.insert_frame(frame(11, 11, false));
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted[2], (10, vec![]));
        assert_eq!(emitted[3], (11, vec![10]));
    }
}
