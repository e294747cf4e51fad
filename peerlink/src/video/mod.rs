//! Receive-side video pipeline: frame assembly, reference resolution,
//! buffering and render timing.

pub mod frame;
pub mod frame_assembler;
pub mod frame_buffer;
pub mod frame_ref_finder;
pub mod receive_stream;
pub mod timestamp_extrapolator;
pub mod timing;

pub use frame::{FrameToDecode, FrameType};
pub use frame_assembler::{AssembledFrame, AssemblyEvent, FrameAssembler};
pub use frame_buffer::FrameBuffer;
pub use frame_ref_finder::SeqNumFrameRefFinder;
pub use receive_stream::{VideoReceiveStream, VideoReceiveStreamConfig};
pub use timestamp_extrapolator::TimestampExtrapolator;
pub use timing::Timing;
