//! Per-call RTP/RTCP machinery: demultiplexing, send egress, receive
//! statistics, NACK generation and the RTCP sender/receiver pair.

pub mod nack_module;
pub mod receive_statistics;
pub mod rtcp_receiver;
pub mod rtcp_sender;
pub mod rtp_demuxer;
pub mod rtp_egress;
pub mod rtx_receive_stream;

pub use nack_module::{NackModule, NackModuleConfig, NackModuleImpl};
pub use receive_statistics::{ReceiveStatistics, StreamStatistician};
pub use rtcp_receiver::{RtcpObserver, RtcpReceiver};
pub use rtcp_sender::{RtcpMode, RtcpSendReason, RtcpSender, RtcpSenderConfig};
pub use rtp_demuxer::{RtcpSink, RtpDemuxer, RtpPacketSink};
pub use rtp_egress::RtpPacketEgresser;
pub use rtx_receive_stream::RtxReceiveStream;
