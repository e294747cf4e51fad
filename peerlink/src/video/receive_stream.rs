//! One inbound video stream: RTX and FEC recovery, statistics, NACK
//! bookkeeping, frame assembly, reference resolution and buffering.
//!
//! The receive flow of a packet entering from the demuxer:
//! RTX unwrap → RED/ULPFEC recovery → statistics + NACK → assembler →
//! reference finder → frame buffer → frame sink.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::debug;

use rtp::fec::UlpFecReceiver;
use rtp::packetizer::h264::{NaluType, NAL_TYPE_FU_A, NAL_TYPE_STAP_A};
use rtp::RtpPacketReceived;
use shared::units::TimeDelta;
use shared::Clock;

use crate::call::nack_module::{NackModuleConfig, NackModuleImpl};
use crate::call::receive_statistics::StreamStatistician;
use crate::call::rtx_receive_stream::RtxReceiveStream;

use super::frame::FrameToDecode;
use super::frame_assembler::{AssemblyEvent, FrameAssembler};
use super::frame_buffer::{FrameBuffer, InsertResult};
use super::frame_ref_finder::SeqNumFrameRefFinder;
use super::timing::Timing;

pub type FrameSink = Box<dyn FnMut(FrameToDecode) + Send>;
pub type NackCallback = Box<dyn FnMut(Vec<u16>) + Send>;
pub type KeyFrameRequestCallback = Box<dyn FnMut() + Send>;

#[derive(Clone)]
pub struct VideoReceiveStreamConfig {
    pub media_ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    /// rtx payload type → media payload type.
    pub rtx_associated_payload_types: BTreeMap<u8, u8>,
    pub red_payload_type: Option<u8>,
    pub ulpfec_payload_type: Option<u8>,
    pub nack: NackModuleConfig,
    /// Picture-id offset for this stream epoch.
    pub picture_id_offset: i64,
}

impl Default for VideoReceiveStreamConfig {
    fn default() -> Self {
        VideoReceiveStreamConfig {
            media_ssrc: 0,
            rtx_ssrc: None,
            rtx_associated_payload_types: BTreeMap::new(),
            red_payload_type: None,
            ulpfec_payload_type: None,
            nack: NackModuleConfig::default(),
            picture_id_offset: 0,
        }
    }
}

/// The receive pipeline of one video SSRC (plus its repair streams).
pub struct VideoReceiveStream {
    config: VideoReceiveStreamConfig,
    statistician: StreamStatistician,
    rtx_stream: Option<RtxReceiveStream>,
    fec_receiver: Option<UlpFecReceiver>,
    nack: NackModuleImpl,
    assembler: FrameAssembler,
    ref_finder: SeqNumFrameRefFinder,
    /// Frames resolved by the ref finder, pending buffer insertion.
    resolved: Arc<Mutex<Vec<FrameToDecode>>>,
    frame_buffer: FrameBuffer,
    clock: Arc<dyn Clock>,

    frame_sink: Option<FrameSink>,
    nack_callback: Option<NackCallback>,
    keyframe_request_callback: Option<KeyFrameRequestCallback>,
}

impl VideoReceiveStream {
    pub fn new(config: VideoReceiveStreamConfig, clock: Arc<dyn Clock>) -> Self {
        let rtx_stream = config.rtx_ssrc.map(|_| {
            RtxReceiveStream::new(
                config.media_ssrc,
                config.rtx_associated_payload_types.clone(),
            )
        });
        let fec_receiver = config
            .ulpfec_payload_type
            .map(|_| UlpFecReceiver::new(config.media_ssrc, Arc::clone(&clock)));

        let resolved = Arc::new(Mutex::new(Vec::new()));
        let resolved_sink = Arc::clone(&resolved);
        let ref_finder = SeqNumFrameRefFinder::new(
            config.picture_id_offset,
            Box::new(move |frame| resolved_sink.lock().unwrap().push(frame)),
        );

        VideoReceiveStream {
            statistician: StreamStatistician::new(config.media_ssrc, Arc::clone(&clock)),
            nack: NackModuleImpl::new(Arc::clone(&clock), config.nack),
            assembler: FrameAssembler::new(),
            ref_finder,
            resolved,
            frame_buffer: FrameBuffer::new(Timing::new(Arc::clone(&clock))),
            clock,
            rtx_stream,
            fec_receiver,
            config,
            frame_sink: None,
            nack_callback: None,
            keyframe_request_callback: None,
        }
    }

    pub fn on_frame(&mut self, sink: FrameSink) {
        self.frame_sink = Some(sink);
    }

    pub fn on_nack(&mut self, callback: NackCallback) {
        self.nack_callback = Some(callback);
    }

    pub fn on_keyframe_request(&mut self, callback: KeyFrameRequestCallback) {
        self.keyframe_request_callback = Some(callback);
    }

    pub fn media_ssrc(&self) -> u32 {
        self.config.media_ssrc
    }

    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.config.rtx_ssrc
    }

    pub fn statistician(&mut self) -> &mut StreamStatistician {
        &mut self.statistician
    }

    pub fn update_rtt(&mut self, rtt: TimeDelta) {
        self.nack.update_rtt(rtt);
    }

    /// Entry point from the demuxer: media, RTX or RED packets.
    pub fn on_rtp_packet(&mut self, packet: RtpPacketReceived) {
        if Some(packet.ssrc()) == self.config.rtx_ssrc {
            let recovered = self
                .rtx_stream
                .as_mut()
                .and_then(|stream| stream.on_rtx_packet(packet));
            if let Some(media_packet) = recovered {
                self.process_media_packet(media_packet);
            }
            return;
        }
        self.process_media_packet(packet);
    }

    /// Drives the NACK module's time filter; call roughly every 20 ms.
    pub fn periodic_update(&mut self) {
        let batch = self.nack.periodic_update();
        if !batch.is_empty() {
            if let Some(callback) = self.nack_callback.as_mut() {
                callback(batch);
            }
        }
    }

    fn process_media_packet(&mut self, packet: RtpPacketReceived) {
        if Some(packet.payload_type()) == self.config.red_payload_type {
            let ulpfec_payload_type = self.config.ulpfec_payload_type.unwrap_or(0);
            let is_fec = packet.payload().first().map(|b| b & 0x7F) == Some(ulpfec_payload_type);
            let unwrapped = match self.fec_receiver.as_mut() {
                Some(receiver) => match receiver.on_red_packet(&packet, ulpfec_payload_type) {
                    Ok(packets) => packets,
                    Err(e) => {
                        debug!("red packet dropped: {e}");
                        return;
                    }
                },
                None => {
                    debug!("red payload type without fec receiver, dropping");
                    return;
                }
            };
            for media_packet in unwrapped {
                self.process_plain_packet(media_packet);
            }
            if is_fec {
                // The protection packet consumed a media-SSRC sequence
                // number; assembly continues across it.
                let events = self
                    .assembler
                    .insert_consumed(packet.sequence_number(), packet.arrival_time);
                self.handle_assembly_events(events);
            }
            return;
        }
        self.process_plain_packet(packet);
    }

    fn handle_assembly_events(&mut self, events: Vec<AssemblyEvent>) {
        for event in events {
            match event {
                AssemblyEvent::Frame(frame) => self.ref_finder.insert_frame(frame),
                AssemblyEvent::Padding(seq) => self.ref_finder.insert_padding(seq),
            }
        }
        let resolved: Vec<FrameToDecode> = self.resolved.lock().unwrap().drain(..).collect();
        for frame in resolved {
            if self.frame_buffer.insert_frame(frame) == InsertResult::Overflow {
                if let Some(callback) = self.keyframe_request_callback.as_mut() {
                    callback();
                }
            }
        }
        self.release_frames();
    }

    fn process_plain_packet(&mut self, packet: RtpPacketReceived) {
        self.statistician.insert_packet(&packet);

        let is_keyframe = is_keyframe_payload(packet.payload());
        let insert = self
            .nack
            .insert_packet(packet.sequence_number(), is_keyframe, packet.is_recovered);
        if !insert.nack_list_to_send.is_empty() {
            if let Some(callback) = self.nack_callback.as_mut() {
                callback(insert.nack_list_to_send);
            }
        }
        if insert.keyframe_requested {
            if let Some(callback) = self.keyframe_request_callback.as_mut() {
                callback();
            }
        }

        let events = self.assembler.insert(&packet);
        self.handle_assembly_events(events);
    }

    fn release_frames(&mut self) {
        let now = self.clock.now();
        while let Some(frame) = self.frame_buffer.next_frame(now) {
            self.nack.clear_up_to(frame.last_seq_num);
            self.assembler.clear_to(frame.last_seq_num);
            if let Some(sink) = self.frame_sink.as_mut() {
                sink(frame);
            }
        }
    }
}

/// Keyframe heuristics straight off the RTP payload: IDR or SPS NALUs,
/// directly, inside a STAP-A or opening a FU-A.
fn is_keyframe_payload(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    match first & 0x1F {
        5 | 7 => true,
        t if t == NAL_TYPE_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                offset += 2;
                if offset >= payload.len() {
                    break;
                }
                match NaluType::from(payload[offset]) {
                    NaluType::CodedSliceIdr | NaluType::Sps => return true,
                    _ => {}
                }
                offset += size;
            }
            false
        }
        t if t == NAL_TYPE_FU_A => {
            payload.len() > 1
                && payload[1] & 0x80 != 0
                && matches!(NaluType::from(payload[1]), NaluType::CodedSliceIdr)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::fec::{red_wrap, FecProtectionParams, UlpFecGenerator};
    use rtp::packetizer::h264::{H264Packetizer, PacketizationMode};
    use rtp::packetizer::PayloadSizeLimits;
    use rtp::rtx::build_rtx_packet;
    use rtp::RtpPacket;
    use shared::units::Timestamp;
    use shared::SimulatedClock;

    const MEDIA_SSRC: u32 = 0x11AA;
    const RTX_SSRC: u32 = 0x22BB;
    const MEDIA_PT: u8 = 102;
    const RTX_PT: u8 = 99;
    const RED_PT: u8 = 116;
    const ULPFEC_PT: u8 = 117;

    struct Harness {
        clock: Arc<SimulatedClock>,
        stream: VideoReceiveStream,
        frames: Arc<Mutex<Vec<(i64, bool)>>>,
        nacks: Arc<Mutex<Vec<Vec<u16>>>>,
    }

    fn harness(red: bool) -> Harness {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(100_000)));
        let config = VideoReceiveStreamConfig {
            media_ssrc: MEDIA_SSRC,
            rtx_ssrc: Some(RTX_SSRC),
            rtx_associated_payload_types: BTreeMap::from([(RTX_PT, MEDIA_PT)]),
            red_payload_type: red.then_some(RED_PT),
            ulpfec_payload_type: red.then_some(ULPFEC_PT),
            ..Default::default()
        };
        let mut stream =
            VideoReceiveStream::new(config, Arc::clone(&clock) as Arc<dyn Clock>);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let frame_sink = Arc::clone(&frames);
        stream.on_frame(Box::new(move |frame| {
            frame_sink
                .lock()
                .unwrap()
                .push((frame.id, frame.is_keyframe()));
        }));
        let nacks = Arc::new(Mutex::new(Vec::new()));
        let nack_sink = Arc::clone(&nacks);
        stream.on_nack(Box::new(move |seqs| {
            nack_sink.lock().unwrap().push(seqs);
        }));
        Harness {
            clock,
            stream,
            frames,
            nacks,
        }
    }

    fn packetize_frame(
        keyframe: bool,
        start_seq: u16,
        timestamp: u32,
        arrival: Timestamp,
    ) -> Vec<RtpPacketReceived> {
        let mut bitstream = vec![0, 0, 0, 1];
        bitstream.push(if keyframe { 0x65 } else { 0x41 });
        bitstream.extend([7u8; 40]);
        let mut packetizer = H264Packetizer::new(
            &bitstream,
            PayloadSizeLimits::default(),
            PacketizationMode::NonInterleaved,
        )
        .unwrap();
        let mut packets = Vec::new();
        let mut seq = start_seq;
        loop {
            let mut packet = RtpPacket::new();
            if !packetizer.next_packet(&mut packet) {
                break;
            }
            packet.set_ssrc(MEDIA_SSRC);
            packet.set_payload_type(MEDIA_PT);
            packet.set_sequence_number(seq);
            packet.set_timestamp(timestamp);
            seq = seq.wrapping_add(1);
            packets.push(RtpPacketReceived::new(packet, arrival));
        }
        packets
    }

    #[test]
    fn test_frames_flow_through_pipeline() {
        let mut harness = harness(false);
        let arrival = harness.clock.now();
        for packet in packetize_frame(true, 0, 90_000, arrival) {
            harness.stream.on_rtp_packet(packet);
        }
        for packet in packetize_frame(false, 1, 93_000, arrival) {
            harness.stream.on_rtp_packet(packet);
        }
        assert_eq!(*harness.frames.lock().unwrap(), vec![(0, true), (1, false)]);
    }

    #[test]
    fn test_loss_triggers_nack_and_rtx_recovers() {
        let mut harness = harness(false);
        let arrival = harness.clock.now();
        let first = packetize_frame(true, 0, 90_000, arrival);
        let second = packetize_frame(false, 1, 93_000, arrival);
        let third = packetize_frame(false, 2, 96_000, arrival);

        harness.stream.on_rtp_packet(first[0].clone());
        // Frame at seq 1 lost; seq 2 arrives.
        harness.stream.on_rtp_packet(third[0].clone());
        assert_eq!(*harness.nacks.lock().unwrap(), vec![vec![1]]);
        assert_eq!(harness.frames.lock().unwrap().len(), 1);

        // The peer answers with an RTX retransmission of seq 1.
        let rtx = build_rtx_packet(&second[0].packet, RTX_SSRC, RTX_PT);
        harness
            .stream
            .on_rtp_packet(RtpPacketReceived::new(rtx.packet, arrival));
        assert_eq!(
            *harness.frames.lock().unwrap(),
            vec![(0, true), (1, false), (2, false)]
        );
    }

    #[test]
    fn test_fec_recovery_feeds_pipeline() {
        let mut harness = harness(true);
        let arrival = harness.clock.now();
        let mut generator = UlpFecGenerator::new(
            RED_PT,
            ULPFEC_PT,
            FecProtectionParams {
                fec_rate: 51,
                max_fec_frames: 2,
            },
        );

        // Two single-packet frames protected by one FEC packet.
        let first = packetize_frame(true, 0, 90_000, arrival);
        let second = packetize_frame(false, 1, 93_000, arrival);
        let red_first = generator.protect_media_packet(&first[0].packet);
        let red_second = generator.protect_media_packet(&second[0].packet);
        let mut fec = generator.poll_fec_packets();
        assert_eq!(fec.len(), 1);
        let mut fec_packet = fec.remove(0);
        fec_packet.packet.set_sequence_number(2);

        harness
            .stream
            .on_rtp_packet(RtpPacketReceived::new(red_first, arrival));
        // Second media packet lost: only the FEC packet arrives.
        drop(red_second);
        harness
            .stream
            .on_rtp_packet(RtpPacketReceived::new(fec_packet.packet, arrival));

        assert_eq!(
            *harness.frames.lock().unwrap(),
            vec![(0, true), (1, false)]
        );
    }

    #[test]
    fn test_periodic_update_renacks() {
        let mut harness = harness(false);
        let arrival = harness.clock.now();
        harness.stream.update_rtt(TimeDelta::from_millis(50));
        let first = packetize_frame(true, 100, 90_000, arrival);
        let third = packetize_frame(false, 103, 96_000, arrival);
        harness.stream.on_rtp_packet(first[0].clone());
        harness.stream.on_rtp_packet(third[0].clone());
        assert_eq!(harness.nacks.lock().unwrap().len(), 1);

        harness.clock.advance_ms(50);
        harness.stream.periodic_update();
        let nacks = harness.nacks.lock().unwrap();
        assert_eq!(nacks.len(), 2);
        assert_eq!(nacks[1], vec![101, 102]);
    }

    #[test]
    fn test_keyframe_payload_detection() {
        assert!(is_keyframe_payload(&[0x65, 1, 2]));
        assert!(is_keyframe_payload(&[0x67, 1, 2]));
        assert!(!is_keyframe_payload(&[0x41, 1, 2]));
        // STAP-A wrapping SPS.
        assert!(is_keyframe_payload(&[0x78, 0, 2, 0x67, 0xAA]));
        // FU-A start of an IDR.
        assert!(is_keyframe_payload(&[0x7C, 0x85, 1]));
        // FU-A continuation is not a keyframe marker.
        assert!(!is_keyframe_payload(&[0x7C, 0x05, 1]));
        assert!(!is_keyframe_payload(&[]));
    }
}
