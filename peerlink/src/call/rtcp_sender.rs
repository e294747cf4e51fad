//! RTCP send side: compound composition per reason and report scheduling.

use std::sync::{Arc, Mutex};

use log::warn;
use rand::Rng;

use rtcp::fir::Fir;
use rtcp::nack::Nack;
use rtcp::pli::Pli;
use rtcp::receiver_report::ReceiverReport;
use rtcp::remb::Remb;
use rtcp::report_block::ReportBlock;
use rtcp::sdes::Sdes;
use rtcp::sender_report::SenderReport;
use rtcp::{CompoundPacket, RtcpPacket};
use shared::units::{NtpTime, TimeDelta, Timestamp};
use shared::{Clock, TaskQueue};

/// Operating mode of the RTCP machinery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMode {
    Off,
    #[default]
    Compound,
    ReducedSize,
}

/// What triggered an RTCP send.
#[derive(Debug, Clone)]
pub enum RtcpSendReason {
    Report,
    Nack(Vec<u16>),
    Pli,
    Fir,
    Remb,
}

pub const VIDEO_REPORT_INTERVAL: TimeDelta = TimeDelta::from_millis(1000);
pub const AUDIO_REPORT_INTERVAL: TimeDelta = TimeDelta::from_millis(5000);
const DEFAULT_MAX_PACKET_SIZE: usize = 1200;
const MAX_REPORT_BLOCKS: usize = 31;

#[derive(Debug, Clone)]
pub struct RtcpSenderConfig {
    pub local_ssrc: u32,
    pub remote_ssrc: u32,
    pub cname: String,
    pub audio: bool,
    pub mode: RtcpMode,
    pub max_packet_size: usize,
    pub report_interval: Option<TimeDelta>,
}

impl Default for RtcpSenderConfig {
    fn default() -> Self {
        RtcpSenderConfig {
            local_ssrc: 0,
            remote_ssrc: 0,
            cname: "peerlink".to_string(),
            audio: false,
            mode: RtcpMode::Compound,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            report_interval: None,
        }
    }
}

pub type ReportBlockProvider = Box<dyn FnMut(usize) -> Vec<ReportBlock> + Send>;
pub type RtcpSendCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Builds and emits RTCP compounds for one stream.
pub struct RtcpSender {
    clock: Arc<dyn Clock>,
    config: RtcpSenderConfig,
    report_interval: TimeDelta,
    send_callback: RtcpSendCallback,
    report_block_provider: Option<ReportBlockProvider>,

    // Send-side feedback state.
    sending: bool,
    packets_sent: u32,
    media_bytes_sent: u32,
    last_rtp_timestamp: u32,

    // Echo state for LSR/DLSR, fed by the receiver half.
    remote_sr_ntp: Option<NtpTime>,
    remote_sr_arrival: Option<Timestamp>,

    remb_bps: Option<u64>,
    remb_ssrcs: Vec<u32>,
    fir_seq: u8,
    next_time_to_send: Option<Timestamp>,
}

impl RtcpSender {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: RtcpSenderConfig,
        send_callback: RtcpSendCallback,
    ) -> Self {
        let report_interval = config.report_interval.unwrap_or(if config.audio {
            AUDIO_REPORT_INTERVAL
        } else {
            VIDEO_REPORT_INTERVAL
        });
        RtcpSender {
            clock,
            config,
            report_interval,
            send_callback,
            report_block_provider: None,
            sending: false,
            packets_sent: 0,
            media_bytes_sent: 0,
            last_rtp_timestamp: 0,
            remote_sr_ntp: None,
            remote_sr_arrival: None,
            remb_bps: None,
            remb_ssrcs: Vec::new(),
            fir_seq: 0,
            next_time_to_send: None,
        }
    }

    pub fn set_report_block_provider(&mut self, provider: ReportBlockProvider) {
        self.report_block_provider = Some(provider);
    }

    /// Marks whether we are actively sending media (SR vs RR).
    pub fn set_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    pub fn on_media_sent(&mut self, packets: u32, bytes: u32, rtp_timestamp: u32) {
        self.packets_sent += packets;
        self.media_bytes_sent += bytes;
        self.last_rtp_timestamp = rtp_timestamp;
        self.sending = true;
    }

    /// Fed by the receiver half whenever a remote SR arrives.
    pub fn on_remote_sender_report(&mut self, ntp: NtpTime, arrival: Timestamp) {
        self.remote_sr_ntp = Some(ntp);
        self.remote_sr_arrival = Some(arrival);
    }

    pub fn set_remb(&mut self, bitrate_bps: u64, ssrcs: Vec<u32>) {
        self.remb_bps = Some(bitrate_bps);
        self.remb_ssrcs = ssrcs;
    }

    pub fn clear_remb(&mut self) {
        self.remb_bps = None;
        self.remb_ssrcs.clear();
    }

    pub fn report_interval(&self) -> TimeDelta {
        self.report_interval
    }

    /// Whether the next evaluation tick is due.
    pub fn time_to_send_rtcp_report(&self, now: Timestamp) -> bool {
        match self.next_time_to_send {
            // First report fires at half the interval.
            None => true,
            Some(next) => now >= next,
        }
    }

    /// Delay until the next evaluation: jittered `0.5..1.5` of the
    /// interval, halved for the very first report.
    pub fn next_schedule_delay(&self) -> TimeDelta {
        if self.next_time_to_send.is_none() {
            return self.report_interval / 2;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.report_interval * jitter
    }

    /// Composes and emits the compound for `reason`.
    pub fn send_rtcp(&mut self, reason: RtcpSendReason) {
        if self.config.mode == RtcpMode::Off {
            return;
        }
        let now = self.clock.now();
        let mut compound = CompoundPacket::new();

        let reduced = self.config.mode == RtcpMode::ReducedSize;
        let feedback_only = !matches!(reason, RtcpSendReason::Report);
        if !(reduced && feedback_only) {
            self.append_report(&mut compound, now);
            let mut sdes = Sdes::default();
            if sdes
                .add_cname(self.config.local_ssrc, &self.config.cname)
                .is_ok()
            {
                compound.append(RtcpPacket::Sdes(sdes));
            }
        }

        match reason {
            RtcpSendReason::Report => {
                if let Some(bitrate) = self.remb_bps {
                    compound.append(RtcpPacket::Remb(Remb::new(
                        self.config.local_ssrc,
                        bitrate,
                        self.remb_ssrcs.clone(),
                    )));
                }
                self.next_time_to_send = Some(now + self.report_interval);
            }
            RtcpSendReason::Nack(seqs) => {
                compound.append(RtcpPacket::Nack(Nack::with_sequence_numbers(
                    self.config.local_ssrc,
                    self.config.remote_ssrc,
                    &seqs,
                )));
            }
            RtcpSendReason::Pli => {
                compound.append(RtcpPacket::Pli(Pli::new(
                    self.config.local_ssrc,
                    self.config.remote_ssrc,
                )));
            }
            RtcpSendReason::Fir => {
                self.fir_seq = self.fir_seq.wrapping_add(1);
                compound.append(RtcpPacket::Fir(Fir::new(
                    self.config.local_ssrc,
                    self.config.remote_ssrc,
                    self.fir_seq,
                )));
            }
            RtcpSendReason::Remb => {
                if let Some(bitrate) = self.remb_bps {
                    compound.append(RtcpPacket::Remb(Remb::new(
                        self.config.local_ssrc,
                        bitrate,
                        self.remb_ssrcs.clone(),
                    )));
                }
            }
        }

        if compound.is_empty() {
            return;
        }
        let callback = &mut self.send_callback;
        compound.pack(self.config.max_packet_size, &mut |buffer| {
            callback(buffer);
        });
    }

    fn append_report(&mut self, compound: &mut CompoundPacket, now: Timestamp) {
        let blocks = self.collect_report_blocks(now);
        if self.sending {
            let mut report = SenderReport {
                sender_ssrc: self.config.local_ssrc,
                ntp_timestamp: NtpTime::from_timestamp(now),
                rtp_timestamp: self.last_rtp_timestamp,
                sender_packet_count: self.packets_sent,
                sender_octet_count: self.media_bytes_sent,
                report_blocks: Vec::new(),
            };
            for block in blocks {
                if report.add_report_block(block).is_err() {
                    break;
                }
            }
            compound.append(RtcpPacket::SenderReport(report));
        } else {
            let mut report = ReceiverReport::new(self.config.local_ssrc);
            for block in blocks {
                if report.add_report_block(block).is_err() {
                    break;
                }
            }
            compound.append(RtcpPacket::ReceiverReport(report));
        }
    }

    /// Pulls fresh report blocks and stamps the LSR/DLSR echo fields.
    fn collect_report_blocks(&mut self, now: Timestamp) -> Vec<ReportBlock> {
        let mut blocks = match self.report_block_provider.as_mut() {
            Some(provider) => provider(MAX_REPORT_BLOCKS),
            None => Vec::new(),
        };
        if let (Some(ntp), Some(arrival)) = (self.remote_sr_ntp, self.remote_sr_arrival) {
            let delay = now - arrival;
            let dlsr = ((delay.us().max(0) as u64 * 65_536) / 1_000_000) as u32;
            for block in &mut blocks {
                block.set_last_sr_ntp_timestamp(ntp.compact());
                block.set_delay_since_last_sr(dlsr);
            }
        }
        blocks
    }
}

/// Drives [`RtcpSender::send_rtcp`] on its queue with the jittered report
/// cadence; early wake-ups re-post for the remainder.
pub struct RtcpScheduler {
    sender: Arc<Mutex<RtcpSender>>,
    queue: TaskQueue,
    clock: Arc<dyn Clock>,
}

impl RtcpScheduler {
    pub fn start(
        sender: Arc<Mutex<RtcpSender>>,
        queue: TaskQueue,
        clock: Arc<dyn Clock>,
    ) -> Arc<RtcpScheduler> {
        let scheduler = Arc::new(RtcpScheduler {
            sender,
            queue,
            clock,
        });
        let delay = scheduler.sender.lock().unwrap().next_schedule_delay();
        scheduler.schedule(delay);
        scheduler
    }

    fn schedule(self: &Arc<Self>, delay: TimeDelta) {
        let this = Arc::clone(self);
        let execution_time = self.clock.now() + delay;
        self.queue.post_delayed(delay, move || {
            this.maybe_send_at_or_after(execution_time);
        });
    }

    fn maybe_send_at_or_after(self: &Arc<Self>, execution_time: Timestamp) {
        let now = self.clock.now();
        if now < execution_time {
            // The queue woke us early: re-post for the remainder.
            warn!("rtcp scheduler woke early, re-posting");
            self.schedule(execution_time - now);
            return;
        }
        let delay = {
            let mut sender = self.sender.lock().unwrap();
            if sender.time_to_send_rtcp_report(now) {
                sender.send_rtcp(RtcpSendReason::Report);
            }
            sender.next_schedule_delay()
        };
        self.schedule(delay);
    }
}
