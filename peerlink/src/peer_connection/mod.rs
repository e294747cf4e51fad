//! The connection façade: wires the transport chain, negotiates via SDP
//! and owns the per-track media machinery.

pub mod configuration;

pub use configuration::{IceServer, IceServerKind, RtcConfiguration};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use rtcp::packet::parse_compound;
use rtp::{RtpPacket, RtpPacketReceived};
use sdp::{Candidate, Description, Direction, MediaEntry, Role, SdpType};
use shared::error::{Error, Result};
use shared::{Clock, SystemClock, TaskQueue};

use crate::call::rtcp_receiver::{RtcpObserver, RtcpReceiver};
use crate::call::rtcp_sender::{
    RtcpMode, RtcpScheduler, RtcpSendReason, RtcpSender, RtcpSenderConfig,
};
use crate::call::rtp_demuxer::{RtcpSink, RtpDemuxer, RtpPacketSink};
use crate::data_channel::{DataChannel, DataChannelInit, StreamIdAllocator};
use crate::media::send_stream::VideoSendStream;
use crate::media::track::{MediaKind, MediaTrack, MediaTrackConfiguration};
use crate::transport::certificate::Certificate;
use crate::transport::dtls::{DtlsRecordMachine, DtlsTransport};
use crate::transport::dtls_srtp::{DtlsSrtpTransport, MediaPacket};
use crate::transport::ice::{GatheringState, IceAgent, IceTransport};
use crate::transport::sctp::{SctpAssociation, SctpTransport, DEFAULT_SCTP_PORT};
use crate::transport::{Transport, TransportState};
use crate::video::receive_stream::{VideoReceiveStream, VideoReceiveStreamConfig};

/// Connection-level state surfaced to the application.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub type ConnectionStateCallback = Box<dyn FnMut(ConnectionState) + Send>;
pub type GatheringStateCallback = Box<dyn FnMut(GatheringState) + Send>;
pub type CandidateCallback = Box<dyn FnMut(Candidate) + Send>;

/// The external engines a connection drives; all out-of-scope
/// collaborators enter here.
pub struct PeerConnectionDependencies {
    pub ice_agent: Box<dyn IceAgent>,
    pub dtls_machine_factory: Box<dyn FnOnce(bool) -> Box<dyn DtlsRecordMachine> + Send>,
    pub sctp_association: Box<dyn SctpAssociation>,
}

/// Per-track wiring: the send stream, the receive pipeline and the RTCP
/// pair gluing them to the wire. Holding the `Arc`s keeps the demuxer's
/// weak sinks alive.
struct TrackSession {
    config: MediaTrackConfiguration,
    send_stream: Option<Arc<Mutex<VideoSendStream>>>,
    receive_stream: Option<Arc<Mutex<ReceiveAdapter>>>,
    rtcp_sender: Arc<Mutex<RtcpSender>>,
    rtcp_adapter: Arc<Mutex<RtcpAdapter>>,
    _rtcp_scheduler: Arc<RtcpScheduler>,
    _nack_task: Option<shared::RepeatingTaskHandle>,
}

/// Demuxer-facing wrapper of the receive pipeline.
struct ReceiveAdapter {
    stream: VideoReceiveStream,
}

impl RtpPacketSink for ReceiveAdapter {
    fn on_rtp_packet(&mut self, packet: RtpPacketReceived) {
        self.stream.on_rtp_packet(packet);
    }
}

/// Demuxer-facing wrapper of the RTCP receiver.
struct RtcpAdapter {
    receiver: RtcpReceiver,
}

impl RtcpSink for RtcpAdapter {
    fn on_rtcp_packets(&mut self, packets: &[rtcp::RtcpPacket]) {
        self.receiver.incoming_packets(packets);
    }
}

/// Routes RTCP feedback arriving for a send stream back into it.
struct SendStreamObserver {
    send_stream: Weak<Mutex<VideoSendStream>>,
}

impl RtcpObserver for SendStreamObserver {
    fn on_nack_received(&mut self, sequence_numbers: Vec<u16>) {
        if let Some(stream) = self.send_stream.upgrade() {
            stream.lock().unwrap().on_nack_received(&sequence_numbers);
        }
    }

    fn on_keyframe_request(&mut self) {
        debug!("remote requested a keyframe");
    }
}

struct Negotiation {
    local: Option<Description>,
    remote: Option<Description>,
    role: Role,
}

/// A native peer connection.
pub struct PeerConnection {
    config: RtcConfiguration,
    certificate: Arc<Certificate>,
    clock: Arc<dyn Clock>,
    network_queue: TaskQueue,
    worker_queue: TaskQueue,

    ice: Arc<IceTransport>,
    dtls_srtp: Mutex<Option<Arc<DtlsSrtpTransport>>>,
    sctp: Mutex<Option<Arc<SctpTransport>>>,
    dtls_machine_factory: Mutex<Option<Box<dyn FnOnce(bool) -> Box<dyn DtlsRecordMachine> + Send>>>,
    sctp_association: Mutex<Option<Box<dyn SctpAssociation>>>,

    demuxer: Arc<Mutex<RtpDemuxer>>,
    sessions: Mutex<Vec<TrackSession>>,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
    data_channels: Mutex<Vec<Arc<DataChannel>>>,
    stream_ids: Mutex<Option<StreamIdAllocator>>,

    negotiation: Mutex<Negotiation>,
    state: Mutex<ConnectionState>,
    state_callback: Mutex<Option<ConnectionStateCallback>>,
}

impl PeerConnection {
    pub fn new(
        config: RtcConfiguration,
        dependencies: PeerConnectionDependencies,
    ) -> Result<Arc<PeerConnection>> {
        let certificate = match &config.certificate {
            Some(certificate) => Arc::clone(certificate),
            None => Certificate::shared()?,
        };
        let network_queue = TaskQueue::new("pc-network");
        let worker_queue = TaskQueue::new("pc-worker");
        let ice = IceTransport::new(
            dependencies.ice_agent,
            Role::ActPass,
            network_queue.clone(),
        );

        Ok(Arc::new(PeerConnection {
            config,
            certificate,
            clock: Arc::new(SystemClock::new()),
            network_queue,
            worker_queue,
            ice,
            dtls_srtp: Mutex::new(None),
            sctp: Mutex::new(None),
            dtls_machine_factory: Mutex::new(Some(dependencies.dtls_machine_factory)),
            sctp_association: Mutex::new(Some(dependencies.sctp_association)),
            demuxer: Arc::new(Mutex::new(RtpDemuxer::new())),
            sessions: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            stream_ids: Mutex::new(None),
            negotiation: Mutex::new(Negotiation {
                local: None,
                remote: None,
                role: Role::ActPass,
            }),
            state: Mutex::new(ConnectionState::New),
            state_callback: Mutex::new(None),
        }))
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn on_connection_state_change(&self, callback: ConnectionStateCallback) {
        *self.state_callback.lock().unwrap() = Some(callback);
    }

    pub fn on_ice_gathering_state_change(&self, callback: GatheringStateCallback) {
        self.ice.on_gathering_state_changed(callback);
    }

    pub fn on_ice_candidate(&self, callback: CandidateCallback) {
        self.ice.on_candidate_gathered(callback);
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        if let Some(callback) = self.state_callback.lock().unwrap().as_mut() {
            callback(state);
        }
    }

    // Negotiation API.

    /// Builds the local offer from the registered tracks and data
    /// channels.
    pub fn create_offer(&self) -> Result<Description> {
        let mut offer = self.ice.local_description(SdpType::Offer)?;
        offer.set_fingerprint(self.certificate.fingerprint())?;
        self.populate_entries(&mut offer)?;
        Ok(offer)
    }

    /// Builds the answer mirroring the stored remote offer.
    pub fn create_answer(&self) -> Result<Description> {
        let negotiation = self.negotiation.lock().unwrap();
        let remote = negotiation
            .remote
            .as_ref()
            .ok_or_else(|| Error::UnexpectedState("no remote offer".to_string()))?;

        let mut answer = self.ice.local_description(SdpType::Answer)?;
        answer.hint_role(negotiation.role);
        answer.set_fingerprint(self.certificate.fingerprint())?;

        let tracks = self.tracks.lock().unwrap();
        for entry in remote.entries() {
            match entry {
                MediaEntry::Application(app) => {
                    let answered = answer.add_application(app.mid())?;
                    answered.set_sctp_port(Some(DEFAULT_SCTP_PORT));
                }
                MediaEntry::Audio(media) | MediaEntry::Video(media) => {
                    match tracks.iter().find(|t| t.mid() == media.mid()) {
                        Some(track) => {
                            let mut ours = track.config().build_media_entry();
                            ours.set_direction(media.direction().reverse());
                            answer.add_media(ours)?;
                        }
                        None => {
                            // No local counterpart: echo the entry, inactive.
                            let mut echo = media.clone();
                            echo.set_direction(Direction::Inactive);
                            answer.add_media(echo)?;
                        }
                    }
                }
            }
        }
        Ok(answer)
    }

    pub fn set_local_description(&self, description: Description) -> Result<()> {
        let first_mid = description
            .entries()
            .first()
            .map(|entry| entry.mid().to_string())
            .unwrap_or_else(|| "0".to_string());
        {
            let mut negotiation = self.negotiation.lock().unwrap();
            negotiation.local = Some(description);
        }
        self.ice.gather_local_candidates(&first_mid)?;
        Ok(())
    }

    pub fn set_remote_description(self: &Arc<Self>, description: Description) -> Result<()> {
        let remote_fingerprint = description
            .fingerprint()
            .ok_or_else(|| {
                Error::UnexpectedState("remote description without fingerprint".to_string())
            })?
            .to_string();

        self.ice.set_remote_description(&description)?;
        let local_role = self.ice.role();
        {
            let mut negotiation = self.negotiation.lock().unwrap();
            negotiation.role = local_role;
            negotiation.remote = Some(description.clone());
        }
        // The active side runs the DTLS client.
        let is_client = local_role == Role::Active;
        self.setup_transports(is_client, &remote_fingerprint, &description)?;
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    pub fn add_remote_candidate(&self, candidate: &Candidate) -> Result<()> {
        self.ice.add_remote_candidate(candidate)
    }

    // Tracks and channels.

    /// Registers a track; entries appear in subsequent offers/answers.
    pub fn add_track(&self, config: MediaTrackConfiguration) -> Result<Arc<MediaTrack>> {
        if self.tracks.lock().unwrap().iter().any(|t| t.mid() == config.mid) {
            return Err(Error::DuplicateMid(config.mid));
        }
        let track = Arc::new(MediaTrack::new(config));
        self.tracks.lock().unwrap().push(Arc::clone(&track));
        Ok(track)
    }

    /// Creates a data channel; usable once the SCTP transport is up.
    pub fn create_data_channel(&self, init: DataChannelInit) -> Result<Arc<DataChannel>> {
        let sctp = self.sctp.lock().unwrap().clone();
        match sctp {
            Some(sctp) => {
                let stream_id = match init.stream_id {
                    Some(id) => id,
                    None => self
                        .stream_ids
                        .lock()
                        .unwrap()
                        .as_mut()
                        .ok_or_else(|| {
                            Error::UnexpectedState("transports not negotiated".to_string())
                        })?
                        .allocate()?,
                };
                let channel = DataChannel::new(init, stream_id, sctp);
                self.data_channels.lock().unwrap().push(Arc::clone(&channel));
                Ok(channel)
            }
            None => Err(Error::UnexpectedState(
                "create_data_channel before negotiation".to_string(),
            )),
        }
    }

    pub fn has_pending_tracks(&self) -> bool {
        !self.tracks.lock().unwrap().is_empty()
    }

    // Internal wiring.

    fn populate_entries(&self, description: &mut Description) -> Result<()> {
        description.add_application("0")?;
        for track in self.tracks.lock().unwrap().iter() {
            description.add_media(track.config().build_media_entry())?;
        }
        Ok(())
    }

    fn setup_transports(
        self: &Arc<Self>,
        is_client: bool,
        remote_fingerprint: &str,
        remote: &Description,
    ) -> Result<()> {
        if self.dtls_srtp.lock().unwrap().is_some() {
            return Ok(());
        }
        let factory = self
            .dtls_machine_factory
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::UnexpectedState("transports already built".to_string()))?;
        let machine = factory(is_client);

        let dtls = DtlsTransport::new(
            Arc::clone(&self.ice) as Arc<dyn Transport>,
            Arc::clone(&self.certificate),
            is_client,
            machine,
            self.network_queue.clone(),
        );
        dtls.set_remote_fingerprint(remote_fingerprint);
        let dtls_srtp = DtlsSrtpTransport::new(Arc::clone(&dtls));

        // Decrypted media feeds the demuxer on the worker queue.
        let demuxer = Arc::clone(&self.demuxer);
        let worker = self.worker_queue.clone();
        let arrival_clock = Arc::clone(&self.clock);
        dtls_srtp.on_media_packet(Box::new(move |packet| {
            let demuxer = Arc::clone(&demuxer);
            let arrival_clock = Arc::clone(&arrival_clock);
            worker.dispatch(move || match &packet {
                MediaPacket::Rtp(data) => match RtpPacket::parse(data.data()) {
                    Ok(parsed) => {
                        let received = RtpPacketReceived::new(parsed, arrival_clock.now());
                        demuxer.lock().unwrap().on_rtp_packet(received);
                    }
                    Err(e) => debug!("undecodable rtp packet: {e}"),
                },
                MediaPacket::Rtcp(data) => match parse_compound(data.data()) {
                    Ok(packets) => demuxer.lock().unwrap().on_rtcp_packets(&packets),
                    Err(e) => debug!("undecodable rtcp compound: {e}"),
                },
            });
        }));

        // Connection state follows DTLS.
        let weak = Arc::downgrade(self);
        dtls_srtp.on_state_changed(Box::new(move |state| {
            if let Some(pc) = weak.upgrade() {
                let mapped = match state {
                    TransportState::Disconnected => ConnectionState::Disconnected,
                    TransportState::Connecting => ConnectionState::Connecting,
                    TransportState::Connected | TransportState::Completed => {
                        ConnectionState::Connected
                    }
                    TransportState::Failed => ConnectionState::Failed,
                };
                pc.set_state(mapped);
            }
        }));

        let association = self
            .sctp_association
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::UnexpectedState("sctp already built".to_string()))?;
        let sctp = SctpTransport::new(
            Arc::clone(&dtls) as Arc<dyn Transport>,
            association,
            self.network_queue.clone(),
        );

        dtls_srtp.start()?;
        let remote_sctp_port = remote
            .application()
            .and_then(|app| app.sctp_port())
            .unwrap_or(DEFAULT_SCTP_PORT);
        sctp.start(remote_sctp_port)?;

        *self.dtls_srtp.lock().unwrap() = Some(Arc::clone(&dtls_srtp));
        *self.sctp.lock().unwrap() = Some(sctp);
        *self.stream_ids.lock().unwrap() = Some(StreamIdAllocator::new(is_client));

        self.setup_media_sessions(&dtls_srtp, remote)?;
        Ok(())
    }

    /// Builds the per-track send/receive machinery and registers it with
    /// the demuxer.
    fn setup_media_sessions(
        &self,
        dtls_srtp: &Arc<DtlsSrtpTransport>,
        remote: &Description,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        for track in self.tracks.lock().unwrap().iter() {
            let config = track.config().clone();
            let remote_entry = remote.media(&config.mid);
            let remote_direction = remote_entry
                .map(|media| media.direction())
                .unwrap_or(Direction::Inactive);

            // Our send half is useful when the remote receives.
            let sending = matches!(remote_direction, Direction::RecvOnly | Direction::SendRecv);
            // Their send half means we receive.
            let receiving =
                matches!(remote_direction, Direction::SendOnly | Direction::SendRecv);

            let rtp_out = Arc::clone(dtls_srtp);
            let send_stream = (sending && config.kind == MediaKind::Video).then(|| {
                Arc::new(Mutex::new(VideoSendStream::new(
                    config.clone(),
                    Arc::clone(&self.clock),
                    Box::new(move |wire| {
                        if let Err(e) = rtp_out.send_rtp(wire.data()) {
                            debug!("rtp send failed: {e}");
                        }
                    }),
                )))
            });

            // The remote media SSRC drives our receive pipeline.
            let remote_media_ssrc = remote_entry
                .and_then(|media| media.media_ssrcs().first().copied());
            let receive_stream = (receiving && config.kind == MediaKind::Video)
                .then(|| remote_media_ssrc)
                .flatten()
                .map(|remote_ssrc| {
                    let remote_entry = remote_entry.unwrap();
                    let rtx_ssrc = remote_entry.rtx_ssrc_for(remote_ssrc);
                    let mut associated = BTreeMap::new();
                    if let Some(rtx_payload_type) = config.rtx_payload_type {
                        associated.insert(rtx_payload_type, config.payload_type);
                    }
                    let stream = VideoReceiveStream::new(
                        VideoReceiveStreamConfig {
                            media_ssrc: remote_ssrc,
                            rtx_ssrc,
                            rtx_associated_payload_types: associated,
                            red_payload_type: config.red_payload_type,
                            ulpfec_payload_type: config.ulpfec_payload_type,
                            ..Default::default()
                        },
                        Arc::clone(&self.clock),
                    );
                    Arc::new(Mutex::new(ReceiveAdapter { stream }))
                });

            let rtcp_out = Arc::clone(dtls_srtp);
            let rtcp_sender = Arc::new(Mutex::new(RtcpSender::new(
                Arc::clone(&self.clock),
                RtcpSenderConfig {
                    local_ssrc: config.media_ssrc,
                    remote_ssrc: remote_media_ssrc.unwrap_or_default(),
                    cname: config.cname.clone(),
                    audio: config.kind == MediaKind::Audio,
                    mode: RtcpMode::Compound,
                    ..Default::default()
                },
                Box::new(move |buffer| {
                    if let Err(e) = rtcp_out.send_rtcp(buffer) {
                        debug!("rtcp send failed: {e}");
                    }
                }),
            )));

            // Feedback for the send stream comes back through RTCP.
            let observer: Arc<Mutex<dyn RtcpObserver>> =
                Arc::new(Mutex::new(SendStreamObserver {
                    send_stream: send_stream
                        .as_ref()
                        .map(Arc::downgrade)
                        .unwrap_or_default(),
                }));
            let rtcp_adapter = Arc::new(Mutex::new(RtcpAdapter {
                receiver: RtcpReceiver::new(
                    Arc::clone(&self.clock),
                    config.media_ssrc,
                    remote_media_ssrc.unwrap_or_default(),
                    observer,
                ),
            }));

            // NACKs from the receive pipeline leave through the sender.
            if let Some(receive) = &receive_stream {
                let nack_sender = Arc::clone(&rtcp_sender);
                receive.lock().unwrap().stream.on_nack(Box::new(move |seqs| {
                    nack_sender
                        .lock()
                        .unwrap()
                        .send_rtcp(RtcpSendReason::Nack(seqs));
                }));
                let pli_sender = Arc::clone(&rtcp_sender);
                receive
                    .lock()
                    .unwrap()
                    .stream
                    .on_keyframe_request(Box::new(move || {
                        pli_sender.lock().unwrap().send_rtcp(RtcpSendReason::Pli);
                    }));
            }

            // Demuxer registrations.
            let mut demuxer = self.demuxer.lock().unwrap();
            if let Some(receive) = &receive_stream {
                let ssrc = receive.lock().unwrap().stream.media_ssrc();
                let sink: Arc<Mutex<dyn RtpPacketSink>> = Arc::clone(receive) as _;
                demuxer.add_sink_by_ssrc(ssrc, Arc::downgrade(&sink));
                if let Some(rtx_ssrc) = receive.lock().unwrap().stream.rtx_ssrc() {
                    demuxer.add_sink_by_ssrc(rtx_ssrc, Arc::downgrade(&sink));
                }
            }
            let rtcp_sink: Arc<Mutex<dyn RtcpSink>> = Arc::clone(&rtcp_adapter) as _;
            demuxer.add_rtcp_sink(config.media_ssrc, Arc::downgrade(&rtcp_sink));
            if let Some(remote_ssrc) = remote_media_ssrc {
                demuxer.add_rtcp_sink(remote_ssrc, Arc::downgrade(&rtcp_sink));
            }
            drop(demuxer);

            let rtcp_scheduler = RtcpScheduler::start(
                Arc::clone(&rtcp_sender),
                self.worker_queue.clone(),
                Arc::clone(&self.clock),
            );
            let nack_task = receive_stream.as_ref().map(|receive| {
                let receive = Arc::clone(receive);
                shared::RepeatingTaskHandle::start(
                    self.worker_queue.clone(),
                    shared::units::TimeDelta::from_millis(20),
                    move || {
                        receive.lock().unwrap().stream.periodic_update();
                        shared::units::TimeDelta::from_millis(20)
                    },
                )
            });

            sessions.push(TrackSession {
                config,
                send_stream,
                receive_stream,
                rtcp_sender,
                rtcp_adapter,
                _rtcp_scheduler: rtcp_scheduler,
                _nack_task: nack_task,
            });
        }
        Ok(())
    }

    /// Pushes one encoded video frame onto the track's send stream.
    pub fn send_video_frame(
        &self,
        mid: &str,
        bitstream: &[u8],
        rtp_timestamp: u32,
    ) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .iter()
            .find(|s| s.config.mid == mid)
            .ok_or_else(|| Error::UnknownMid(mid.to_string()))?;
        let send_stream = session
            .send_stream
            .as_ref()
            .ok_or_else(|| Error::UnexpectedState("track has no send stream".to_string()))?;
        let capture_time_ms = self.clock.now_ms();
        let sent = send_stream
            .lock()
            .unwrap()
            .send_frame(bitstream, rtp_timestamp, capture_time_ms)
            .ok_or_else(|| Error::BadMediaConfiguration("unpacketizable frame".to_string()))?;
        session.rtcp_sender.lock().unwrap().on_media_sent(
            sent.packets as u32,
            bitstream.len() as u32,
            rtp_timestamp,
        );
        Ok(())
    }

    /// Installs the assembled-frame sink of the track's receive pipeline.
    pub fn on_video_frame(
        &self,
        mid: &str,
        sink: crate::video::receive_stream::FrameSink,
    ) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .iter()
            .find(|s| s.config.mid == mid)
            .ok_or_else(|| Error::UnknownMid(mid.to_string()))?;
        let receive = session
            .receive_stream
            .as_ref()
            .ok_or_else(|| Error::UnexpectedState("track has no receive stream".to_string()))?;
        receive.lock().unwrap().stream.on_frame(sink);
        Ok(())
    }

    /// Tears the connection down.
    pub fn close(&self) {
        if let Some(sctp) = self.sctp.lock().unwrap().as_ref() {
            sctp.stop();
        }
        if let Some(dtls_srtp) = self.dtls_srtp.lock().unwrap().as_ref() {
            dtls_srtp.stop();
        }
        self.ice.stop();
        self.set_state(ConnectionState::Closed);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if *self.state.lock().unwrap() != ConnectionState::Closed {
            warn!("peer connection dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LoopbackIceAgent, MockDtlsMachine, MockSctpAssociation};
    use std::sync::mpsc;
    use std::time::Duration;

    fn pc_pair() -> (Arc<PeerConnection>, Arc<PeerConnection>) {
        let (agent_a, agent_b) = LoopbackIceAgent::pair("uf", "pw");
        let cert_a = Certificate::generate().unwrap();
        let cert_b = Certificate::generate().unwrap();
        let (machine_a, machine_b) = MockDtlsMachine::pair(cert_a.der(), cert_b.der());
        let machine_a = Mutex::new(Some(machine_a));
        let machine_b = Mutex::new(Some(machine_b));

        let pc_a = PeerConnection::new(
            RtcConfiguration {
                certificate: Some(cert_a),
                ..Default::default()
            },
            PeerConnectionDependencies {
                ice_agent: Box::new(agent_a),
                dtls_machine_factory: Box::new(move |_client| -> Box<dyn DtlsRecordMachine> {
                    Box::new(machine_a.lock().unwrap().take().unwrap())
                }),
                sctp_association: Box::new(MockSctpAssociation::default()),
            },
        )
        .unwrap();
        let pc_b = PeerConnection::new(
            RtcConfiguration {
                certificate: Some(cert_b),
                ..Default::default()
            },
            PeerConnectionDependencies {
                ice_agent: Box::new(agent_b),
                dtls_machine_factory: Box::new(move |_client| -> Box<dyn DtlsRecordMachine> {
                    Box::new(machine_b.lock().unwrap().take().unwrap())
                }),
                sctp_association: Box::new(MockSctpAssociation::default()),
            },
        )
        .unwrap();
        (pc_a, pc_b)
    }

    fn wait_connected(pc: &Arc<PeerConnection>) -> bool {
        let (tx, rx) = mpsc::channel();
        pc.on_connection_state_change(Box::new(move |state| {
            let _ = tx.send(state);
        }));
        if pc.connection_state() == ConnectionState::Connected {
            return true;
        }
        while let Ok(state) = rx.recv_timeout(Duration::from_secs(5)) {
            match state {
                ConnectionState::Connected => return true,
                ConnectionState::Failed => return false,
                _ => continue,
            }
        }
        false
    }

    #[test]
    fn test_offer_contains_tracks_and_application() {
        let (pc_a, _pc_b) = pc_pair();
        let mut video = MediaTrackConfiguration::video("1");
        video.enable_rtx(99);
        pc_a.add_track(video).unwrap();

        let offer = pc_a.create_offer().unwrap();
        assert_eq!(offer.role(), Role::ActPass);
        assert!(offer.has_application());
        assert!(offer.has_video());
        assert_eq!(offer.bundle_mids(), vec!["0", "1"]);
        assert!(offer.fingerprint().is_some());

        pc_a.close();
        _pc_b.close();
    }

    #[test]
    fn test_offer_answer_establishes_connection() {
        let (pc_a, pc_b) = pc_pair();
        pc_a.add_track(MediaTrackConfiguration::video("1")).unwrap();
        pc_b.add_track(MediaTrackConfiguration::video("1")).unwrap();

        let offer = pc_a.create_offer().unwrap();
        pc_a.set_local_description(offer.clone()).unwrap();
        pc_b.set_remote_description(offer).unwrap();

        let answer = pc_b.create_answer().unwrap();
        assert_eq!(answer.sdp_type(), SdpType::Answer);
        assert_eq!(answer.role(), Role::Active);
        pc_b.set_local_description(answer.clone()).unwrap();
        pc_a.set_remote_description(answer).unwrap();

        assert!(wait_connected(&pc_a), "offerer failed to connect");
        assert!(wait_connected(&pc_b), "answerer failed to connect");

        // The answerer took the client role and exported SRTP keys.
        assert!(pc_b.dtls_srtp.lock().unwrap().as_ref().unwrap().is_srtp_ready());

        pc_a.close();
        pc_b.close();
        assert_eq!(pc_a.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_answer_echoes_unknown_media_as_inactive() {
        let (pc_a, pc_b) = pc_pair();
        pc_a.add_track(MediaTrackConfiguration::video("1")).unwrap();

        let offer = pc_a.create_offer().unwrap();
        pc_b.set_remote_description(offer).unwrap();
        let answer = pc_b.create_answer().unwrap();
        let video = answer.media("1").unwrap();
        assert_eq!(video.direction(), Direction::Inactive);

        pc_a.close();
        pc_b.close();
    }

    #[test]
    fn test_data_channel_after_negotiation() {
        let (pc_a, pc_b) = pc_pair();
        // Before negotiation: refused.
        assert!(pc_a
            .create_data_channel(DataChannelInit {
                label: "early".to_string(),
                ..Default::default()
            })
            .is_err());

        let offer = pc_a.create_offer().unwrap();
        pc_a.set_local_description(offer.clone()).unwrap();
        pc_b.set_remote_description(offer).unwrap();
        let answer = pc_b.create_answer().unwrap();
        pc_b.set_local_description(answer.clone()).unwrap();
        pc_a.set_remote_description(answer).unwrap();
        assert!(wait_connected(&pc_a));

        let channel = pc_a
            .create_data_channel(DataChannelInit {
                label: "chat".to_string(),
                ..Default::default()
            })
            .unwrap();
        channel.send_text("hello").unwrap();
        // The offerer ended up passive (server): odd stream ids.
        assert_eq!(channel.stream_id() % 2, 1);

        pc_a.close();
        pc_b.close();
    }

    #[test]
    fn test_video_frame_end_to_end() {
        let (pc_a, pc_b) = pc_pair();
        pc_a.add_track(MediaTrackConfiguration::video("1")).unwrap();
        pc_b.add_track(MediaTrackConfiguration::video("1")).unwrap();

        let offer = pc_a.create_offer().unwrap();
        pc_a.set_local_description(offer.clone()).unwrap();
        pc_b.set_remote_description(offer).unwrap();
        let answer = pc_b.create_answer().unwrap();
        pc_b.set_local_description(answer.clone()).unwrap();
        pc_a.set_remote_description(answer).unwrap();
        assert!(wait_connected(&pc_a));
        assert!(wait_connected(&pc_b));

        let (tx, rx) = mpsc::channel();
        pc_b.on_video_frame(
            "1",
            Box::new(move |frame| {
                let _ = tx.send((frame.id, frame.is_keyframe(), frame.payload.len()));
            }),
        )
        .unwrap();

        let mut keyframe = vec![0, 0, 0, 1, 0x65];
        keyframe.extend([3u8; 200]);
        pc_a.send_video_frame("1", &keyframe, 90_000).unwrap();

        let (_id, is_keyframe, payload_len) =
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(is_keyframe);
        assert_eq!(payload_len, keyframe.len());

        pc_a.close();
        pc_b.close();
    }

    #[test]
    fn test_candidates_flow_via_callback() {
        let (pc_a, pc_b) = pc_pair();
        let (tx, rx) = mpsc::channel();
        pc_a.on_ice_candidate(Box::new(move |candidate| {
            let _ = tx.send(candidate);
        }));
        let offer = pc_a.create_offer().unwrap();
        pc_a.set_local_description(offer).unwrap();
        let candidate = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(candidate.mid(), Some("0"));
        // The far side accepts it.
        pc_b.add_remote_candidate(&candidate).unwrap();

        pc_a.close();
        pc_b.close();
    }
}
