//! ICE transport: wraps an external connectivity agent and maps its events
//! onto the transport contract.
//!
//! The wire behavior (STUN checks, candidate pairing, sockets) lives in the
//! [`IceAgent`] implementation the embedder provides; this layer owns the
//! role, the description plumbing and the state machine.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use sdp::{Candidate, Description, Role, SdpType};
use shared::error::{Error, Result};
use shared::{CopyOnWriteBuffer, TaskQueue};

use super::{
    PacketReceivedCallback, StateChangedCallback, Transport, TransportCore, TransportState,
};

/// Candidate-gathering progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    #[default]
    New,
    Gathering,
    Completed,
}

/// Connectivity progress as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Completed,
    Failed,
}

/// Events an [`IceAgent`] pushes into the transport. Agents may fire these
/// from any thread, including synchronously from inside their own methods.
pub enum IceAgentEvent {
    StateChanged(IceConnectionState),
    CandidateGathered(Candidate),
    GatheringDone,
    PacketReceived(Vec<u8>),
}

pub type IceEventSink = Box<dyn FnMut(IceAgentEvent) + Send>;

/// The external connectivity establishment engine (a libjuice/libnice
/// equivalent).
pub trait IceAgent: Send {
    fn local_ufrag(&self) -> String;
    fn local_pwd(&self) -> String;

    fn set_event_sink(&mut self, sink: IceEventSink);

    /// Starts gathering local candidates.
    fn gather(&mut self) -> Result<()>;

    fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &Candidate) -> Result<()>;

    /// Sends one datagram to the selected pair.
    fn send(&mut self, data: &[u8]) -> Result<usize>;
}

pub type CandidateCallback = Box<dyn FnMut(Candidate) + Send>;
pub type GatheringStateCallback = Box<dyn FnMut(GatheringState) + Send>;

/// Event-side state; never held while calling into the agent, so agents
/// are free to fire events from inside their own methods.
#[derive(Default)]
struct IceEventState {
    role: Role,
    gathering_state: GatheringState,
    mid: Option<String>,
    candidate_callback: Option<CandidateCallback>,
    gathering_callback: Option<GatheringStateCallback>,
}

/// Lowest layer of the transport chain.
pub struct IceTransport {
    core: Arc<TransportCore>,
    agent: Mutex<Box<dyn IceAgent>>,
    events: Arc<Mutex<IceEventState>>,
}

impl IceTransport {
    pub fn new(mut agent: Box<dyn IceAgent>, role: Role, queue: TaskQueue) -> Arc<IceTransport> {
        let core = TransportCore::new(queue);
        let events = Arc::new(Mutex::new(IceEventState {
            role,
            ..Default::default()
        }));

        let sink_core = Arc::clone(&core);
        let sink_events = Arc::clone(&events);
        agent.set_event_sink(Box::new(move |event| {
            Self::handle_agent_event(&sink_core, &sink_events, event);
        }));

        Arc::new(IceTransport {
            core,
            agent: Mutex::new(agent),
            events,
        })
    }

    fn handle_agent_event(
        core: &Arc<TransportCore>,
        events: &Arc<Mutex<IceEventState>>,
        event: IceAgentEvent,
    ) {
        match event {
            IceAgentEvent::StateChanged(state) => {
                let mapped = match state {
                    IceConnectionState::Disconnected => TransportState::Disconnected,
                    IceConnectionState::Connecting => TransportState::Connecting,
                    IceConnectionState::Connected => TransportState::Connected,
                    IceConnectionState::Completed => TransportState::Completed,
                    IceConnectionState::Failed => TransportState::Failed,
                };
                core.set_state(mapped);
            }
            IceAgentEvent::CandidateGathered(mut candidate) => {
                let mut guard = events.lock().unwrap();
                if let Some(mid) = &guard.mid {
                    candidate.set_mid(mid);
                }
                if let Some(callback) = guard.candidate_callback.as_mut() {
                    callback(candidate);
                }
            }
            IceAgentEvent::GatheringDone => {
                let mut guard = events.lock().unwrap();
                guard.gathering_state = GatheringState::Completed;
                if let Some(callback) = guard.gathering_callback.as_mut() {
                    callback(GatheringState::Completed);
                }
            }
            IceAgentEvent::PacketReceived(data) => {
                core.deliver(CopyOnWriteBuffer::from(data));
            }
        }
    }

    pub fn role(&self) -> Role {
        self.events.lock().unwrap().role
    }

    pub fn set_role(&self, role: Role) {
        self.events.lock().unwrap().role = role;
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.events.lock().unwrap().gathering_state
    }

    pub fn on_candidate_gathered(&self, callback: CandidateCallback) {
        self.events.lock().unwrap().candidate_callback = Some(callback);
    }

    pub fn on_gathering_state_changed(&self, callback: GatheringStateCallback) {
        self.events.lock().unwrap().gathering_callback = Some(callback);
    }

    /// Starts candidate gathering; gathered candidates carry `mid`.
    pub fn gather_local_candidates(&self, mid: &str) -> Result<()> {
        {
            let mut events = self.events.lock().unwrap();
            if events.gathering_state == GatheringState::Gathering {
                return Ok(());
            }
            events.mid = Some(mid.to_string());
            events.gathering_state = GatheringState::Gathering;
            if let Some(callback) = events.gathering_callback.as_mut() {
                callback(GatheringState::Gathering);
            }
        }
        self.agent.lock().unwrap().gather()
    }

    pub fn add_remote_candidate(&self, candidate: &Candidate) -> Result<()> {
        let mut candidate = candidate.clone();
        if !candidate.resolve(sdp::candidate::ResolveMode::Simple) {
            debug!("remote candidate needs lookup: {candidate}");
        }
        self.agent.lock().unwrap().add_remote_candidate(&candidate)
    }

    /// Session-level description carrying this transport's credentials and
    /// role. The certificate fingerprint is filled in by the DTLS layer's
    /// owner.
    pub fn local_description(&self, sdp_type: SdpType) -> Result<Description> {
        let role = self.role();
        let agent = self.agent.lock().unwrap();
        Description::builder(sdp_type)
            .set_role(role)
            .set_ice_ufrag(&agent.local_ufrag())
            .set_ice_pwd(&agent.local_pwd())
            .build()
    }

    /// Applies the remote credentials, role and candidates.
    pub fn set_remote_description(&self, description: &Description) -> Result<()> {
        // Take the opposite role of an actpass remote; otherwise mirror.
        let local_role = match description.role() {
            Role::ActPass => Role::Active,
            other => other.reverse(),
        };
        self.events.lock().unwrap().role = local_role;

        let (ufrag, pwd) = match (description.ice_ufrag(), description.ice_pwd()) {
            (Some(ufrag), Some(pwd)) => (ufrag.to_string(), pwd.to_string()),
            _ => {
                return Err(Error::UnexpectedState(
                    "remote description without ice credentials".to_string(),
                ))
            }
        };
        let mut agent = self.agent.lock().unwrap();
        agent.set_remote_credentials(&ufrag, &pwd)?;
        for candidate in description.candidates() {
            if let Err(e) = agent.add_remote_candidate(candidate) {
                warn!("failed to add remote candidate {candidate}: {e}");
            }
        }
        Ok(())
    }
}

impl Transport for IceTransport {
    fn send(&self, packet: CopyOnWriteBuffer) -> Result<usize> {
        self.core.check_send()?;
        self.agent.lock().unwrap().send(packet.data())
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn on_packet_received(&self, callback: PacketReceivedCallback) {
        self.core.set_packet_callback(callback);
    }

    fn on_state_changed(&self, callback: StateChangedCallback) {
        self.core.set_state_callback(callback);
    }

    fn stop(&self) {
        self.core.stop();
    }
}
