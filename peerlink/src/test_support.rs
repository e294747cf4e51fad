//! In-memory doubles for the external collaborators (ICE agent, DTLS
//! record machine, SCTP association). Test-only.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sdp::Candidate;
use shared::error::{Error, Result};

use crate::transport::dtls::{DtlsOutput, DtlsRecordMachine};
use crate::transport::ice::{IceAgent, IceAgentEvent, IceConnectionState, IceEventSink};
use crate::transport::sctp::{SctpAssociation, SctpMessage};

type SinkSlot = Arc<Mutex<Option<IceEventSink>>>;

/// A pair of agents joined by direct function calls: what one sends, the
/// other's event sink receives. Gathering succeeds instantly with one fake
/// host candidate and flips straight to connected.
pub struct LoopbackIceAgent {
    ufrag: String,
    pwd: String,
    local_sink: SinkSlot,
    peer_sink: SinkSlot,
}

impl LoopbackIceAgent {
    pub fn pair(ufrag: &str, pwd: &str) -> (LoopbackIceAgent, LoopbackIceAgent) {
        let slot_a: SinkSlot = Arc::new(Mutex::new(None));
        let slot_b: SinkSlot = Arc::new(Mutex::new(None));
        let a = LoopbackIceAgent {
            ufrag: format!("{ufrag}-a"),
            pwd: format!("{pwd}-a"),
            local_sink: Arc::clone(&slot_a),
            peer_sink: Arc::clone(&slot_b),
        };
        let b = LoopbackIceAgent {
            ufrag: format!("{ufrag}-b"),
            pwd: format!("{pwd}-b"),
            local_sink: slot_b,
            peer_sink: slot_a,
        };
        (a, b)
    }

    fn emit(&self, event: IceAgentEvent) {
        if let Some(sink) = self.local_sink.lock().unwrap().as_mut() {
            sink(event);
        }
    }
}

impl IceAgent for LoopbackIceAgent {
    fn local_ufrag(&self) -> String {
        self.ufrag.clone()
    }

    fn local_pwd(&self) -> String {
        self.pwd.clone()
    }

    fn set_event_sink(&mut self, sink: IceEventSink) {
        *self.local_sink.lock().unwrap() = Some(sink);
    }

    fn gather(&mut self) -> Result<()> {
        let candidate =
            Candidate::parse("candidate:1 1 UDP 2122317823 127.0.0.1 40000 typ host").unwrap();
        self.emit(IceAgentEvent::StateChanged(IceConnectionState::Connecting));
        self.emit(IceAgentEvent::CandidateGathered(candidate));
        self.emit(IceAgentEvent::GatheringDone);
        self.emit(IceAgentEvent::StateChanged(IceConnectionState::Connected));
        Ok(())
    }

    fn set_remote_credentials(&mut self, _ufrag: &str, _pwd: &str) -> Result<()> {
        Ok(())
    }

    fn add_remote_candidate(&mut self, _candidate: &Candidate) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut peer = self.peer_sink.lock().unwrap();
        match peer.as_mut() {
            Some(sink) => {
                sink(IceAgentEvent::PacketReceived(data.to_vec()));
                Ok(data.len())
            }
            None => Err(Error::TemporaryFailure),
        }
    }
}

const MSG_CLIENT_HELLO: &[u8] = &[0x16, 1];
const MSG_SERVER_FLIGHT: &[u8] = &[0x16, 2];
const MSG_FINISHED: &[u8] = &[0x16, 3];
const APP_RECORD_TYPE: u8 = 0x17;

/// Record machine double: a three-message handshake, app data framed with
/// one marker byte and deterministic keying-material export.
pub struct MockDtlsMachine {
    peer_der: Vec<u8>,
    started: bool,
    connected: bool,
    timed_out: bool,
}

impl MockDtlsMachine {
    pub fn pair(der_a: &[u8], der_b: &[u8]) -> (MockDtlsMachine, MockDtlsMachine) {
        (
            MockDtlsMachine {
                peer_der: der_b.to_vec(),
                started: false,
                connected: false,
                timed_out: false,
            },
            MockDtlsMachine {
                peer_der: der_a.to_vec(),
                started: false,
                connected: false,
                timed_out: false,
            },
        )
    }

    pub fn set_timed_out(&mut self) {
        self.timed_out = true;
    }
}

impl DtlsRecordMachine for MockDtlsMachine {
    fn start_handshake(&mut self) -> Result<DtlsOutput> {
        self.started = true;
        Ok(DtlsOutput {
            outgoing: vec![MSG_CLIENT_HELLO.to_vec()],
            ..Default::default()
        })
    }

    fn handle_incoming(&mut self, data: &[u8]) -> Result<DtlsOutput> {
        let mut output = DtlsOutput::default();
        if data == MSG_CLIENT_HELLO {
            output.outgoing.push(MSG_SERVER_FLIGHT.to_vec());
            if !self.connected {
                self.connected = true;
                output.handshake_complete = true;
            }
        } else if data == MSG_SERVER_FLIGHT {
            output.outgoing.push(MSG_FINISHED.to_vec());
            if !self.connected {
                self.connected = true;
                output.handshake_complete = true;
            }
        } else if data == MSG_FINISHED {
            // Handshake already done on this side.
        } else if data.first() == Some(&APP_RECORD_TYPE) {
            output.application_data.push(data[1..].to_vec());
        }
        Ok(output)
    }

    fn wrap_application_data(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if !self.connected {
            return Err(Error::UnexpectedState("not connected".to_string()));
        }
        let mut record = Vec::with_capacity(data.len() + 1);
        record.push(APP_RECORD_TYPE);
        record.extend_from_slice(data);
        Ok(vec![record])
    }

    fn check_timeout(&mut self) -> Result<DtlsOutput> {
        // Clients keep retransmitting their first flight until answered;
        // the peer may not have built its transports yet.
        if self.started && !self.connected {
            return Ok(DtlsOutput {
                outgoing: vec![MSG_CLIENT_HELLO.to_vec()],
                ..Default::default()
            });
        }
        Ok(DtlsOutput::default())
    }

    fn is_handshake_timeout(&self) -> bool {
        self.timed_out
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        Some(self.peer_der.clone())
    }

    fn export_keying_material(&self, label: &str, length: usize) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(Error::KeyingMaterialExport("not connected".to_string()));
        }
        // Deterministic bytes both peers agree on.
        let seed = label.bytes().fold(7u8, |acc, b| acc.wrapping_add(b));
        Ok((0..length)
            .map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed))
            .collect())
    }
}

/// SCTP association double: messages sent come back out of a queue the
/// test can drain, and inbound messages can be injected.
#[derive(Default)]
pub struct MockSctpAssociation {
    pub connected: bool,
    pub sent: VecDeque<SctpMessage>,
}

impl SctpAssociation for MockSctpAssociation {
    fn connect(&mut self, _local_port: u16, _remote_port: u16) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn send_message(&mut self, message: SctpMessage) -> Result<()> {
        if !self.connected {
            return Err(Error::UnexpectedState("association closed".to_string()));
        }
        self.sent.push_back(message);
        Ok(())
    }

    fn handle_transport_data(&mut self, _data: &[u8]) -> Result<Vec<SctpMessage>> {
        Ok(Vec::new())
    }
}
