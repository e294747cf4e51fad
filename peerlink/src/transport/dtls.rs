//! DTLS transport: drives an external record machine over the ICE layer,
//! verifies the peer against the signaled fingerprint and exports SRTP
//! keying material.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use shared::error::{Error, Result};
use shared::units::TimeDelta;
use shared::{CopyOnWriteBuffer, RepeatingTaskHandle, TaskQueue};

use super::certificate::Certificate;
use super::{
    PacketReceivedCallback, StateChangedCallback, Transport, TransportCore, TransportState,
};

/// First-byte range of DTLS record content types.
pub fn is_dtls_record(data: &[u8]) -> bool {
    !data.is_empty() && (20..=63).contains(&data[0])
}

/// Everything a processing step produced.
#[derive(Debug, Default)]
pub struct DtlsOutput {
    /// Records to hand to the lower transport.
    pub outgoing: Vec<Vec<u8>>,
    /// Decrypted application data (the SCTP bytes, for data channels).
    pub application_data: Vec<Vec<u8>>,
    /// Set once when the handshake finishes.
    pub handshake_complete: bool,
}

/// The external DTLS record-layer engine. The transport drives it; the
/// engine owns records, retransmission decisions and the crypto.
pub trait DtlsRecordMachine: Send {
    /// Kicks off the handshake (client side emits its first flight).
    fn start_handshake(&mut self) -> Result<DtlsOutput>;

    /// Feeds one inbound datagram.
    fn handle_incoming(&mut self, data: &[u8]) -> Result<DtlsOutput>;

    /// Encrypts application data into records.
    fn wrap_application_data(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Periodic retransmission check.
    fn check_timeout(&mut self) -> Result<DtlsOutput>;

    /// True once the engine has given up on the handshake.
    fn is_handshake_timeout(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// DER encoding of the peer certificate, once known.
    fn peer_certificate_der(&self) -> Option<Vec<u8>>;

    /// RFC 5705 keying-material export.
    fn export_keying_material(&self, label: &str, length: usize) -> Result<Vec<u8>>;
}

pub type VerifyCallback = Box<dyn Fn(&str) -> bool + Send>;
pub type HandshakeDoneCallback = Box<dyn FnMut() + Send>;

const TIMEOUT_CHECK_INTERVAL: TimeDelta = TimeDelta::from_millis(50);

/// DTLS layer of the transport chain.
pub struct DtlsTransport {
    core: Arc<TransportCore>,
    lower: Arc<dyn Transport>,
    machine: Mutex<Box<dyn DtlsRecordMachine>>,
    certificate: Arc<Certificate>,
    is_client: bool,
    remote_fingerprint: Mutex<Option<String>>,
    verify_callback: Mutex<Option<VerifyCallback>>,
    handshake_done_callback: Mutex<Option<HandshakeDoneCallback>>,
    timeout_task: Mutex<Option<RepeatingTaskHandle>>,
}

impl DtlsTransport {
    pub fn new(
        lower: Arc<dyn Transport>,
        certificate: Arc<Certificate>,
        is_client: bool,
        machine: Box<dyn DtlsRecordMachine>,
        queue: TaskQueue,
    ) -> Arc<DtlsTransport> {
        Arc::new(DtlsTransport {
            core: TransportCore::new(queue),
            lower,
            machine: Mutex::new(machine),
            certificate,
            is_client,
            remote_fingerprint: Mutex::new(None),
            verify_callback: Mutex::new(None),
            handshake_done_callback: Mutex::new(None),
            timeout_task: Mutex::new(None),
        })
    }

    /// Registers this transport as the lower layer's packet consumer.
    /// Call when DTLS is the only consumer (no SRTP on this chain).
    pub fn attach_to_lower(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.lower.on_packet_received(Box::new(move |packet| {
            this.handle_record(packet.data());
        }));
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    pub fn local_fingerprint(&self) -> &str {
        self.certificate.fingerprint()
    }

    pub fn set_remote_fingerprint(&self, fingerprint: &str) {
        *self.remote_fingerprint.lock().unwrap() = Some(fingerprint.to_string());
    }

    /// Overrides the default fingerprint comparison. The callback receives
    /// the actual fingerprint of the peer certificate.
    pub fn set_verify_callback(&self, callback: VerifyCallback) {
        *self.verify_callback.lock().unwrap() = Some(callback);
    }

    /// Invoked on handshake completion, before the state flips to
    /// connected; the SRTP layer hooks key derivation here.
    pub fn on_handshake_done(&self, callback: HandshakeDoneCallback) {
        *self.handshake_done_callback.lock().unwrap() = Some(callback);
    }

    /// Starts the handshake; clients emit their first flight, both sides
    /// arm the retransmission timer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.core.set_state(TransportState::Connecting);
        if self.is_client {
            let output = self.machine.lock().unwrap().start_handshake()?;
            self.process_output(output);
        }

        let this = Arc::clone(self);
        let task = RepeatingTaskHandle::start(
            self.core.queue().clone(),
            TIMEOUT_CHECK_INTERVAL,
            move || this.check_handshake_timeout(),
        );
        *self.timeout_task.lock().unwrap() = Some(task);
        Ok(())
    }

    fn check_handshake_timeout(self: &Arc<Self>) -> TimeDelta {
        if self.core.is_stopped() || self.state() == TransportState::Failed {
            return TimeDelta::ZERO;
        }
        let (timed_out, connected, output) = {
            let mut machine = self.machine.lock().unwrap();
            if machine.is_connected() {
                (false, true, None)
            } else if machine.is_handshake_timeout() {
                (true, false, None)
            } else {
                (false, false, machine.check_timeout().ok())
            }
        };
        if connected {
            return TimeDelta::ZERO;
        }
        if timed_out {
            warn!("dtls handshake timed out");
            self.core.set_state(TransportState::Failed);
            return TimeDelta::ZERO;
        }
        if let Some(output) = output {
            self.process_output(output);
        }
        TIMEOUT_CHECK_INTERVAL
    }

    /// Feeds one inbound DTLS record (from the lower layer or from the
    /// SRTP demultiplexer above it).
    pub fn handle_record(self: &Arc<Self>, data: &[u8]) {
        if self.core.is_stopped() {
            return;
        }
        let result = self.machine.lock().unwrap().handle_incoming(data);
        match result {
            Ok(output) => self.process_output(output),
            Err(e) => debug!("dtls record dropped: {e}"),
        }
    }

    fn process_output(self: &Arc<Self>, output: DtlsOutput) {
        for record in output.outgoing {
            if let Err(e) = self.lower.send(CopyOnWriteBuffer::from(record)) {
                debug!("lower transport refused dtls record: {e}");
            }
        }
        for data in output.application_data {
            self.core.deliver(CopyOnWriteBuffer::from(data));
        }
        if output.handshake_complete {
            self.finish_handshake();
        }
    }

    fn finish_handshake(self: &Arc<Self>) {
        if !self.verify_peer() {
            warn!("peer certificate verification failed");
            self.core.set_state(TransportState::Failed);
            return;
        }
        if let Some(callback) = self.handshake_done_callback.lock().unwrap().as_mut() {
            callback();
        }
        self.core.set_state(TransportState::Connected);
    }

    fn verify_peer(&self) -> bool {
        let der = match self.machine.lock().unwrap().peer_certificate_der() {
            Some(der) => der,
            None => return false,
        };
        let actual = Certificate::make_fingerprint(&der);
        if let Some(callback) = self.verify_callback.lock().unwrap().as_ref() {
            return callback(&actual);
        }
        match self.remote_fingerprint.lock().unwrap().as_deref() {
            Some(expected) => actual.eq_ignore_ascii_case(expected),
            None => false,
        }
    }

    /// RFC 5705 export, available once connected.
    pub fn export_keying_material(&self, label: &str, length: usize) -> Result<Vec<u8>> {
        let machine = self.machine.lock().unwrap();
        if !machine.is_connected() {
            return Err(Error::UnexpectedState(
                "export before handshake completion".to_string(),
            ));
        }
        machine.export_keying_material(label, length)
    }

    pub(crate) fn core(&self) -> &Arc<TransportCore> {
        &self.core
    }

    pub(crate) fn lower(&self) -> &Arc<dyn Transport> {
        &self.lower
    }
}

impl Transport for DtlsTransport {
    /// Sends application data through the record layer (the SCTP path).
    fn send(&self, packet: CopyOnWriteBuffer) -> Result<usize> {
        self.core.check_send()?;
        if self.state() != TransportState::Connected {
            return Err(Error::UnexpectedState("dtls not connected".to_string()));
        }
        let records = self
            .machine
            .lock()
            .unwrap()
            .wrap_application_data(packet.data())?;
        for record in records {
            self.lower.send(CopyOnWriteBuffer::from(record))?;
        }
        Ok(packet.len())
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
        if let Some(task) = self.timeout_task.lock().unwrap().take() {
            task.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LoopbackIceAgent, MockDtlsMachine};
    use crate::transport::ice::IceTransport;
    use sdp::Role;
    use std::sync::mpsc;
    use std::time::Duration;

    fn transport_pair() -> (Arc<DtlsTransport>, Arc<DtlsTransport>, Arc<Certificate>, Arc<Certificate>) {
        let (agent_a, agent_b) = LoopbackIceAgent::pair("u", "p");
        let ice_a = IceTransport::new(Box::new(agent_a), Role::Active, TaskQueue::new("ice-a"));
        let ice_b = IceTransport::new(Box::new(agent_b), Role::Passive, TaskQueue::new("ice-b"));

        let cert_a = Certificate::generate().unwrap();
        let cert_b = Certificate::generate().unwrap();
        let (machine_a, machine_b) = MockDtlsMachine::pair(cert_a.der(), cert_b.der());

        let dtls_a = DtlsTransport::new(
            ice_a.clone() as Arc<dyn Transport>,
            Arc::clone(&cert_a),
            true,
            Box::new(machine_a),
            TaskQueue::new("dtls-a"),
        );
        let dtls_b = DtlsTransport::new(
            ice_b.clone() as Arc<dyn Transport>,
            Arc::clone(&cert_b),
            false,
            Box::new(machine_b),
            TaskQueue::new("dtls-b"),
        );
        dtls_a.attach_to_lower();
        dtls_b.attach_to_lower();
        (dtls_a, dtls_b, cert_a, cert_b)
    }

    fn wait_for_state(
        transport: &Arc<DtlsTransport>,
        wanted: TransportState,
    ) -> bool {
        let (tx, rx) = mpsc::channel();
        transport.on_state_changed(Box::new(move |state| {
            let _ = tx.send(state);
        }));
        if transport.state() == wanted {
            return true;
        }
        while let Ok(state) = rx.recv_timeout(Duration::from_secs(5)) {
            if state == wanted {
                return true;
            }
            if state == TransportState::Failed && wanted != TransportState::Failed {
                return false;
            }
        }
        false
    }

    #[test]
    fn test_handshake_completes_with_matching_fingerprints() {
        let (dtls_a, dtls_b, cert_a, cert_b) = transport_pair();
        dtls_a.set_remote_fingerprint(cert_b.fingerprint());
        dtls_b.set_remote_fingerprint(cert_a.fingerprint());
        dtls_b.start().unwrap();
        dtls_a.start().unwrap();
        assert!(wait_for_state(&dtls_a, TransportState::Connected));
        assert!(wait_for_state(&dtls_b, TransportState::Connected));
    }

    #[test]
    fn test_fingerprint_mismatch_fails_transport() {
        let (dtls_a, dtls_b, cert_a, _cert_b) = transport_pair();
        // Wrong fingerprint on the client side.
        dtls_a.set_remote_fingerprint(cert_a.fingerprint());
        dtls_b.set_remote_fingerprint(cert_a.fingerprint());
        dtls_b.start().unwrap();
        dtls_a.start().unwrap();
        assert!(wait_for_state(&dtls_a, TransportState::Failed));
    }

    #[test]
    fn test_verify_callback_overrides_comparison() {
        let (dtls_a, dtls_b, cert_a, _cert_b) = transport_pair();
        dtls_a.set_verify_callback(Box::new(|_| true));
        dtls_b.set_remote_fingerprint(cert_a.fingerprint());
        dtls_b.start().unwrap();
        dtls_a.start().unwrap();
        assert!(wait_for_state(&dtls_a, TransportState::Connected));
    }

    #[test]
    fn test_application_data_flows_after_handshake() {
        let (dtls_a, dtls_b, cert_a, cert_b) = transport_pair();
        dtls_a.set_remote_fingerprint(cert_b.fingerprint());
        dtls_b.set_remote_fingerprint(cert_a.fingerprint());

        let (tx, rx) = mpsc::channel();
        dtls_b.on_packet_received(Box::new(move |packet| {
            tx.send(packet.data().to_vec()).unwrap();
        }));

        dtls_b.start().unwrap();
        dtls_a.start().unwrap();
        assert!(wait_for_state(&dtls_a, TransportState::Connected));

        dtls_a
            .send(CopyOnWriteBuffer::from_slice(b"sctp-bytes"))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"sctp-bytes".to_vec()
        );
    }

    #[test]
    fn test_export_requires_connection() {
        let (dtls_a, _dtls_b, _cert_a, _cert_b) = transport_pair();
        assert!(dtls_a
            .export_keying_material("EXTRACTOR-dtls_srtp", 60)
            .is_err());
    }
}
