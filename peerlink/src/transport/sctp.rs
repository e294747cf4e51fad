//! SCTP transport: a thin adapter over an external association engine,
//! carrying data-channel messages over the DTLS layer.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use shared::error::{Error, Result};
use shared::{CopyOnWriteBuffer, TaskQueue};

use super::{
    PacketReceivedCallback, StateChangedCallback, Transport, TransportCore, TransportState,
};

pub const DEFAULT_SCTP_PORT: u16 = 5000;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const MAX_STREAM_ID: u16 = 1023;

/// Kind of one SCTP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SctpMessageType {
    Binary,
    String,
    Control,
    Reset,
}

/// Partial-reliability policy of a stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityPolicy {
    /// Fully reliable.
    #[default]
    None,
    /// Limited retransmissions; `rexmit` is the retry count.
    Rtx,
    /// Limited lifetime; `rexmit` is the time to live in milliseconds.
    Ttl,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reliability {
    pub policy: ReliabilityPolicy,
    pub unordered: bool,
    pub rexmit: u32,
}

/// One message crossing the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpMessage {
    pub payload: CopyOnWriteBuffer,
    pub message_type: SctpMessageType,
    pub stream_id: u16,
    pub reliability: Reliability,
}

impl SctpMessage {
    pub fn binary(stream_id: u16, payload: &[u8]) -> SctpMessage {
        SctpMessage {
            payload: CopyOnWriteBuffer::from_slice(payload),
            message_type: SctpMessageType::Binary,
            stream_id,
            reliability: Reliability::default(),
        }
    }

    pub fn text(stream_id: u16, payload: &str) -> SctpMessage {
        SctpMessage {
            payload: CopyOnWriteBuffer::from_slice(payload.as_bytes()),
            message_type: SctpMessageType::String,
            stream_id,
            reliability: Reliability::default(),
        }
    }
}

/// The external SCTP engine (a usrsctp equivalent).
pub trait SctpAssociation: Send {
    fn connect(&mut self, local_port: u16, remote_port: u16) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;

    fn send_message(&mut self, message: SctpMessage) -> Result<()>;

    /// Feeds raw bytes received over DTLS; returns completed inbound
    /// messages.
    fn handle_transport_data(&mut self, data: &[u8]) -> Result<Vec<SctpMessage>>;

    /// Wire datagrams the association wants transmitted.
    fn poll_transmit(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

pub type MessageCallback = Box<dyn FnMut(SctpMessage) + Send>;

/// Carries [`SctpMessage`]s over the DTLS transport below it.
pub struct SctpTransport {
    core: Arc<TransportCore>,
    lower: Arc<dyn Transport>,
    association: Mutex<Box<dyn SctpAssociation>>,
    local_port: u16,
    remote_port: Mutex<u16>,
    max_message_size: usize,
    message_callback: Arc<Mutex<Option<MessageCallback>>>,
}

impl SctpTransport {
    pub fn new(
        lower: Arc<dyn Transport>,
        association: Box<dyn SctpAssociation>,
        queue: TaskQueue,
    ) -> Arc<SctpTransport> {
        let transport = Arc::new(SctpTransport {
            core: TransportCore::new(queue),
            lower,
            association: Mutex::new(association),
            local_port: DEFAULT_SCTP_PORT,
            remote_port: Mutex::new(DEFAULT_SCTP_PORT),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_callback: Arc::new(Mutex::new(None)),
        });

        // Application data surfacing from DTLS feeds the association.
        let incoming = Arc::clone(&transport);
        transport.lower.on_packet_received(Box::new(move |packet| {
            incoming.handle_lower_data(packet);
        }));
        transport
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn on_message(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    /// Connects the association towards `remote_port`.
    pub fn start(self: &Arc<Self>, remote_port: u16) -> Result<()> {
        *self.remote_port.lock().unwrap() = remote_port;
        self.core.set_state(TransportState::Connecting);
        self.association
            .lock()
            .unwrap()
            .connect(self.local_port, remote_port)?;
        self.flush_transmit();
        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    /// Sends one message; checks the stream-id range and the negotiated
    /// maximum message size.
    pub fn send_message(&self, message: SctpMessage) -> Result<()> {
        self.core.check_send()?;
        if message.stream_id > MAX_STREAM_ID {
            return Err(Error::StreamExhausted);
        }
        if message.payload.len() > self.max_message_size {
            return Err(Error::PacketTooBig);
        }
        self.association.lock().unwrap().send_message(message)?;
        self.flush_transmit();
        Ok(())
    }

    fn handle_lower_data(self: &Arc<Self>, packet: CopyOnWriteBuffer) {
        if self.core.is_stopped() {
            return;
        }
        let messages = match self
            .association
            .lock()
            .unwrap()
            .handle_transport_data(packet.data())
        {
            Ok(messages) => messages,
            Err(e) => {
                debug!("sctp association rejected data: {e}");
                return;
            }
        };
        self.flush_transmit();
        for message in messages {
            if let Some(callback) = self.message_callback.lock().unwrap().as_mut() {
                callback(message);
            }
        }
    }

    fn flush_transmit(&self) {
        let datagrams = self.association.lock().unwrap().poll_transmit();
        for datagram in datagrams {
            if let Err(e) = self.lower.send(CopyOnWriteBuffer::from(datagram)) {
                warn!("lower transport refused sctp datagram: {e}");
            }
        }
    }
}

impl Transport for SctpTransport {
    fn send(&self, packet: CopyOnWriteBuffer) -> Result<usize> {
        let len = packet.len();
        self.send_message(SctpMessage::binary(0, packet.data()))?;
        Ok(len)
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
        if let Err(e) = self.association.lock().unwrap().shutdown() {
            debug!("sctp shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LoopbackIceAgent, MockSctpAssociation};
    use crate::transport::ice::IceTransport;
    use sdp::Role;

    fn transport() -> Arc<SctpTransport> {
        let (agent, _peer) = LoopbackIceAgent::pair("u", "p");
        let ice = IceTransport::new(Box::new(agent), Role::Active, TaskQueue::new("ice"));
        SctpTransport::new(
            ice as Arc<dyn Transport>,
            Box::new(MockSctpAssociation::default()),
            TaskQueue::new("sctp"),
        )
    }

    #[test]
    fn test_defaults() {
        let sctp = transport();
        assert_eq!(sctp.local_port(), 5000);
        assert_eq!(sctp.max_message_size(), 262_144);
    }

    #[test]
    fn test_stream_id_range_enforced() {
        let sctp = transport();
        sctp.start(5000).unwrap();
        assert!(sctp.send_message(SctpMessage::binary(1023, b"ok")).is_ok());
        assert_eq!(
            sctp.send_message(SctpMessage::binary(1024, b"no")),
            Err(Error::StreamExhausted)
        );
    }

    #[test]
    fn test_oversized_message_rejected() {
        let sctp = transport();
        sctp.start(5000).unwrap();
        let big = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            sctp.send_message(SctpMessage::binary(0, &big)),
            Err(Error::PacketTooBig)
        );
    }

    #[test]
    fn test_send_before_start_fails() {
        let sctp = transport();
        assert!(sctp.send_message(SctpMessage::binary(0, b"x")).is_err());
    }

    #[test]
    fn test_stopped_transport_refuses_messages() {
        let sctp = transport();
        sctp.start(5000).unwrap();
        sctp.stop();
        assert_eq!(
            sctp.send_message(SctpMessage::binary(0, b"x")),
            Err(Error::TransportStopped)
        );
    }
}
