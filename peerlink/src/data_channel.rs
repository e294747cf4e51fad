//! Data channels over the SCTP transport.

use std::sync::{Arc, Mutex};

use shared::error::{Error, Result};
use shared::CopyOnWriteBuffer;

use crate::transport::sctp::{
    SctpMessage, SctpMessageType, SctpTransport, MAX_STREAM_ID,
};
pub use crate::transport::sctp::{Reliability, ReliabilityPolicy};

/// Creation parameters of a data channel.
#[derive(Debug, Default, Clone)]
pub struct DataChannelInit {
    pub label: String,
    pub protocol: String,
    pub reliability: Reliability,
    /// Pre-agreed stream id; otherwise the connection assigns one.
    pub stream_id: Option<u16>,
}

pub type DataMessageCallback = Box<dyn FnMut(CopyOnWriteBuffer, bool) + Send>;

/// One bidirectional message channel.
pub struct DataChannel {
    label: String,
    stream_id: u16,
    reliability: Reliability,
    sctp: Arc<SctpTransport>,
    message_callback: Mutex<Option<DataMessageCallback>>,
    closed: Mutex<bool>,
}

impl DataChannel {
    pub(crate) fn new(init: DataChannelInit, stream_id: u16, sctp: Arc<SctpTransport>) -> Arc<Self> {
        Arc::new(DataChannel {
            label: init.label,
            stream_id,
            reliability: init.reliability,
            sctp,
            message_callback: Mutex::new(None),
            closed: Mutex::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    /// `(payload, is_text)` per inbound message.
    pub fn on_message(&self, callback: DataMessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn deliver(&self, message: SctpMessage) {
        if *self.closed.lock().unwrap() {
            return;
        }
        let is_text = message.message_type == SctpMessageType::String;
        if let Some(callback) = self.message_callback.lock().unwrap().as_mut() {
            callback(message.payload, is_text);
        }
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(SctpMessageType::String, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_message(SctpMessageType::Binary, data)
    }

    fn send_message(&self, message_type: SctpMessageType, payload: &[u8]) -> Result<()> {
        if *self.closed.lock().unwrap() {
            return Err(Error::UnexpectedState("data channel closed".to_string()));
        }
        self.sctp.send_message(SctpMessage {
            payload: CopyOnWriteBuffer::from_slice(payload),
            message_type,
            stream_id: self.stream_id,
            reliability: self.reliability,
        })
    }

    /// Closes the channel by resetting its stream.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.sctp.send_message(SctpMessage {
            payload: CopyOnWriteBuffer::new(),
            message_type: SctpMessageType::Reset,
            stream_id: self.stream_id,
            reliability: Reliability::default(),
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// Allocates stream ids: DTLS clients use even ids, servers odd, so both
/// sides can open channels without colliding.
pub(crate) struct StreamIdAllocator {
    next: u16,
}

impl StreamIdAllocator {
    pub fn new(is_client: bool) -> Self {
        StreamIdAllocator {
            next: if is_client { 0 } else { 1 },
        }
    }

    pub fn allocate(&mut self) -> Result<u16> {
        if self.next > MAX_STREAM_ID {
            return Err(Error::StreamExhausted);
        }
        let id = self.next;
        self.next += 2;
        Ok(id)
    }
}
