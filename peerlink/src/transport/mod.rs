//! The layered transport pipeline: `ICE → DTLS → {SRTP | SCTP}`.
//!
//! Every transport is confined to a task queue: state changes and packet
//! delivery happen as tasks on that queue, and the registered callbacks are
//! only ever invoked there. Stacking is a chain; each layer registers its
//! receive hook on the layer below and sends through it.

pub mod certificate;
pub mod dtls;
pub mod dtls_srtp;
pub mod ice;
pub mod sctp;

pub use certificate::Certificate;
pub use dtls::{DtlsRecordMachine, DtlsTransport};
pub use dtls_srtp::DtlsSrtpTransport;
pub use ice::{IceAgent, IceTransport};
pub use sctp::{SctpMessage, SctpTransport};

use std::sync::{Arc, Mutex};

use shared::error::{Error, Result};
use shared::{CopyOnWriteBuffer, TaskQueue};

/// Connection state of a transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Completed,
    Failed,
}

pub type PacketReceivedCallback = Box<dyn FnMut(CopyOnWriteBuffer) + Send>;
pub type StateChangedCallback = Box<dyn FnMut(TransportState) + Send>;

/// Downward-facing surface every transport layer exposes to the one above.
pub trait Transport: Send + Sync {
    /// Queues `packet` for transmission through this layer.
    /// A stopped transport returns [`Error::TransportStopped`].
    fn send(&self, packet: CopyOnWriteBuffer) -> Result<usize>;

    fn state(&self) -> TransportState;

    /// Installs the single packet-received callback. Invoked on the
    /// transport's confining queue only.
    fn on_packet_received(&self, callback: PacketReceivedCallback);

    /// Installs the state-changed callback.
    fn on_state_changed(&self, callback: StateChangedCallback);

    /// Stops the transport: further sends fail and inbound data is ignored.
    fn stop(&self);
}

/// Shared plumbing embedded by the concrete transports: the confining
/// queue, the state machine and the two callbacks.
pub(crate) struct TransportCore {
    queue: TaskQueue,
    inner: Mutex<CoreInner>,
}

struct CoreInner {
    state: TransportState,
    stopped: bool,
    packet_callback: Option<PacketReceivedCallback>,
    state_callback: Option<StateChangedCallback>,
}

impl TransportCore {
    pub fn new(queue: TaskQueue) -> Arc<TransportCore> {
        Arc::new(TransportCore {
            queue,
            inner: Mutex::new(CoreInner {
                state: TransportState::Disconnected,
                stopped: false,
                packet_callback: None,
                state_callback: None,
            }),
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
    }

    pub fn set_packet_callback(&self, callback: PacketReceivedCallback) {
        self.inner.lock().unwrap().packet_callback = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateChangedCallback) {
        self.inner.lock().unwrap().state_callback = Some(callback);
    }

    /// Transitions the state and fires the callback on the confining queue.
    pub fn set_state(self: &Arc<Self>, state: TransportState) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        let core = Arc::clone(self);
        self.queue.dispatch(move || {
            let mut inner = core.inner.lock().unwrap();
            if let Some(callback) = inner.state_callback.as_mut() {
                callback(state);
            }
        });
    }

    /// Delivers an inbound packet to the registered callback on the
    /// confining queue. A stopped transport drops it.
    pub fn deliver(self: &Arc<Self>, packet: CopyOnWriteBuffer) {
        let core = Arc::clone(self);
        self.queue.dispatch(move || {
            let mut inner = core.inner.lock().unwrap();
            if inner.stopped {
                return;
            }
            if let Some(callback) = inner.packet_callback.as_mut() {
                callback(packet);
            }
        });
    }

    /// Guard used by senders.
    pub fn check_send(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::TransportStopped);
        }
        Ok(())
    }
}
