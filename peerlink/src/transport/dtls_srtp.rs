//! DTLS-SRTP transport: exports keying material on handshake completion
//! and switches the media path to SRTP encrypt/decrypt.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use shared::error::{Error, Result};
use shared::CopyOnWriteBuffer;
use srtp::{partition_keying_material, SrtpContext, SrtpKeyingMaterial, KEYING_MATERIAL_LEN};

use super::dtls::{is_dtls_record, DtlsTransport};
use super::{PacketReceivedCallback, StateChangedCallback, Transport, TransportState};

/// RFC 5764 exporter label.
pub const DTLS_SRTP_EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Second-byte payload types 64..=95 mark RTCP within a muxed stream.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (64..=95).contains(&(data[1] & 0x7F))
}

/// RTP version 2 and not RTCP.
pub fn is_rtp(data: &[u8]) -> bool {
    data.len() >= 12 && data[0] >> 6 == 2 && !is_rtcp(data)
}

/// A decrypted media packet coming up the stack.
pub enum MediaPacket {
    Rtp(CopyOnWriteBuffer),
    Rtcp(CopyOnWriteBuffer),
}

pub type MediaPacketCallback = Box<dyn FnMut(MediaPacket) + Send>;

/// SRTP layer bonded to a DTLS transport over the same ICE chain.
pub struct DtlsSrtpTransport {
    dtls: Arc<DtlsTransport>,
    srtp_in: Mutex<Option<SrtpContext>>,
    srtp_out: Mutex<Option<SrtpContext>>,
    keys: Mutex<Option<SrtpKeyingMaterial>>,
    media_callback: Arc<Mutex<Option<MediaPacketCallback>>>,
    dropped_packets: Mutex<u64>,
}

impl DtlsSrtpTransport {
    pub fn new(dtls: Arc<DtlsTransport>) -> Arc<DtlsSrtpTransport> {
        let transport = Arc::new(DtlsSrtpTransport {
            dtls: Arc::clone(&dtls),
            srtp_in: Mutex::new(None),
            srtp_out: Mutex::new(None),
            keys: Mutex::new(None),
            media_callback: Arc::new(Mutex::new(None)),
            dropped_packets: Mutex::new(0),
        });

        // Key derivation runs the moment the handshake finishes.
        let keying = Arc::clone(&transport);
        dtls.on_handshake_done(Box::new(move || {
            if let Err(e) = keying.init_srtp() {
                warn!("srtp init failed: {e}");
            }
        }));

        // This layer owns the demultiplexing of the shared packet stream:
        // DTLS records go to the record machine, everything RTP-shaped goes
        // through SRTP.
        let router = Arc::clone(&transport);
        dtls.lower().on_packet_received(Box::new(move |packet| {
            router.route_incoming(packet);
        }));

        transport
    }

    pub fn dtls(&self) -> &Arc<DtlsTransport> {
        &self.dtls
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.dtls.start()
    }

    pub fn set_remote_fingerprint(&self, fingerprint: &str) {
        self.dtls.set_remote_fingerprint(fingerprint);
    }

    pub fn on_media_packet(&self, callback: MediaPacketCallback) {
        *self.media_callback.lock().unwrap() = Some(callback);
    }

    /// Derives `client_key|server_key|client_salt|server_salt` and builds
    /// the two protection contexts.
    fn init_srtp(&self) -> Result<()> {
        debug!("deriving srtp keying material");
        let material = self
            .dtls
            .export_keying_material(DTLS_SRTP_EXPORTER_LABEL, KEYING_MATERIAL_LEN)?;
        let keys = partition_keying_material(&material)?;

        let (outbound, inbound) = if self.dtls.is_client() {
            (&keys.client_write, &keys.server_write)
        } else {
            (&keys.server_write, &keys.client_write)
        };
        *self.srtp_out.lock().unwrap() = Some(SrtpContext::new(outbound));
        *self.srtp_in.lock().unwrap() = Some(SrtpContext::new(inbound));
        *self.keys.lock().unwrap() = Some(keys);
        Ok(())
    }

    pub fn is_srtp_ready(&self) -> bool {
        self.srtp_out.lock().unwrap().is_some()
    }

    pub(crate) fn keying_material(&self) -> Option<SrtpKeyingMaterial> {
        self.keys.lock().unwrap().clone()
    }

    fn route_incoming(self: &Arc<Self>, packet: CopyOnWriteBuffer) {
        let data = packet.data();
        if is_dtls_record(data) {
            self.dtls.handle_record(data);
            return;
        }
        if is_rtcp(data) {
            match self.unprotect(data, true) {
                Some(plain) => self.deliver(MediaPacket::Rtcp(plain)),
                None => self.count_drop("srtcp"),
            }
        } else if is_rtp(data) {
            match self.unprotect(data, false) {
                Some(plain) => self.deliver(MediaPacket::Rtp(plain)),
                None => self.count_drop("srtp"),
            }
        } else {
            self.count_drop("unclassified");
        }
    }

    fn unprotect(&self, data: &[u8], rtcp: bool) -> Option<CopyOnWriteBuffer> {
        let mut guard = self.srtp_in.lock().unwrap();
        let context = guard.as_mut()?;
        let result = if rtcp {
            context.unprotect_rtcp(data)
        } else {
            context.unprotect_rtp(data)
        };
        match result {
            Ok(plain) => Some(CopyOnWriteBuffer::from(plain)),
            Err(e) => {
                debug!("srtp unprotect failed: {e}");
                None
            }
        }
    }

    fn deliver(&self, packet: MediaPacket) {
        if let Some(callback) = self.media_callback.lock().unwrap().as_mut() {
            callback(packet);
        }
    }

    fn count_drop(&self, kind: &str) {
        let mut counter = self.dropped_packets.lock().unwrap();
        *counter += 1;
        debug!("dropped {kind} packet ({} total)", *counter);
    }

    pub fn dropped_packets(&self) -> u64 {
        *self.dropped_packets.lock().unwrap()
    }

    /// Protects and sends one RTP packet.
    pub fn send_rtp(&self, packet: &[u8]) -> Result<usize> {
        let protected = {
            let mut guard = self.srtp_out.lock().unwrap();
            let context = guard
                .as_mut()
                .ok_or_else(|| Error::UnexpectedState("srtp not ready".to_string()))?;
            context.protect_rtp(packet)?
        };
        self.dtls.lower().send(CopyOnWriteBuffer::from(protected))
    }

    /// Protects and sends one RTCP compound packet.
    pub fn send_rtcp(&self, packet: &[u8]) -> Result<usize> {
        let protected = {
            let mut guard = self.srtp_out.lock().unwrap();
            let context = guard
                .as_mut()
                .ok_or_else(|| Error::UnexpectedState("srtp not ready".to_string()))?;
            context.protect_rtcp(packet)?
        };
        self.dtls.lower().send(CopyOnWriteBuffer::from(protected))
    }
}

impl Transport for DtlsSrtpTransport {
    /// Classifies by wire shape and protects accordingly.
    fn send(&self, packet: CopyOnWriteBuffer) -> Result<usize> {
        if is_rtcp(packet.data()) {
            self.send_rtcp(packet.data())
        } else {
            self.send_rtp(packet.data())
        }
    }

    fn state(&self) -> TransportState {
        self.dtls.state()
    }

    fn on_packet_received(&self, callback: PacketReceivedCallback) {
        // Raw access: both kinds of decrypted packets, unclassified.
        let mut callback = callback;
        self.on_media_packet(Box::new(move |packet| match packet {
            MediaPacket::Rtp(data) | MediaPacket::Rtcp(data) => callback(data),
        }));
    }

    fn on_state_changed(&self, callback: StateChangedCallback) {
        self.dtls.on_state_changed(callback);
    }

    fn stop(&self) {
        self.dtls.stop();
    }
}
