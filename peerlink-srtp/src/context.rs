//! SRTP/SRTCP protection contexts (AES-CM-128 + HMAC-SHA1-80).

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use shared::error::{Error, Result};

use crate::kdf::{derive, KdfLabel};
use crate::replay::ReplayWindow;
use crate::{MasterKey, AES_128_KEY_LEN, AUTH_KEY_LEN, AUTH_TAG_LEN, SALT_LEN};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

const RTP_FIXED_HEADER: usize = 12;
const RTCP_HEADER_AND_SSRC: usize = 8;
const RTCP_E_FLAG: u32 = 0x8000_0000;
const RTCP_INDEX_SIZE: usize = 4;

/// Session keys for one direction of one protocol (RTP or RTCP).
struct SessionKeys {
    cipher_key: [u8; AES_128_KEY_LEN],
    salt: [u8; SALT_LEN],
    auth_key: [u8; AUTH_KEY_LEN],
}

impl SessionKeys {
    fn derive_for_rtp(master: &MasterKey) -> SessionKeys {
        let mut keys = SessionKeys {
            cipher_key: [0; AES_128_KEY_LEN],
            salt: [0; SALT_LEN],
            auth_key: [0; AUTH_KEY_LEN],
        };
        derive(&master.key, &master.salt, KdfLabel::RtpEncryption, &mut keys.cipher_key);
        derive(&master.key, &master.salt, KdfLabel::RtpSalt, &mut keys.salt);
        derive(&master.key, &master.salt, KdfLabel::RtpAuthentication, &mut keys.auth_key);
        keys
    }

    fn derive_for_rtcp(master: &MasterKey) -> SessionKeys {
        let mut keys = SessionKeys {
            cipher_key: [0; AES_128_KEY_LEN],
            salt: [0; SALT_LEN],
            auth_key: [0; AUTH_KEY_LEN],
        };
        derive(&master.key, &master.salt, KdfLabel::RtcpEncryption, &mut keys.cipher_key);
        derive(&master.key, &master.salt, KdfLabel::RtcpSalt, &mut keys.salt);
        derive(&master.key, &master.salt, KdfLabel::RtcpAuthentication, &mut keys.auth_key);
        keys
    }

    /// AES-CM counter block: `(salt << 16) ^ (ssrc << 64) ^ (index << 16)`.
    fn counter_block(&self, ssrc: u32, index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..SALT_LEN].copy_from_slice(&self.salt);
        for (i, byte) in ssrc.to_be_bytes().iter().enumerate() {
            iv[4 + i] ^= byte;
        }
        for (i, byte) in index.to_be_bytes()[2..8].iter().enumerate() {
            iv[8 + i] ^= byte;
        }
        iv
    }

    fn crypt(&self, ssrc: u32, index: u64, data: &mut [u8]) {
        let iv = self.counter_block(ssrc, index);
        let mut cipher = Aes128Ctr::new((&self.cipher_key).into(), (&iv).into());
        cipher.apply_keystream(data);
    }

    fn tag(&self, parts: &[&[u8]]) -> [u8; AUTH_TAG_LEN] {
        let mut mac =
            HmacSha1::new_from_slice(&self.auth_key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; AUTH_TAG_LEN];
        tag.copy_from_slice(&full[..AUTH_TAG_LEN]);
        tag
    }
}

/// One direction of an SRTP session: protects (or unprotects) both RTP and
/// RTCP under a single master key.
///
/// Outbound contexts tolerate re-sending the same index (retransmission
/// paths re-protect packets); inbound contexts enforce the replay window.
pub struct SrtpContext {
    rtp_keys: SessionKeys,
    rtcp_keys: SessionKeys,

    // RTP index state: rollover counter and highest sequence seen.
    roc: u32,
    last_seq: Option<u16>,
    rtp_replay: ReplayWindow,

    // RTCP index state.
    next_rtcp_index: u32,
    rtcp_replay: ReplayWindow,
}

impl SrtpContext {
    pub fn new(master: &MasterKey) -> SrtpContext {
        SrtpContext {
            rtp_keys: SessionKeys::derive_for_rtp(master),
            rtcp_keys: SessionKeys::derive_for_rtcp(master),
            roc: 0,
            last_seq: None,
            rtp_replay: ReplayWindow::new(),
            next_rtcp_index: 0,
            rtcp_replay: ReplayWindow::new(),
        }
    }

    /// RFC 3711 packet-index estimation from the rollover counter and the
    /// highest sequence number seen.
    fn estimate_index(&self, seq: u16) -> (u32, u64) {
        let (roc, s_l) = (self.roc, self.last_seq);
        let v = match s_l {
            None => roc,
            Some(s_l) => {
                if s_l < 0x8000 {
                    if seq > s_l && seq - s_l > 0x8000 {
                        roc.wrapping_sub(1)
                    } else {
                        roc
                    }
                } else if s_l - 0x8000 > seq {
                    roc.wrapping_add(1)
                } else {
                    roc
                }
            }
        };
        (v, ((v as u64) << 16) | seq as u64)
    }

    fn advance_rtp_index(&mut self, v: u32, seq: u16) {
        match self.last_seq {
            None => {
                self.last_seq = Some(seq);
            }
            Some(s_l) => {
                if v == self.roc {
                    if seq > s_l {
                        self.last_seq = Some(seq);
                    }
                } else if v == self.roc.wrapping_add(1) {
                    self.roc = v;
                    self.last_seq = Some(seq);
                }
            }
        }
    }

    /// Encrypts and authenticates one RTP packet, returning the SRTP wire
    /// image (payload encrypted in place, tag appended).
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < RTP_FIXED_HEADER {
            return Err(Error::SrtpError("rtp packet too short".to_string()));
        }
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let header_size = rtp_header_size(packet)?;

        let (v, index) = self.estimate_index(seq);
        self.advance_rtp_index(v, seq);

        let mut out = Vec::with_capacity(packet.len() + AUTH_TAG_LEN);
        out.extend_from_slice(packet);
        self.rtp_keys.crypt(ssrc, index, &mut out[header_size..]);

        let tag = self.rtp_keys.tag(&[&out, &v.to_be_bytes()]);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verifies and decrypts one SRTP packet.
    pub fn unprotect_rtp(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < RTP_FIXED_HEADER + AUTH_TAG_LEN {
            return Err(Error::SrtpError("srtp packet too short".to_string()));
        }
        let (body, tag) = data.split_at(data.len() - AUTH_TAG_LEN);
        let seq = u16::from_be_bytes([body[2], body[3]]);
        let ssrc = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        let header_size = rtp_header_size(body)?;

        let (v, index) = self.estimate_index(seq);
        let expected = self.rtp_keys.tag(&[body, &v.to_be_bytes()]);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }
        if !self.rtp_replay.check_and_update(index) {
            return Err(Error::SrtpReplay);
        }
        self.advance_rtp_index(v, seq);

        let mut out = body.to_vec();
        self.rtp_keys.crypt(ssrc, index, &mut out[header_size..]);
        Ok(out)
    }

    /// Encrypts and authenticates one RTCP compound packet.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < RTCP_HEADER_AND_SSRC {
            return Err(Error::SrtpError("rtcp packet too short".to_string()));
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = self.next_rtcp_index & 0x7FFF_FFFF;
        self.next_rtcp_index = self.next_rtcp_index.wrapping_add(1);

        let mut out = Vec::with_capacity(packet.len() + RTCP_INDEX_SIZE + AUTH_TAG_LEN);
        out.extend_from_slice(packet);
        self.rtcp_keys
            .crypt(ssrc, index as u64, &mut out[RTCP_HEADER_AND_SSRC..]);
        out.extend_from_slice(&(index | RTCP_E_FLAG).to_be_bytes());

        let tag = self.rtcp_keys.tag(&[&out]);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verifies and decrypts one SRTCP packet.
    pub fn unprotect_rtcp(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < RTCP_HEADER_AND_SSRC + RTCP_INDEX_SIZE + AUTH_TAG_LEN {
            return Err(Error::SrtpError("srtcp packet too short".to_string()));
        }
        let (body, tag) = data.split_at(data.len() - AUTH_TAG_LEN);
        let expected = self.rtcp_keys.tag(&[body]);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        let (payload, index_bytes) = body.split_at(body.len() - RTCP_INDEX_SIZE);
        let index_word = u32::from_be_bytes(index_bytes.try_into().unwrap());
        let encrypted = index_word & RTCP_E_FLAG != 0;
        let index = index_word & 0x7FFF_FFFF;
        if !self.rtcp_replay.check_and_update(index as u64) {
            return Err(Error::SrtpReplay);
        }

        let ssrc = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let mut out = payload.to_vec();
        if encrypted {
            self.rtcp_keys
                .crypt(ssrc, index as u64, &mut out[RTCP_HEADER_AND_SSRC..]);
        }
        Ok(out)
    }
}

/// Size of the RTP header (fixed part, CSRCs and extension block).
fn rtp_header_size(packet: &[u8]) -> Result<usize> {
    let csrc_count = (packet[0] & 0x0F) as usize;
    let mut size = RTP_FIXED_HEADER + 4 * csrc_count;
    if packet[0] & 0x10 != 0 {
        if packet.len() < size + 4 {
            return Err(Error::SrtpError("extension header truncated".to_string()));
        }
        let words = u16::from_be_bytes([packet[size + 2], packet[size + 3]]) as usize;
        size += 4 + words * 4;
    }
    if packet.len() < size {
        return Err(Error::SrtpError("header overruns packet".to_string()));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterKey {
        MasterKey {
            key: [7u8; AES_128_KEY_LEN],
            salt: [3u8; SALT_LEN],
        }
    }

    fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, 96, 0, 0, 0, 0, 0, 1, 0xDE, 0xAD, 0xBE, 0xEF];
        packet[2..4].copy_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn rtcp_packet() -> Vec<u8> {
        // Minimal RR: header + sender ssrc.
        vec![0x80, 201, 0, 1, 0x11, 0x22, 0x33, 0x44]
    }

    #[test]
    fn test_rtp_protect_unprotect_round_trip() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());

        for seq in 0..20u16 {
            let plain = rtp_packet(seq, &[seq as u8; 50]);
            let protected = sender.protect_rtp(&plain).unwrap();
            assert_eq!(protected.len(), plain.len() + AUTH_TAG_LEN);
            // The header stays in the clear, the payload does not.
            assert_eq!(&protected[..12], &plain[..12]);
            assert_ne!(&protected[12..plain.len()], &plain[12..]);
            let unprotected = receiver.unprotect_rtp(&protected).unwrap();
            assert_eq!(unprotected, plain);
        }
    }

    #[test]
    fn test_rtp_tampering_detected() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());
        let mut protected = sender.protect_rtp(&rtp_packet(1, &[1, 2, 3])).unwrap();
        protected[13] ^= 0xFF;
        assert_eq!(
            receiver.unprotect_rtp(&protected),
            Err(Error::SrtpAuthFailed)
        );
    }

    #[test]
    fn test_rtp_replay_rejected() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());
        let protected = sender.protect_rtp(&rtp_packet(5, &[9; 10])).unwrap();
        assert!(receiver.unprotect_rtp(&protected).is_ok());
        assert_eq!(receiver.unprotect_rtp(&protected), Err(Error::SrtpReplay));
    }

    #[test]
    fn test_repeat_tx_allowed_on_sender() {
        let mut sender = SrtpContext::new(&master());
        let plain = rtp_packet(7, &[4; 8]);
        let first = sender.protect_rtp(&plain).unwrap();
        // Re-protecting the same packet (retransmission) must produce the
        // same wire bytes rather than an error.
        let second = sender.protect_rtp(&plain).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_roc_advances_across_wrap() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());
        for seq in [0xFFFE_u16, 0xFFFF, 0, 1] {
            let plain = rtp_packet(seq, &[seq as u8; 4]);
            let protected = sender.protect_rtp(&plain).unwrap();
            assert_eq!(receiver.unprotect_rtp(&protected).unwrap(), plain);
        }
        assert_eq!(sender.roc, 1);
        assert_eq!(receiver.roc, 1);
    }

    #[test]
    fn test_rtcp_round_trip_with_index() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());
        for _ in 0..3 {
            let plain = rtcp_packet();
            let protected = sender.protect_rtcp(&plain).unwrap();
            assert_eq!(
                protected.len(),
                plain.len() + RTCP_INDEX_SIZE + AUTH_TAG_LEN
            );
            let unprotected = receiver.unprotect_rtcp(&protected).unwrap();
            assert_eq!(unprotected, plain);
        }
    }

    #[test]
    fn test_rtcp_replay_rejected() {
        let mut sender = SrtpContext::new(&master());
        let mut receiver = SrtpContext::new(&master());
        let protected = sender.protect_rtcp(&rtcp_packet()).unwrap();
        assert!(receiver.unprotect_rtcp(&protected).is_ok());
        assert_eq!(
            receiver.unprotect_rtcp(&protected),
            Err(Error::SrtpReplay)
        );
    }
}
