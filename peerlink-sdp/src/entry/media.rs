use std::collections::BTreeMap;

use shared::error::{Error, Result};

use crate::defines::{Direction, Role};

/// Audio or video discriminator for a [`Media`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// One `a=rtpmap:` entry together with its `a=fmtp:` and `a=rtcp-fb:`
/// companions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// `a=fmtp:` value lines for this payload type, in insertion order.
    pub fmtps: Vec<String>,
    /// `a=rtcp-fb:` value lines for this payload type, in insertion order.
    pub rtcp_fbs: Vec<String>,
}

impl RtpMap {
    pub fn new(payload_type: u8, codec: &str, clock_rate: u32, channels: Option<u8>) -> Self {
        RtpMap {
            payload_type,
            codec: codec.to_string(),
            clock_rate,
            channels,
            fmtps: Vec::new(),
            rtcp_fbs: Vec::new(),
        }
    }

    pub fn add_fmtp(&mut self, fmtp: &str) {
        self.fmtps.push(fmtp.to_string());
    }

    pub fn add_feedback(&mut self, feedback: &str) {
        self.rtcp_fbs.push(feedback.to_string());
    }
}

/// Role of an SSRC within a media entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrcKind {
    Media,
    Rtx,
    Fec,
}

/// Attributes advertised for one SSRC via `a=ssrc:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcEntry {
    pub ssrc: u32,
    pub kind: SsrcKind,
    pub cname: Option<String>,
    pub msid: Option<String>,
    pub track_id: Option<String>,
}

/// An audio or video `m=` entry.
///
/// Media and repair SSRCs are associated positionally:
/// `media_ssrcs[i]` pairs with `rtx_ssrcs[i]` and `fec_ssrcs[i]`, which is
/// exactly the information carried by `a=ssrc-group:FID`/`FEC` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    kind: MediaKind,
    mid: String,
    protocols: String,
    direction: Direction,
    /// `b=AS:` bandwidth cap in kbps.
    bandwidth_max_kbps: Option<u32>,

    rtp_maps: BTreeMap<u8, RtpMap>,

    ssrc_entries: Vec<SsrcEntry>,
    media_ssrcs: Vec<u32>,
    rtx_ssrcs: Vec<u32>,
    fec_ssrcs: Vec<u32>,

    /// Header-extension id to uri.
    ext_maps: BTreeMap<u8, String>,

    // Per-entry overrides of the session-level ICE/DTLS parameters.
    ice_ufrag: Option<String>,
    ice_pwd: Option<String>,
    fingerprint: Option<String>,
    role: Option<Role>,

    /// Unknown attribute lines, preserved verbatim.
    extra_attributes: Vec<String>,
}

impl Media {
    pub fn new(kind: MediaKind, mid: &str, protocols: &str, direction: Direction) -> Self {
        Media {
            kind,
            mid: mid.to_string(),
            protocols: protocols.to_string(),
            direction,
            bandwidth_max_kbps: None,
            rtp_maps: BTreeMap::new(),
            ssrc_entries: Vec::new(),
            media_ssrcs: Vec::new(),
            rtx_ssrcs: Vec::new(),
            fec_ssrcs: Vec::new(),
            ext_maps: BTreeMap::new(),
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            role: None,
            extra_attributes: Vec::new(),
        }
    }

    pub fn audio(mid: &str, protocols: &str, direction: Direction) -> Self {
        Media::new(MediaKind::Audio, mid, protocols, direction)
    }

    pub fn video(mid: &str, protocols: &str, direction: Direction) -> Self {
        Media::new(MediaKind::Video, mid, protocols, direction)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn set_mid(&mut self, mid: &str) {
        self.mid = mid.to_string();
    }

    pub fn protocols(&self) -> &str {
        &self.protocols
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn bandwidth_max_kbps(&self) -> Option<u32> {
        self.bandwidth_max_kbps
    }

    pub fn set_bandwidth_max_kbps(&mut self, kbps: Option<u32>) {
        self.bandwidth_max_kbps = kbps;
    }

    // ICE/DTLS overrides.

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.ice_ufrag.as_deref()
    }

    pub fn set_ice_ufrag(&mut self, ufrag: Option<String>) {
        self.ice_ufrag = ufrag;
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.ice_pwd.as_deref()
    }

    pub fn set_ice_pwd(&mut self, pwd: Option<String>) {
        self.ice_pwd = pwd;
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn set_fingerprint(&mut self, fingerprint: Option<String>) {
        self.fingerprint = fingerprint;
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_role(&mut self, role: Option<Role>) {
        self.role = role;
    }

    // Codec maps.

    pub fn rtp_maps(&self) -> impl Iterator<Item = &RtpMap> {
        self.rtp_maps.values()
    }

    pub fn rtp_map(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtp_maps.get(&payload_type)
    }

    pub fn rtp_map_mut(&mut self, payload_type: u8) -> Option<&mut RtpMap> {
        self.rtp_maps.get_mut(&payload_type)
    }

    pub fn payload_types(&self) -> impl Iterator<Item = u8> + '_ {
        self.rtp_maps.keys().copied()
    }

    pub fn has_payload_type(&self, payload_type: u8) -> bool {
        self.rtp_maps.contains_key(&payload_type)
    }

    pub fn add_rtp_map(&mut self, map: RtpMap) {
        self.rtp_maps.insert(map.payload_type, map);
    }

    /// Adds an audio codec map, e.g. opus 111/48000/2.
    pub fn add_audio_codec(
        &mut self,
        payload_type: u8,
        codec: &str,
        clock_rate: u32,
        channels: Option<u8>,
        fmtp: Option<&str>,
    ) {
        let mut map = RtpMap::new(payload_type, codec, clock_rate, channels);
        if let Some(fmtp) = fmtp {
            map.add_fmtp(fmtp);
        }
        self.add_rtp_map(map);
    }

    /// Adds a video codec map at the fixed 90 kHz video clock, with the
    /// feedback entries every video stream negotiates.
    pub fn add_video_codec(&mut self, payload_type: u8, codec: &str, fmtp: Option<&str>) {
        let mut map = RtpMap::new(payload_type, codec, 90_000, None);
        if let Some(fmtp) = fmtp {
            map.add_fmtp(fmtp);
        }
        map.add_feedback("nack");
        map.add_feedback("nack pli");
        map.add_feedback("goog-remb");
        self.add_rtp_map(map);
    }

    /// Adds an RTX codec map bound to `apt` (the protected payload type).
    pub fn add_rtx_codec(&mut self, payload_type: u8, apt: u8, clock_rate: u32) {
        let mut map = RtpMap::new(payload_type, "rtx", clock_rate, None);
        map.add_fmtp(&format!("apt={apt}"));
        self.add_rtp_map(map);
    }

    // SSRC bookkeeping.

    pub fn ssrc_entries(&self) -> &[SsrcEntry] {
        &self.ssrc_entries
    }

    pub fn ssrc_entry(&self, ssrc: u32) -> Option<&SsrcEntry> {
        self.ssrc_entries.iter().find(|e| e.ssrc == ssrc)
    }

    pub fn media_ssrcs(&self) -> &[u32] {
        &self.media_ssrcs
    }

    pub fn rtx_ssrcs(&self) -> &[u32] {
        &self.rtx_ssrcs
    }

    pub fn fec_ssrcs(&self) -> &[u32] {
        &self.fec_ssrcs
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.ssrc_entries.iter().any(|e| e.ssrc == ssrc)
    }

    pub fn add_ssrc(&mut self, entry: SsrcEntry) {
        match entry.kind {
            SsrcKind::Media => self.media_ssrcs.push(entry.ssrc),
            SsrcKind::Rtx => self.rtx_ssrcs.push(entry.ssrc),
            SsrcKind::Fec => self.fec_ssrcs.push(entry.ssrc),
        }
        self.ssrc_entries.push(entry);
    }

    /// Installs a fully-assembled SSRC layout, used by the parser once all
    /// `ssrc:` and `ssrc-group:` lines of an entry are known.
    pub(crate) fn set_ssrc_state(
        &mut self,
        entries: Vec<SsrcEntry>,
        media_ssrcs: Vec<u32>,
        rtx_ssrcs: Vec<u32>,
        fec_ssrcs: Vec<u32>,
    ) {
        self.ssrc_entries = entries;
        self.media_ssrcs = media_ssrcs;
        self.rtx_ssrcs = rtx_ssrcs;
        self.fec_ssrcs = fec_ssrcs;
    }

    /// Associated RTX SSRC for a media SSRC, by position.
    pub fn rtx_ssrc_for(&self, media_ssrc: u32) -> Option<u32> {
        let index = self.media_ssrcs.iter().position(|s| *s == media_ssrc)?;
        self.rtx_ssrcs.get(index).copied()
    }

    /// Associated FEC SSRC for a media SSRC, by position.
    pub fn fec_ssrc_for(&self, media_ssrc: u32) -> Option<u32> {
        let index = self.media_ssrcs.iter().position(|s| *s == media_ssrc)?;
        self.fec_ssrcs.get(index).copied()
    }

    // Header extensions.

    pub fn ext_maps(&self) -> &BTreeMap<u8, String> {
        &self.ext_maps
    }

    pub fn add_ext_map(&mut self, id: u8, uri: &str) {
        self.ext_maps.insert(id, uri.to_string());
    }

    // Free-form attributes.

    pub fn extra_attributes(&self) -> &[String] {
        &self.extra_attributes
    }

    pub fn add_extra_attribute(&mut self, attribute: String) {
        self.extra_attributes.push(attribute);
    }

    /// Checks the structural invariants: every grouped SSRC appears in
    /// `ssrc_entries` with the matching kind, and positional pairs line up.
    pub fn validate(&self) -> Result<()> {
        if self.rtx_ssrcs.len() > self.media_ssrcs.len()
            || self.fec_ssrcs.len() > self.media_ssrcs.len()
        {
            return Err(Error::BadMediaConfiguration(format!(
                "mid {}: more repair ssrcs than media ssrcs",
                self.mid
            )));
        }
        let check = |ssrcs: &[u32], kind: SsrcKind| -> Result<()> {
            for ssrc in ssrcs {
                match self.ssrc_entry(*ssrc) {
                    Some(entry) if entry.kind == kind => {}
                    _ => {
                        return Err(Error::BadMediaConfiguration(format!(
                            "mid {}: ssrc {ssrc} missing or with wrong kind",
                            self.mid
                        )));
                    }
                }
            }
            Ok(())
        };
        check(&self.media_ssrcs, SsrcKind::Media)?;
        check(&self.rtx_ssrcs, SsrcKind::Rtx)?;
        check(&self.fec_ssrcs, SsrcKind::Fec)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_with_pairs() -> Media {
        let mut media = Media::video("1", "UDP/TLS/RTP/SAVPF", Direction::SendRecv);
        media.add_ssrc(SsrcEntry {
            ssrc: 100,
            kind: SsrcKind::Media,
            cname: Some("cname".into()),
            msid: None,
            track_id: None,
        });
        media.add_ssrc(SsrcEntry {
            ssrc: 200,
            kind: SsrcKind::Rtx,
            cname: Some("cname".into()),
            msid: None,
            track_id: None,
        });
        media.add_ssrc(SsrcEntry {
            ssrc: 300,
            kind: SsrcKind::Fec,
            cname: Some("cname".into()),
            msid: None,
            track_id: None,
        });
        media
    }

    #[test]
    fn test_positional_association() {
        let media = video_with_pairs();
        assert_eq!(media.rtx_ssrc_for(100), Some(200));
        assert_eq!(media.fec_ssrc_for(100), Some(300));
        assert_eq!(media.rtx_ssrc_for(999), None);
        media.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unbalanced_groups() {
        let mut media = Media::video("1", "UDP/TLS/RTP/SAVPF", Direction::SendRecv);
        media.add_ssrc(SsrcEntry {
            ssrc: 200,
            kind: SsrcKind::Rtx,
            cname: None,
            msid: None,
            track_id: None,
        });
        assert!(media.validate().is_err());
    }

    #[test]
    fn test_video_codec_defaults() {
        let mut media = Media::video("1", "UDP/TLS/RTP/SAVPF", Direction::SendRecv);
        media.add_video_codec(102, "H264", Some("packetization-mode=1"));
        let map = media.rtp_map(102).unwrap();
        assert_eq!(map.clock_rate, 90_000);
        assert!(map.rtcp_fbs.iter().any(|fb| fb == "nack pli"));
    }
}
