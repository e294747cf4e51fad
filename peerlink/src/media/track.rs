//! Media tracks: negotiated configuration plus the SDP entry it maps to.

use log::warn;
use rand::Rng;

use sdp::{Direction, Media, SsrcEntry, SsrcKind};

const MEDIA_PROTOCOLS: &str = "UDP/TLS/RTP/SAVPF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Opus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub codec: Codec,
    /// The fmtp profile line, e.g. H.264 `profile-level-id=…`.
    pub profile: Option<String>,
}

/// Everything needed to negotiate and run one outbound/inbound track.
#[derive(Debug, Clone)]
pub struct MediaTrackConfiguration {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    pub codecs: Vec<CodecParams>,

    pub payload_type: u8,
    pub rtx_payload_type: Option<u8>,
    pub red_payload_type: Option<u8>,
    pub ulpfec_payload_type: Option<u8>,

    pub media_ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub fec_ssrc: Option<u32>,

    pub cname: String,
    pub msid: Option<String>,
    pub track_id: Option<String>,
}

impl MediaTrackConfiguration {
    pub fn new(kind: MediaKind, mid: &str) -> Self {
        let mut rng = rand::thread_rng();
        MediaTrackConfiguration {
            kind,
            mid: mid.to_string(),
            direction: Direction::SendRecv,
            codecs: Vec::new(),
            payload_type: if kind == MediaKind::Video { 102 } else { 111 },
            rtx_payload_type: None,
            red_payload_type: None,
            ulpfec_payload_type: None,
            media_ssrc: rng.gen(),
            rtx_ssrc: None,
            fec_ssrc: None,
            cname: "peerlink".to_string(),
            msid: None,
            track_id: None,
        }
    }

    pub fn video(mid: &str) -> Self {
        let mut config = Self::new(MediaKind::Video, mid);
        config.add_codec(
            Codec::H264,
            Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
        );
        config
    }

    pub fn audio(mid: &str) -> Self {
        let mut config = Self::new(MediaKind::Audio, mid);
        config.add_codec(Codec::Opus, Some("minptime=10;useinbandfec=1"));
        config
    }

    /// Adds a codec; kind mismatches are refused.
    pub fn add_codec(&mut self, codec: Codec, profile: Option<&str>) -> bool {
        let valid = matches!(
            (self.kind, codec),
            (MediaKind::Audio, Codec::Opus) | (MediaKind::Video, Codec::H264)
        );
        if !valid {
            warn!("unsupported codec {codec:?} for {:?} track", self.kind);
            return false;
        }
        self.codecs.push(CodecParams {
            codec,
            profile: profile.map(str::to_string),
        });
        true
    }

    /// Enables RTX retransmission with the given payload type.
    pub fn enable_rtx(&mut self, rtx_payload_type: u8) {
        self.rtx_payload_type = Some(rtx_payload_type);
        if self.rtx_ssrc.is_none() {
            self.rtx_ssrc = Some(rand::thread_rng().gen());
        }
    }

    /// Enables ULPFEC-over-RED protection with the given payload types.
    pub fn enable_ulpfec(&mut self, red_payload_type: u8, ulpfec_payload_type: u8) {
        self.red_payload_type = Some(red_payload_type);
        self.ulpfec_payload_type = Some(ulpfec_payload_type);
        // ULPFEC rides the media SSRC; the group still names it.
        if self.fec_ssrc.is_none() {
            self.fec_ssrc = Some(self.media_ssrc);
        }
    }

    /// Renders this configuration into an SDP media entry.
    pub fn build_media_entry(&self) -> Media {
        let mut media = match self.kind {
            MediaKind::Audio => Media::audio(&self.mid, MEDIA_PROTOCOLS, self.direction),
            MediaKind::Video => Media::video(&self.mid, MEDIA_PROTOCOLS, self.direction),
        };
        for params in &self.codecs {
            match params.codec {
                Codec::Opus => media.add_audio_codec(
                    self.payload_type,
                    "opus",
                    48_000,
                    Some(2),
                    params.profile.as_deref(),
                ),
                Codec::H264 => {
                    media.add_video_codec(self.payload_type, "H264", params.profile.as_deref())
                }
            }
        }
        if let Some(rtx_payload_type) = self.rtx_payload_type {
            let clock_rate = if self.kind == MediaKind::Video { 90_000 } else { 48_000 };
            media.add_rtx_codec(rtx_payload_type, self.payload_type, clock_rate);
        }
        if let (Some(red), Some(ulpfec)) = (self.red_payload_type, self.ulpfec_payload_type) {
            media.add_rtp_map(sdp::RtpMap::new(red, "red", 90_000, None));
            media.add_rtp_map(sdp::RtpMap::new(ulpfec, "ulpfec", 90_000, None));
        }

        media.add_ssrc(SsrcEntry {
            ssrc: self.media_ssrc,
            kind: SsrcKind::Media,
            cname: Some(self.cname.clone()),
            msid: self.msid.clone(),
            track_id: self.track_id.clone(),
        });
        if let Some(rtx_ssrc) = self.rtx_ssrc {
            media.add_ssrc(SsrcEntry {
                ssrc: rtx_ssrc,
                kind: SsrcKind::Rtx,
                cname: Some(self.cname.clone()),
                msid: None,
                track_id: None,
            });
        }
        if let Some(fec_ssrc) = self.fec_ssrc {
            if fec_ssrc != self.media_ssrc {
                media.add_ssrc(SsrcEntry {
                    ssrc: fec_ssrc,
                    kind: SsrcKind::Fec,
                    cname: Some(self.cname.clone()),
                    msid: None,
                    track_id: None,
                });
            }
        }
        media
    }
}

/// A negotiated media track.
pub struct MediaTrack {
    config: MediaTrackConfiguration,
}

impl MediaTrack {
    pub fn new(config: MediaTrackConfiguration) -> Self {
        MediaTrack { config }
    }

    pub fn kind(&self) -> MediaKind {
        self.config.kind
    }

    pub fn mid(&self) -> &str {
        &self.config.mid
    }

    pub fn config(&self) -> &MediaTrackConfiguration {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kind_mismatch_refused() {
        let mut config = MediaTrackConfiguration::new(MediaKind::Audio, "0");
        assert!(!config.add_codec(Codec::H264, None));
        assert!(config.add_codec(Codec::Opus, None));
    }

    #[test]
    fn test_video_entry_carries_rtx_group() {
        let mut config = MediaTrackConfiguration::video("1");
        config.enable_rtx(99);
        let media = config.build_media_entry();
        media.validate().unwrap();
        assert_eq!(media.media_ssrcs(), &[config.media_ssrc]);
        assert_eq!(media.rtx_ssrcs(), &[config.rtx_ssrc.unwrap()]);
        let rtx_map = media.rtp_map(99).unwrap();
        assert_eq!(rtx_map.codec, "rtx");
        assert_eq!(rtx_map.fmtps, vec![format!("apt={}", config.payload_type)]);
    }

    #[test]
    fn test_audio_entry_shape() {
        let config = MediaTrackConfiguration::audio("2");
        let media = config.build_media_entry();
        let opus = media.rtp_map(111).unwrap();
        assert_eq!(opus.codec, "opus");
        assert_eq!(opus.clock_rate, 48_000);
        assert_eq!(opus.channels, Some(2));
    }

    #[test]
    fn test_ulpfec_payload_types_advertised() {
        let mut config = MediaTrackConfiguration::video("1");
        config.enable_ulpfec(116, 117);
        let media = config.build_media_entry();
        assert_eq!(media.rtp_map(116).unwrap().codec, "red");
        assert_eq!(media.rtp_map(117).unwrap().codec, "ulpfec");
    }
}
