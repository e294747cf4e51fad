use std::fmt;
use std::fmt::Write as _;

use shared::error::{Error, Result};

use crate::candidate::Candidate;
use crate::defines::{is_sha256_fingerprint, Direction, Role, SdpType};
use crate::entry::{Application, Media, MediaEntry, MediaKind, SessionEntry};
use crate::parser;

/// A session description: one session-level block plus an ordered list of
/// media entries.
///
/// All entries are implicitly bundled over a single transport; the
/// `a=group:BUNDLE` line is derived from the entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    sdp_type: SdpType,
    role: Role,
    session_entry: SessionEntry,
    media_entries: Vec<MediaEntry>,
    candidates: Vec<Candidate>,
    ended_candidates: bool,
}

/// Builder for a [`Description`] with session-level defaults.
#[derive(Debug, Default)]
pub struct Builder {
    sdp_type: SdpType,
    role: Role,
    ice_ufrag: Option<String>,
    ice_pwd: Option<String>,
    fingerprint: Option<String>,
}

impl Builder {
    pub fn new(sdp_type: SdpType) -> Self {
        Builder {
            sdp_type,
            ..Default::default()
        }
    }

    pub fn set_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn set_ice_ufrag(mut self, ice_ufrag: &str) -> Self {
        self.ice_ufrag = Some(ice_ufrag.to_string());
        self
    }

    pub fn set_ice_pwd(mut self, ice_pwd: &str) -> Self {
        self.ice_pwd = Some(ice_pwd.to_string());
        self
    }

    pub fn set_fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint = Some(fingerprint.to_string());
        self
    }

    pub fn build(self) -> Result<Description> {
        if let Some(fingerprint) = &self.fingerprint {
            if !is_sha256_fingerprint(fingerprint) {
                return Err(Error::InvalidSdp {
                    line: 0,
                    reason: format!("bad fingerprint shape: {fingerprint}"),
                });
            }
        }
        let mut session_entry = SessionEntry::default();
        session_entry.set_ice_ufrag(self.ice_ufrag);
        session_entry.set_ice_pwd(self.ice_pwd);
        session_entry.set_fingerprint(self.fingerprint);
        session_entry.set_role(self.role);
        Ok(Description {
            sdp_type: self.sdp_type,
            role: self.role,
            session_entry,
            media_entries: Vec::new(),
            candidates: Vec::new(),
            ended_candidates: false,
        })
    }
}

impl Description {
    pub fn builder(sdp_type: SdpType) -> Builder {
        Builder::new(sdp_type)
    }

    /// Parses LF- or CRLF-terminated SDP text. `hinted_type` is the type
    /// signaled out of band; unknown attribute lines are preserved.
    pub fn parse(sdp: &str, hinted_type: SdpType) -> Result<Description> {
        parser::parse(sdp, hinted_type)
    }

    pub(crate) fn new_for_parser(sdp_type: SdpType) -> Description {
        Description {
            sdp_type,
            role: Role::ActPass,
            session_entry: SessionEntry::default(),
            media_entries: Vec::new(),
            candidates: Vec::new(),
            ended_candidates: false,
        }
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn hint_type(&mut self, sdp_type: SdpType) {
        if self.sdp_type == SdpType::Unspec {
            self.sdp_type = sdp_type;
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn hint_role(&mut self, role: Role) {
        self.role = role;
        self.session_entry.set_role(role);
    }

    pub fn session_entry(&self) -> &SessionEntry {
        &self.session_entry
    }

    pub fn session_entry_mut(&mut self) -> &mut SessionEntry {
        &mut self.session_entry
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.session_entry.ice_ufrag()
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.session_entry.ice_pwd()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.session_entry.fingerprint()
    }

    pub fn set_fingerprint(&mut self, fingerprint: &str) -> Result<()> {
        if !is_sha256_fingerprint(fingerprint) {
            return Err(Error::InvalidSdp {
                line: 0,
                reason: format!("bad fingerprint shape: {fingerprint}"),
            });
        }
        self.session_entry.set_fingerprint(Some(fingerprint.to_string()));
        Ok(())
    }

    /// Mids of all entries in insertion order; this is the BUNDLE group.
    pub fn bundle_mids(&self) -> Vec<&str> {
        self.media_entries.iter().map(|e| e.mid()).collect()
    }

    pub fn has_mid(&self, mid: &str) -> bool {
        self.media_entries.iter().any(|e| e.mid() == mid)
    }

    pub fn entries(&self) -> &[MediaEntry] {
        &self.media_entries
    }

    pub fn entries_mut(&mut self) -> &mut [MediaEntry] {
        &mut self.media_entries
    }

    pub fn entry(&self, mid: &str) -> Option<&MediaEntry> {
        self.media_entries.iter().find(|e| e.mid() == mid)
    }

    pub fn entry_mut(&mut self, mid: &str) -> Option<&mut MediaEntry> {
        self.media_entries.iter_mut().find(|e| e.mid() == mid)
    }

    pub fn media(&self, mid: &str) -> Option<&Media> {
        self.entry(mid).and_then(|e| e.as_media())
    }

    pub fn has_media(&self) -> bool {
        self.media_entries.iter().any(|e| e.is_media())
    }

    pub fn has_audio(&self) -> bool {
        self.media_entries
            .iter()
            .any(|e| matches!(e, MediaEntry::Audio(_)))
    }

    pub fn has_video(&self) -> bool {
        self.media_entries
            .iter()
            .any(|e| matches!(e, MediaEntry::Video(_)))
    }

    pub fn has_application(&self) -> bool {
        self.media_entries
            .iter()
            .any(|e| matches!(e, MediaEntry::Application(_)))
    }

    pub fn application(&self) -> Option<&Application> {
        self.media_entries.iter().find_map(|e| e.as_application())
    }

    /// Appends an entry; the mid must be unique within the description.
    pub fn add_entry(&mut self, entry: MediaEntry) -> Result<()> {
        if self.has_mid(entry.mid()) {
            return Err(Error::DuplicateMid(entry.mid().to_string()));
        }
        self.media_entries.push(entry);
        Ok(())
    }

    pub fn add_media(&mut self, media: Media) -> Result<&mut Media> {
        let entry = match media.kind() {
            MediaKind::Audio => MediaEntry::Audio(media),
            MediaKind::Video => MediaEntry::Video(media),
        };
        self.add_entry(entry)?;
        Ok(self
            .media_entries
            .last_mut()
            .and_then(|e| e.as_media_mut())
            .unwrap())
    }

    pub fn add_audio(
        &mut self,
        mid: &str,
        protocols: &str,
        direction: Direction,
    ) -> Result<&mut Media> {
        self.add_media(Media::audio(mid, protocols, direction))
    }

    pub fn add_video(
        &mut self,
        mid: &str,
        protocols: &str,
        direction: Direction,
    ) -> Result<&mut Media> {
        self.add_media(Media::video(mid, protocols, direction))
    }

    pub fn add_application(&mut self, mid: &str) -> Result<&mut Application> {
        self.add_entry(MediaEntry::Application(Application::new(mid)))?;
        Ok(self
            .media_entries
            .last_mut()
            .and_then(|e| e.as_application_mut())
            .unwrap())
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn add_candidate(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    pub(crate) fn rehome_candidates(&mut self, old_mid: &str, new_mid: &str) {
        for candidate in &mut self.candidates {
            if candidate.mid() == Some(old_mid) {
                candidate.set_mid(new_mid);
            }
        }
    }

    pub fn ended_candidates(&self) -> bool {
        self.ended_candidates
    }

    pub fn end_candidates(&mut self) {
        self.ended_candidates = true;
    }

    /// Produces deterministic SDP text terminated by `eol` after every line.
    ///
    /// With `application_only` set, media entries are skipped and only
    /// application entries are emitted (used while negotiating a pure
    /// data-channel session).
    pub fn generate_sdp(&self, eol: &str, application_only: bool) -> String {
        let mut sdp = String::with_capacity(1024);
        let mut line = |s: &str, out: &mut String| {
            out.push_str(s);
            out.push_str(eol);
        };

        line("v=0", &mut sdp);
        line(
            &format!(
                "o=- {} 2 IN IP4 127.0.0.1",
                self.session_entry.session_id()
            ),
            &mut sdp,
        );
        line("s=-", &mut sdp);
        line("t=0 0", &mut sdp);

        let mids: Vec<&str> = self
            .media_entries
            .iter()
            .filter(|e| !application_only || !e.is_media())
            .map(|e| e.mid())
            .collect();
        if !mids.is_empty() {
            line(&format!("a=group:BUNDLE {}", mids.join(" ")), &mut sdp);
        }
        line("a=msid-semantic:WMS *", &mut sdp);
        for attr in self.session_entry.extra_attributes() {
            line(&format!("a={attr}"), &mut sdp);
        }

        for entry in &self.media_entries {
            match entry {
                MediaEntry::Audio(media) | MediaEntry::Video(media) => {
                    if application_only {
                        continue;
                    }
                    self.write_media(&mut sdp, media, eol);
                }
                MediaEntry::Application(app) => self.write_application(&mut sdp, app, eol),
            }
        }
        sdp
    }

    fn write_common(&self, out: &mut String, eol: &str, mid: &str, overrides: CommonOverrides<'_>) {
        let mut line = |s: String| {
            out.push_str(&s);
            out.push_str(eol);
        };
        if let Some(ufrag) = overrides.ice_ufrag.or(self.session_entry.ice_ufrag()) {
            line(format!("a=ice-ufrag:{ufrag}"));
        }
        if let Some(pwd) = overrides.ice_pwd.or(self.session_entry.ice_pwd()) {
            line(format!("a=ice-pwd:{pwd}"));
        }
        line("a=ice-options:trickle".to_string());
        if let Some(fingerprint) = overrides.fingerprint.or(self.session_entry.fingerprint()) {
            line(format!("a=fingerprint:sha-256 {fingerprint}"));
        }
        line(format!(
            "a=setup:{}",
            overrides.role.unwrap_or(self.role)
        ));
        line(format!("a=mid:{mid}"));
    }

    fn write_media(&self, out: &mut String, media: &Media, eol: &str) {
        let pts: Vec<String> = media.payload_types().map(|pt| pt.to_string()).collect();
        let mut m_line = format!("m={} 9 {}", media.kind().as_str(), media.protocols());
        if !pts.is_empty() {
            let _ = write!(m_line, " {}", pts.join(" "));
        }
        out.push_str(&m_line);
        out.push_str(eol);
        out.push_str("c=IN IP4 0.0.0.0");
        out.push_str(eol);
        if let Some(kbps) = media.bandwidth_max_kbps() {
            out.push_str(&format!("b=AS:{kbps}"));
            out.push_str(eol);
        }

        self.write_common(
            out,
            eol,
            media.mid(),
            CommonOverrides {
                ice_ufrag: media.ice_ufrag(),
                ice_pwd: media.ice_pwd(),
                fingerprint: media.fingerprint(),
                role: media.role(),
            },
        );

        let mut line = |s: String| {
            out.push_str(&s);
            out.push_str(eol);
        };
        line(format!("a={}", media.direction()));
        line("a=rtcp-mux".to_string());
        line("a=rtcp-rsize".to_string());

        for map in media.rtp_maps() {
            let mut rtpmap = format!(
                "a=rtpmap:{} {}/{}",
                map.payload_type, map.codec, map.clock_rate
            );
            if let Some(channels) = map.channels {
                let _ = write!(rtpmap, "/{channels}");
            }
            line(rtpmap);
            for fb in &map.rtcp_fbs {
                line(format!("a=rtcp-fb:{} {fb}", map.payload_type));
            }
            for fmtp in &map.fmtps {
                line(format!("a=fmtp:{} {fmtp}", map.payload_type));
            }
        }

        for (id, uri) in media.ext_maps() {
            line(format!("a=extmap:{id} {uri}"));
        }

        for (i, media_ssrc) in media.media_ssrcs().iter().enumerate() {
            if let Some(rtx) = media.rtx_ssrcs().get(i) {
                line(format!("a=ssrc-group:FID {media_ssrc} {rtx}"));
            }
            if let Some(fec) = media.fec_ssrcs().get(i) {
                line(format!("a=ssrc-group:FEC {media_ssrc} {fec}"));
            }
        }
        for entry in media.ssrc_entries() {
            if let Some(cname) = &entry.cname {
                line(format!("a=ssrc:{} cname:{cname}", entry.ssrc));
            }
            if let Some(msid) = &entry.msid {
                let track = entry.track_id.as_deref().unwrap_or(msid);
                line(format!("a=ssrc:{} msid:{msid} {track}", entry.ssrc));
            }
        }

        for attr in media.extra_attributes() {
            line(format!("a={attr}"));
        }

        self.write_candidates(out, eol, media.mid());
    }

    fn write_application(&self, out: &mut String, app: &Application, eol: &str) {
        out.push_str(&format!(
            "m=application 9 {} webrtc-datachannel",
            app.protocols()
        ));
        out.push_str(eol);
        out.push_str("c=IN IP4 0.0.0.0");
        out.push_str(eol);

        self.write_common(
            out,
            eol,
            app.mid(),
            CommonOverrides {
                ice_ufrag: app.ice_ufrag(),
                ice_pwd: app.ice_pwd(),
                fingerprint: app.fingerprint(),
                role: app.role(),
            },
        );

        let mut line = |s: String| {
            out.push_str(&s);
            out.push_str(eol);
        };
        if let Some(port) = app.sctp_port() {
            line(format!("a=sctp-port:{port}"));
        }
        if let Some(size) = app.max_message_size() {
            line(format!("a=max-message-size:{size}"));
        }
        for attr in app.extra_attributes() {
            line(format!("a={attr}"));
        }

        self.write_candidates(out, eol, app.mid());
    }

    fn write_candidates(&self, out: &mut String, eol: &str, mid: &str) {
        let first_mid = self.media_entries.first().map(|e| e.mid().to_string());
        for candidate in &self.candidates {
            // A candidate belongs to the entry it names, unnamed ones to the
            // first entry.
            let owner = candidate
                .mid()
                .map(str::to_string)
                .or_else(|| first_mid.clone());
            if owner.as_deref() == Some(mid) {
                out.push_str(&format!("a={}", candidate.sdp_line()));
                out.push_str(eol);
            }
        }
        if self.ended_candidates && first_mid.as_deref() == Some(mid) {
            out.push_str("a=end-of-candidates");
            out.push_str(eol);
        }
    }
}

struct CommonOverrides<'a> {
    ice_ufrag: Option<&'a str>,
    ice_pwd: Option<&'a str>,
    fingerprint: Option<&'a str>,
    role: Option<Role>,
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.generate_sdp("\r\n", false))
    }
}
