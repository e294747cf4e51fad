//! SDP text parser.
//!
//! Accepts LF- or CRLF-terminated input, tolerates leading whitespace on
//! every line and preserves unknown attribute lines verbatim. Structural
//! violations fail with `InvalidSdp { line, reason }`; unknown attributes
//! never do.

use std::collections::HashMap;

use shared::error::{Error, Result};

use crate::candidate::Candidate;
use crate::defines::{is_sha256_fingerprint, Direction, Role, SdpType};
use crate::description::Description;
use crate::entry::{Application, Media, MediaEntry, SsrcEntry, SsrcKind};

pub fn parse(sdp: &str, hinted_type: SdpType) -> Result<Description> {
    Parser::new(hinted_type).run(sdp)
}

fn err(line: usize, reason: impl Into<String>) -> Error {
    Error::InvalidSdp {
        line,
        reason: reason.into(),
    }
}

#[derive(Default)]
struct SsrcInfo {
    cname: Option<String>,
    msid: Option<String>,
    track_id: Option<String>,
}

/// SSRC attributes and groups accumulate per entry and are resolved into
/// the positional layout once the entry ends.
#[derive(Default)]
struct PendingSsrcs {
    order: Vec<u32>,
    info: HashMap<u32, SsrcInfo>,
    fid_groups: Vec<(u32, u32)>,
    fec_groups: Vec<(u32, u32)>,
}

impl PendingSsrcs {
    fn is_empty(&self) -> bool {
        self.order.is_empty() && self.fid_groups.is_empty() && self.fec_groups.is_empty()
    }

    fn touch(&mut self, ssrc: u32) -> &mut SsrcInfo {
        if !self.info.contains_key(&ssrc) {
            self.order.push(ssrc);
        }
        self.info.entry(ssrc).or_default()
    }

    fn resolve(mut self, media: &mut Media) {
        let mut kinds: HashMap<u32, SsrcKind> = HashMap::new();
        let mut media_ssrcs: Vec<u32> = Vec::new();
        let mut rtx_ssrcs: Vec<u32> = Vec::new();
        let mut fec_ssrcs: Vec<u32> = Vec::new();

        for (media_ssrc, rtx) in &self.fid_groups {
            kinds.insert(*media_ssrc, SsrcKind::Media);
            kinds.insert(*rtx, SsrcKind::Rtx);
            if !media_ssrcs.contains(media_ssrc) {
                media_ssrcs.push(*media_ssrc);
            }
            rtx_ssrcs.push(*rtx);
        }
        for (media_ssrc, fec) in &self.fec_groups {
            kinds.insert(*media_ssrc, SsrcKind::Media);
            kinds.insert(*fec, SsrcKind::Fec);
            if !media_ssrcs.contains(media_ssrc) {
                media_ssrcs.push(*media_ssrc);
            }
            fec_ssrcs.push(*fec);
        }
        for ssrc in &self.order {
            if !kinds.contains_key(ssrc) {
                kinds.insert(*ssrc, SsrcKind::Media);
                media_ssrcs.push(*ssrc);
            }
        }

        let entries = self
            .order
            .iter()
            .map(|ssrc| {
                let info = self.info.remove(ssrc).unwrap_or_default();
                SsrcEntry {
                    ssrc: *ssrc,
                    kind: kinds[ssrc],
                    cname: info.cname,
                    msid: info.msid,
                    track_id: info.track_id,
                }
            })
            .collect();
        media.set_ssrc_state(entries, media_ssrcs, rtx_ssrcs, fec_ssrcs);
    }
}

struct Parser {
    description: Description,
    current_mid: Option<String>,
    pending_ssrcs: PendingSsrcs,
    saw_version: bool,
    saw_origin: bool,
    saw_session_name: bool,
    saw_timing: bool,
    fingerprint_set: bool,
    role_set: bool,
}

impl Parser {
    fn new(hinted_type: SdpType) -> Self {
        Parser {
            description: Description::new_for_parser(hinted_type),
            current_mid: None,
            pending_ssrcs: PendingSsrcs::default(),
            saw_version: false,
            saw_origin: false,
            saw_session_name: false,
            saw_timing: false,
            fingerprint_set: false,
            role_set: false,
        }
    }

    fn run(mut self, sdp: &str) -> Result<Description> {
        for (index, raw_line) in sdp.lines().enumerate() {
            let number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            self.parse_line(number, line)?;
        }
        self.finish_entry();

        if !self.saw_version {
            return Err(err(0, "missing v= line"));
        }
        if !self.saw_origin {
            return Err(err(0, "missing o= line"));
        }
        if !self.saw_session_name {
            return Err(err(0, "missing s= line"));
        }
        if !self.saw_timing {
            return Err(err(0, "missing t= line"));
        }
        if self.description.entries().is_empty() {
            return Err(err(0, "no m= entry"));
        }
        Ok(self.description)
    }

    fn parse_line(&mut self, number: usize, line: &str) -> Result<()> {
        let (key, value) = match line.split_once('=') {
            Some((k, v)) if k.len() == 1 => (k.as_bytes()[0], v),
            _ => return Err(err(number, "not a key=value line")),
        };
        match key {
            b'v' => {
                if value.trim() != "0" {
                    return Err(err(number, "unsupported version"));
                }
                self.saw_version = true;
            }
            b'o' => {
                self.saw_origin = true;
                // o=<user> <session-id> <version> <nettype> <addrtype> <addr>
                let mut fields = value.split_whitespace();
                let _user = fields.next();
                if let Some(id) = fields.next().and_then(|id| id.parse::<u64>().ok()) {
                    self.description.session_entry_mut().set_session_id(id);
                }
            }
            b's' => self.saw_session_name = true,
            b't' => self.saw_timing = true,
            b'm' => self.parse_media_line(number, value)?,
            b'a' => self.parse_attribute(number, value)?,
            b'b' => {
                if let Some(kbps) = value.strip_prefix("AS:") {
                    let kbps = kbps
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| err(number, "bad b=AS value"))?;
                    if let Some(media) = self.current_media_mut() {
                        media.set_bandwidth_max_kbps(Some(kbps));
                    }
                }
            }
            // Connection data, encryption keys, repeats: nothing we keep.
            b'c' | b'k' | b'r' | b'z' | b'i' | b'u' | b'e' | b'p' => {}
            _ => {}
        }
        Ok(())
    }

    fn parse_media_line(&mut self, number: usize, value: &str) -> Result<()> {
        self.finish_entry();
        // m=<type> <port> <protocols> <fmt...>
        let mut fields = value.split_whitespace();
        let kind = fields.next().ok_or_else(|| err(number, "empty m= line"))?;
        let _port = fields.next().ok_or_else(|| err(number, "m= missing port"))?;
        let protocols = fields
            .next()
            .ok_or_else(|| err(number, "m= missing protocols"))?;

        // The mid arrives later via a=mid:; a placeholder keeps the entry
        // addressable until then.
        let placeholder = format!("#{}", self.description.entries().len());
        let entry = match kind {
            "audio" => MediaEntry::Audio(Media::audio(&placeholder, protocols, Direction::SendRecv)),
            "video" => MediaEntry::Video(Media::video(&placeholder, protocols, Direction::SendRecv)),
            "application" => {
                let mut app = Application::new(&placeholder);
                app.set_sctp_port(None);
                app.set_max_message_size(None);
                MediaEntry::Application(app)
            }
            other => return Err(err(number, format!("unknown media type {other}"))),
        };
        self.description
            .add_entry(entry)
            .map_err(|e| err(number, e.to_string()))?;
        self.current_mid = Some(placeholder);
        Ok(())
    }

    fn parse_attribute(&mut self, number: usize, value: &str) -> Result<()> {
        let (name, attr_value) = match value.split_once(':') {
            Some((n, v)) => (n, Some(v)),
            None => (value, None),
        };

        if let Some(direction) = Direction::from_attr(name) {
            if let Some(media) = self.current_media_mut() {
                media.set_direction(direction);
            }
            return Ok(());
        }

        match name {
            "group" => {
                // BUNDLE mids are implied by entry order; the group line
                // itself carries no extra state.
            }
            "mid" => {
                let mid = attr_value.ok_or_else(|| err(number, "empty a=mid"))?.trim();
                self.apply_mid(number, mid)?;
            }
            "ice-ufrag" => {
                let ufrag = attr_value.unwrap_or_default().trim().to_string();
                if self.description.ice_ufrag().is_none() {
                    self.description
                        .session_entry_mut()
                        .set_ice_ufrag(Some(ufrag));
                } else if self.description.ice_ufrag() != Some(ufrag.as_str()) {
                    self.set_entry_override(OverrideField::IceUfrag(ufrag));
                }
            }
            "ice-pwd" => {
                let pwd = attr_value.unwrap_or_default().trim().to_string();
                if self.description.ice_pwd().is_none() {
                    self.description.session_entry_mut().set_ice_pwd(Some(pwd));
                } else if self.description.ice_pwd() != Some(pwd.as_str()) {
                    self.set_entry_override(OverrideField::IcePwd(pwd));
                }
            }
            "fingerprint" => {
                let value = attr_value.unwrap_or_default().trim();
                let fingerprint = value
                    .strip_prefix("sha-256 ")
                    .map(str::trim)
                    .filter(|fp| is_sha256_fingerprint(fp))
                    .ok_or_else(|| err(number, format!("bad fingerprint shape: {value}")))?
                    .to_string();
                if !self.fingerprint_set {
                    self.fingerprint_set = true;
                    self.description
                        .session_entry_mut()
                        .set_fingerprint(Some(fingerprint));
                } else if self.description.fingerprint() != Some(fingerprint.as_str()) {
                    self.set_entry_override(OverrideField::Fingerprint(fingerprint));
                }
            }
            "setup" => {
                let value = attr_value.unwrap_or_default().trim();
                let role = Role::from_setup_attr(value)
                    .ok_or_else(|| err(number, format!("bad setup value: {value}")))?;
                if !self.role_set {
                    self.role_set = true;
                    self.description.hint_role(role);
                } else if self.description.role() != role {
                    self.set_entry_override(OverrideField::Role(role));
                }
            }
            "rtpmap" => self.parse_rtpmap(number, attr_value.unwrap_or_default())?,
            "rtcp-fb" => {
                let (pt, rest) = split_pt(number, attr_value.unwrap_or_default())?;
                if let Some(media) = self.current_media_mut() {
                    ensure_map(media, pt).add_feedback(rest);
                }
            }
            "fmtp" => {
                let (pt, rest) = split_pt(number, attr_value.unwrap_or_default())?;
                if let Some(media) = self.current_media_mut() {
                    ensure_map(media, pt).add_fmtp(rest);
                }
            }
            "ssrc" => self.parse_ssrc(number, attr_value.unwrap_or_default())?,
            "ssrc-group" => self.parse_ssrc_group(number, attr_value.unwrap_or_default())?,
            "extmap" => {
                let value = attr_value.unwrap_or_default();
                let (id_part, uri) = value
                    .split_once(' ')
                    .ok_or_else(|| err(number, "bad extmap"))?;
                // The id may carry a direction suffix (`id/direction`).
                let id = id_part
                    .split('/')
                    .next()
                    .and_then(|id| id.parse::<u8>().ok())
                    .ok_or_else(|| err(number, "bad extmap id"))?;
                if let Some(media) = self.current_media_mut() {
                    media.add_ext_map(id, uri.trim());
                }
            }
            "sctp-port" => {
                let port = attr_value
                    .and_then(|v| v.trim().parse::<u16>().ok())
                    .ok_or_else(|| err(number, "bad sctp-port"))?;
                if let Some(app) = self.current_application_mut() {
                    app.set_sctp_port(Some(port));
                }
            }
            "max-message-size" => {
                let size = attr_value
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .ok_or_else(|| err(number, "bad max-message-size"))?;
                if let Some(app) = self.current_application_mut() {
                    app.set_max_message_size(Some(size));
                }
            }
            "candidate" => {
                let candidate = Candidate::parse(attr_value.unwrap_or_default())
                    .map_err(|e| err(number, e.to_string()))?;
                let mut candidate = candidate;
                if let Some(mid) = &self.current_mid {
                    candidate.set_mid(mid);
                }
                self.description.add_candidate(candidate);
            }
            "end-of-candidates" => self.description.end_candidates(),
            // Lines the generator always re-emits on its own.
            "msid-semantic" | "ice-options" | "rtcp-mux" | "rtcp-rsize" | "rtcp" => {}
            _ => {
                // Unknown attribute: preserved verbatim.
                let attribute = value.to_string();
                match self.current_mid.clone() {
                    None => self
                        .description
                        .session_entry_mut()
                        .add_extra_attribute(attribute),
                    Some(mid) => {
                        if let Some(entry) = self.description.entry_mut(&mid) {
                            match entry {
                                MediaEntry::Audio(m) | MediaEntry::Video(m) => {
                                    m.add_extra_attribute(attribute)
                                }
                                MediaEntry::Application(a) => a.add_extra_attribute(attribute),
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_mid(&mut self, number: usize, mid: &str) -> Result<()> {
        if self.description.has_mid(mid) {
            return Err(err(number, format!("duplicate mid {mid}")));
        }
        let current = match self.current_mid.take() {
            Some(current) => current,
            None => return Err(err(number, "a=mid outside of media entry")),
        };
        if let Some(entry) = self.description.entry_mut(&current) {
            match entry {
                MediaEntry::Audio(m) | MediaEntry::Video(m) => m.set_mid(mid),
                MediaEntry::Application(a) => a.set_mid(mid),
            }
        }
        // Candidates parsed before the mid line carried the placeholder.
        self.description.rehome_candidates(&current, mid);
        self.current_mid = Some(mid.to_string());
        Ok(())
    }

    fn parse_rtpmap(&mut self, number: usize, value: &str) -> Result<()> {
        // rtpmap:<pt> <codec>/<clock>[/<channels>]
        let (pt, rest) = split_pt(number, value)?;
        let mut parts = rest.split('/');
        let codec = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| err(number, "rtpmap missing codec"))?;
        let clock_rate = parts
            .next()
            .and_then(|c| c.trim().parse::<u32>().ok())
            .ok_or_else(|| err(number, "rtpmap bad clock rate"))?;
        let channels = match parts.next() {
            Some(ch) => Some(
                ch.trim()
                    .parse::<u8>()
                    .map_err(|_| err(number, "rtpmap bad channel count"))?,
            ),
            None => None,
        };
        if let Some(media) = self.current_media_mut() {
            let map = ensure_map(media, pt);
            map.codec = codec.to_string();
            map.clock_rate = clock_rate;
            map.channels = channels;
        }
        Ok(())
    }

    fn parse_ssrc(&mut self, number: usize, value: &str) -> Result<()> {
        // ssrc:<ssrc> <attr>[:<value>]
        let (ssrc_part, rest) = value
            .split_once(' ')
            .map(|(s, r)| (s, Some(r)))
            .unwrap_or((value, None));
        let ssrc = ssrc_part
            .trim()
            .parse::<u32>()
            .map_err(|_| err(number, "bad ssrc"))?;
        if self.current_media_mut().is_none() {
            return Ok(());
        }
        let info = self.pending_ssrcs.touch(ssrc);
        if let Some(rest) = rest {
            match rest.split_once(':') {
                Some(("cname", cname)) => info.cname = Some(cname.trim().to_string()),
                Some(("msid", msid_value)) => {
                    let mut parts = msid_value.trim().split_whitespace();
                    info.msid = parts.next().map(str::to_string);
                    info.track_id = parts.next().map(str::to_string);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_ssrc_group(&mut self, number: usize, value: &str) -> Result<()> {
        let mut parts = value.split_whitespace();
        let semantics = parts.next().unwrap_or_default();
        let a = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| err(number, "bad ssrc-group"))?;
        let b = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| err(number, "bad ssrc-group"))?;
        match semantics {
            "FID" => self.pending_ssrcs.fid_groups.push((a, b)),
            "FEC" | "FEC-FR" => self.pending_ssrcs.fec_groups.push((a, b)),
            _ => {}
        }
        Ok(())
    }

    /// Stores a per-entry override of a session-level ICE/DTLS parameter.
    fn set_entry_override(&mut self, field: OverrideField) {
        let Some(mid) = self.current_mid.clone() else {
            return;
        };
        let Some(entry) = self.description.entry_mut(&mid) else {
            return;
        };
        match entry {
            MediaEntry::Audio(m) | MediaEntry::Video(m) => match field {
                OverrideField::IceUfrag(v) => m.set_ice_ufrag(Some(v)),
                OverrideField::IcePwd(v) => m.set_ice_pwd(Some(v)),
                OverrideField::Fingerprint(v) => m.set_fingerprint(Some(v)),
                OverrideField::Role(r) => m.set_role(Some(r)),
            },
            MediaEntry::Application(a) => match field {
                OverrideField::IceUfrag(v) => a.set_ice_ufrag(Some(v)),
                OverrideField::IcePwd(v) => a.set_ice_pwd(Some(v)),
                OverrideField::Fingerprint(v) => a.set_fingerprint(Some(v)),
                OverrideField::Role(r) => a.set_role(Some(r)),
            },
        }
    }

    fn current_media_mut(&mut self) -> Option<&mut Media> {
        let mid = self.current_mid.clone()?;
        self.description.entry_mut(&mid)?.as_media_mut()
    }

    fn current_application_mut(&mut self) -> Option<&mut Application> {
        let mid = self.current_mid.clone()?;
        self.description.entry_mut(&mid)?.as_application_mut()
    }

    /// Folds accumulated SSRC attributes into the entry being left.
    fn finish_entry(&mut self) {
        if self.pending_ssrcs.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_ssrcs);
        if let Some(media) = self.current_media_mut() {
            pending.resolve(media);
        }
    }
}

enum OverrideField {
    IceUfrag(String),
    IcePwd(String),
    Fingerprint(String),
    Role(Role),
}

fn split_pt<'a>(number: usize, value: &'a str) -> Result<(u8, &'a str)> {
    let (pt, rest) = value
        .split_once(' ')
        .ok_or_else(|| err(number, "missing payload type separator"))?;
    let pt = pt
        .trim()
        .parse::<u8>()
        .map_err(|_| err(number, format!("non-integer payload type: {pt}")))?;
    Ok((pt, rest.trim()))
}

fn ensure_map<'a>(media: &'a mut Media, pt: u8) -> &'a mut crate::entry::RtpMap {
    if !media.has_payload_type(pt) {
        media.add_rtp_map(crate::entry::RtpMap::new(pt, "", 0, None));
    }
    media.rtp_map_mut(pt).unwrap()
}
