use rand::Rng;

use crate::defines::Role;

/// Session-level block of a description: originator line fields, ICE
/// credentials, certificate fingerprint and DTLS role default.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    user: String,
    session_id: u64,
    ice_ufrag: Option<String>,
    ice_pwd: Option<String>,
    fingerprint: Option<String>,
    role: Role,
    /// Unknown session-level attribute lines, preserved verbatim.
    extra_attributes: Vec<String>,
}

impl Default for SessionEntry {
    fn default() -> Self {
        SessionEntry {
            user: "-".to_string(),
            session_id: rand::thread_rng().gen_range(1..u64::MAX >> 2),
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            role: Role::ActPass,
            extra_attributes: Vec::new(),
        }
    }
}

impl SessionEntry {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

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

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn extra_attributes(&self) -> &[String] {
        &self.extra_attributes
    }

    pub fn add_extra_attribute(&mut self, attribute: String) {
        self.extra_attributes.push(attribute);
    }
}
