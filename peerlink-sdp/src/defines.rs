use std::fmt;

/// Kind of a session description in the offer/answer exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    #[default]
    Unspec,
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Unspec => "unspec",
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DTLS setup role carried by `a=setup:`.
///
/// `ActPass` is legal in offers only; the answerer picks the opposite of
/// the offerer's hint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[default]
    ActPass,
    Active,
    Passive,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ActPass => "actpass",
            Role::Active => "active",
            Role::Passive => "passive",
        }
    }

    pub fn from_setup_attr(value: &str) -> Option<Role> {
        match value {
            "actpass" => Some(Role::ActPass),
            "active" => Some(Role::Active),
            "passive" => Some(Role::Passive),
            _ => None,
        }
    }

    /// The role the remote side takes when we take `self`.
    pub fn reverse(&self) -> Role {
        match self {
            // An actpass offer is answered as active by convention; the
            // answering side starting the handshake saves a round trip.
            Role::ActPass => Role::Passive,
            Role::Active => Role::Passive,
            Role::Passive => Role::Active,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media flow direction of an entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Inactive,
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inactive => "inactive",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::SendRecv => "sendrecv",
        }
    }

    pub fn from_attr(value: &str) -> Option<Direction> {
        match value {
            "inactive" => Some(Direction::Inactive),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "sendrecv" => Some(Direction::SendRecv),
            _ => None,
        }
    }

    /// Direction seen from the remote peer.
    pub fn reverse(&self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks the `sha-256 (HH:){31}HH` shape of a certificate fingerprint
/// value (the part after the algorithm name).
pub fn is_sha256_fingerprint(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 32 * 3 - 1 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        if i % 3 == 2 {
            if *b != b':' {
                return false;
            }
        } else if !b.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}
