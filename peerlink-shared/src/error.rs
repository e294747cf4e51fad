#![allow(dead_code)]

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    //SDP parse errors
    #[error("invalid sdp at line {line}: {reason}")]
    InvalidSdp { line: usize, reason: String },

    //RTP parse errors
    #[error("RTP packet version must be 2")]
    BadVersion,
    #[error("RTP header truncated")]
    HeaderTooShort,
    #[error("RTP extension block overruns packet")]
    ExtensionOverrun,
    #[error("invalid padding value")]
    BadPadding,
    #[error("buffer too short")]
    BufferTooShort,
    #[error("extension id {0} out of range for profile")]
    InvalidExtensionId(u8),
    #[error("extension type not registered")]
    ExtensionNotRegistered,
    #[error("too many CSRCs")]
    TooManyCsrcs,

    //RTCP parse errors
    #[error("RTCP packet too short to be read")]
    PacketTooShort,
    #[error("wrong RTCP packet type")]
    WrongType,
    #[error("first packet in compound must be SR or RR")]
    BadFirstPacket,
    #[error("packet lost count exceeds signed 24-bit range")]
    InvalidTotalLost,
    #[error("too many report blocks")]
    TooManyReports,
    #[error("SSRC count and length do not match")]
    SsrcNumAndLengthMismatch,
    #[error("missing REMB identifier")]
    MissingRembIdentifier,
    #[error("invalid XR block size")]
    InvalidBlockSize,
    #[error("wrong feedback message type")]
    WrongFeedbackType,

    //Cryptographic errors
    #[error("tls: {0}")]
    TlsError(String),
    #[error("srtp: {0}")]
    SrtpError(String),
    #[error("srtp authentication failed")]
    SrtpAuthFailed,
    #[error("srtp replayed packet index")]
    SrtpReplay,
    #[error("peer certificate does not match signaled fingerprint")]
    FingerprintMismatch,
    #[error("keying material export failed: {0}")]
    KeyingMaterialExport(String),

    //Protocol violations
    #[error("unexpected state: {0}")]
    UnexpectedState(String),
    #[error("bad media configuration: {0}")]
    BadMediaConfiguration(String),
    #[error("duplicate mid: {0}")]
    DuplicateMid(String),
    #[error("unknown mid: {0}")]
    UnknownMid(String),
    #[error("malformed candidate: {0}")]
    InvalidCandidate(String),

    //Capacity errors
    #[error("nack list overflow")]
    NackListOverflow,
    #[error("sctp stream ids exhausted")]
    StreamExhausted,
    #[error("packet too big")]
    PacketTooBig,

    //Transient I/O
    #[error("operation would block")]
    WouldBlock,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("transport is stopped")]
    TransportStopped,
    #[error("i/o timeout")]
    Timeout,

    #[error("io: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e.to_string()),
        }
    }
}
