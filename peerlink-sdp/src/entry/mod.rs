//! Session and media entries of a description.
//!
//! The entry hierarchy of the wire format is a closed sum: a session-level
//! block and an ordered list of media entries, each of which is exactly one
//! of audio, video or application.

pub mod application;
pub mod media;
pub mod session;

pub use application::Application;
pub use media::{Media, MediaKind, RtpMap, SsrcEntry, SsrcKind};
pub use session::SessionEntry;

/// One `m=` section.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEntry {
    Audio(Media),
    Video(Media),
    Application(Application),
}

impl MediaEntry {
    pub fn mid(&self) -> &str {
        match self {
            MediaEntry::Audio(media) | MediaEntry::Video(media) => media.mid(),
            MediaEntry::Application(app) => app.mid(),
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, MediaEntry::Audio(_) | MediaEntry::Video(_))
    }

    pub fn as_media(&self) -> Option<&Media> {
        match self {
            MediaEntry::Audio(media) | MediaEntry::Video(media) => Some(media),
            MediaEntry::Application(_) => None,
        }
    }

    pub fn as_media_mut(&mut self) -> Option<&mut Media> {
        match self {
            MediaEntry::Audio(media) | MediaEntry::Video(media) => Some(media),
            MediaEntry::Application(_) => None,
        }
    }

    pub fn as_application(&self) -> Option<&Application> {
        match self {
            MediaEntry::Application(app) => Some(app),
            _ => None,
        }
    }

    pub fn as_application_mut(&mut self) -> Option<&mut Application> {
        match self {
            MediaEntry::Application(app) => Some(app),
            _ => None,
        }
    }
}
