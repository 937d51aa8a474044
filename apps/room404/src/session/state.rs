use std::fmt;

use super::chat::ChatEntry;
use crate::config::MediaMode;
use crate::media::{LocalMedia, MediaError, MediaTrackSet};
use crate::negotiation::{Negotiation, NegotiationError, RemoteTrack};
use crate::protocol::ProtocolViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    WaitingForPartner,
    /// Transient, on the way to `Active`.
    PartnerPresent,
    Active,
    /// Transient, on the way back to `WaitingForPartner`.
    PartnerLost,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::WaitingForPartner => "waiting-for-partner",
            SessionState::PartnerPresent => "partner-present",
            SessionState::Active => "active",
            SessionState::PartnerLost => "partner-lost",
        };
        f.write_str(label)
    }
}

/// Everything a UI renders, republished after every change.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: String,
    pub identity: Option<String>,
    pub partner_present: bool,
    pub chat: Vec<ChatEntry>,
    pub media: MediaTrackSet,
    pub media_mode: MediaMode,
    pub local_media: Option<LocalMedia>,
    pub remote_tracks: Vec<RemoteTrack>,
    /// Set when capture failed and the session runs receive-only.
    pub media_hint: Option<String>,
    pub negotiation: Option<Negotiation>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            status: "Disconnected".to_string(),
            identity: None,
            partner_present: false,
            chat: Vec::new(),
            media: MediaTrackSet::default(),
            media_mode: MediaMode::AudioVideo,
            local_media: None,
            remote_tracks: Vec::new(),
            media_hint: None,
            negotiation: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Status(String),
    Chat(ChatEntry),
    ChatCleared,
    RemoteMediaAvailable(RemoteTrack),
    RemoteMediaUnavailable,
    LocalMediaReady,
    LocalMediaFailed(MediaError),
    Violation(ProtocolViolation),
    NegotiationFailed(NegotiationError),
    NegotiationTornDown { generation: u64 },
}
