use crate::id_types::{ParticipantId, TrackId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media kind of a published track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A media track published into a room.
///
/// The owning participant holds the track for its lifetime; the SFU graph
/// mirrors it while the publisher remains active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    /// Source label, e.g. "camera", "microphone", "screen".
    pub label: String,
    pub owner: ParticipantId,
    /// Whether the publisher offers multiple simulcast encodings.
    pub simulcast: bool,
    pub published_at: DateTime<Utc>,
}

impl MediaTrack {
    pub fn new(
        id: TrackId,
        kind: TrackKind,
        label: impl Into<String>,
        owner: ParticipantId,
    ) -> Self {
        MediaTrack {
            id,
            kind,
            label: label.into(),
            owner,
            simulcast: false,
            published_at: Utc::now(),
        }
    }

    pub fn with_simulcast(mut self, simulcast: bool) -> Self {
        self.simulcast = simulcast;
        self
    }
}
