use crate::error::CoreError;
use crate::id_types::{ParticipantId, TrackId, UserId};
use crate::track::MediaTrack;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque key-value bag attached to rooms and participants. Frozen
/// (cloned) whenever it crosses an event boundary.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Lifecycle state of a participant.
///
/// ```text
/// Joining ──(added to room)──► Joined
/// Joined  ──(transport drop)─► Reconnecting
/// Reconnecting ──(success)───► Joined
/// Reconnecting ──(give up)───► Disconnected
/// Joined  ──(remove)─────────► Disconnected
/// ```
///
/// `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    Joining,
    Joined,
    Reconnecting,
    Disconnected,
}

impl ParticipantState {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition(self, next: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (self, next),
            (Joining, Joined)
                | (Joined, Reconnecting)
                | (Reconnecting, Joined)
                | (Reconnecting, Disconnected)
                | (Joined, Disconnected)
                // Admission failures tear a Joining participant down directly.
                | (Joining, Disconnected)
        )
    }
}

/// Boolean capabilities attached to a participant, derived from its entry
/// token. Immutable for the session unless an admin-authorized mutator
/// replaces them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    pub admin: bool,
    pub hidden: bool,
    pub recorder: bool,
}

/// A single authenticated presence in a room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub name: String,
    pub metadata: Metadata,
    /// Free-form role tag, e.g. "speaker", "moderator".
    pub role: Option<String>,
    pub grants: Grants,
    pub state: ParticipantState,
    pub joined_at: DateTime<Utc>,
    tracks: HashMap<TrackId, MediaTrack>,
}

impl Participant {
    pub fn new(id: ParticipantId, user_id: UserId, name: impl Into<String>, grants: Grants) -> Self {
        Participant {
            id,
            user_id,
            name: name.into(),
            metadata: Metadata::new(),
            role: None,
            grants,
            state: ParticipantState::Joining,
            joined_at: Utc::now(),
            tracks: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Moves the state machine, rejecting transitions it forbids.
    pub fn transition(&mut self, next: ParticipantState) -> Result<(), CoreError> {
        if !self.state.can_transition(next) {
            return Err(CoreError::InvalidState(format!(
                "participant {} cannot move {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Registers a track this participant owns. The caller has already
    /// checked the publish grant; ownership is enforced here.
    pub fn add_track(&mut self, track: MediaTrack) -> Result<(), CoreError> {
        if track.owner != self.id {
            return Err(CoreError::InvalidState(format!(
                "track {} is owned by {}, not {}",
                track.id, track.owner, self.id
            )));
        }
        if self.tracks.contains_key(&track.id) {
            return Err(CoreError::TrackExists(track.id));
        }
        self.tracks.insert(track.id.clone(), track);
        Ok(())
    }

    pub fn remove_track(&mut self, track_id: &TrackId) -> Result<MediaTrack, CoreError> {
        self.tracks
            .remove(track_id)
            .ok_or_else(|| CoreError::TrackNotFound(track_id.clone()))
    }

    pub fn track(&self, track_id: &TrackId) -> Option<&MediaTrack> {
        self.tracks.get(track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.values()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Cloned, serializable view carried inside events so subscribers
    /// never alias live participant state.
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            role: self.role.clone(),
            state: self.state,
            hidden: self.grants.hidden,
            joined_at: self.joined_at,
        }
    }
}

/// Immutable snapshot of a participant at the moment an event committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub name: String,
    pub metadata: Metadata,
    pub role: Option<String>,
    pub state: ParticipantState,
    pub hidden: bool,
    pub joined_at: DateTime<Utc>,
}
