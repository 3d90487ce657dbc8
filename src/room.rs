//! A single conference room: membership, tracks, metadata, lifecycle.
//!
//! The room serializes all mutations behind one reader-writer lock and
//! emits events only after the lock is released, so no subscriber can
//! re-enter the room under its own critical section. A room never deletes
//! itself: when the empty timer fires it notifies the manager, which
//! performs the delete outside any room lock.

use crate::error::CoreError;
use crate::events::{EventBus, EventPayload, RoomEvent};
use crate::id_types::{ParticipantId, RoomId, TrackId, UserId};
use crate::participant::{Grants, Metadata, Participant, ParticipantInfo, ParticipantState};
use crate::track::MediaTrack;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Creation-time options for a room.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub name: String,
    /// 0 falls back to the deployment default (which may itself be 0,
    /// meaning unlimited).
    pub max_participants: usize,
    /// `None` falls back to the deployment default; an explicit zero means
    /// the room is never reaped for being empty.
    pub empty_timeout: Option<Duration>,
    pub metadata: Metadata,
    pub creator: Option<UserId>,
}

#[derive(Debug)]
struct RoomState {
    participants: HashMap<ParticipantId, Participant>,
    metadata: Metadata,
    closed: bool,
    empty_since: Option<Instant>,
}

#[derive(Debug)]
pub struct Room {
    id: RoomId,
    name: String,
    created_at: DateTime<Utc>,
    creator: Option<UserId>,
    max_participants: usize,
    empty_timeout: Duration,
    state: RwLock<RoomState>,
    events: EventBus,
    /// Notifies the manager's reaper when the empty timer fires.
    empty_tx: mpsc::UnboundedSender<RoomId>,
    empty_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        options: RoomOptions,
        default_max_participants: usize,
        default_empty_timeout: Duration,
        events: EventBus,
        empty_tx: mpsc::UnboundedSender<RoomId>,
    ) -> Self {
        let max_participants = if options.max_participants == 0 {
            default_max_participants
        } else {
            options.max_participants
        };
        let empty_timeout = options.empty_timeout.unwrap_or(default_empty_timeout);
        let room = Room {
            id,
            name: options.name,
            created_at: Utc::now(),
            creator: options.creator,
            max_participants,
            empty_timeout,
            state: RwLock::new(RoomState {
                participants: HashMap::new(),
                metadata: options.metadata,
                closed: false,
                empty_since: Some(Instant::now()),
            }),
            events,
            empty_tx,
            empty_timer: StdMutex::new(None),
        };
        // A freshly created room is empty; its reap clock starts now.
        room.arm_empty_timer();
        room
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn creator(&self) -> Option<&UserId> {
        self.creator.as_ref()
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    pub fn empty_timeout(&self) -> Duration {
        self.empty_timeout
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn participant_count(&self) -> usize {
        self.state.read().await.participants.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.participants.is_empty()
    }

    /// How long the room has been empty, if it is.
    pub async fn empty_for(&self) -> Option<Duration> {
        self.state.read().await.empty_since.map(|t| t.elapsed())
    }

    pub async fn metadata(&self) -> Metadata {
        self.state.read().await.metadata.clone()
    }

    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.state
            .read()
            .await
            .participants
            .values()
            .map(Participant::info)
            .collect()
    }

    pub async fn participant(&self, id: &ParticipantId) -> Option<ParticipantInfo> {
        self.state
            .read()
            .await
            .participants
            .get(id)
            .map(Participant::info)
    }

    pub async fn grants_of(&self, id: &ParticipantId) -> Option<Grants> {
        self.state.read().await.participants.get(id).map(|p| p.grants)
    }

    pub async fn tracks(&self) -> Vec<MediaTrack> {
        self.state
            .read()
            .await
            .participants
            .values()
            .flat_map(|p| p.tracks().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub async fn find_track(&self, track_id: &TrackId) -> Option<MediaTrack> {
        self.state
            .read()
            .await
            .participants
            .values()
            .find_map(|p| p.track(track_id).cloned())
    }

    /// Admits a participant.
    ///
    /// Enforces membership uniqueness, the closed flag and the participant
    /// cap; disarms the empty timer and emits `participant.joined`.
    pub async fn add_participant(&self, mut participant: Participant) -> Result<ParticipantInfo, CoreError> {
        let info = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CoreError::RoomClosed(self.id.clone()));
            }
            if state.participants.contains_key(&participant.id) {
                return Err(CoreError::ParticipantExists(participant.id));
            }
            if self.max_participants > 0 && state.participants.len() >= self.max_participants {
                return Err(CoreError::RoomFull(self.id.clone(), state.participants.len()));
            }
            participant.transition(ParticipantState::Joined)?;
            let info = participant.info();
            state.participants.insert(participant.id.clone(), participant);
            state.empty_since = None;
            info
        };
        self.disarm_empty_timer();

        info!(room = %self.id, participant = %info.id, "participant joined");
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::ParticipantJoined {
                participant: info.clone(),
            },
        ));
        Ok(info)
    }

    /// Removes a participant, transitioning it to `Disconnected` and
    /// arming the empty timer when the room just became empty.
    pub async fn remove_participant(&self, id: &ParticipantId) -> Result<ParticipantInfo, CoreError> {
        let (info, now_empty) = {
            let mut state = self.state.write().await;
            let mut participant = state
                .participants
                .remove(id)
                .ok_or_else(|| CoreError::ParticipantNotFound(id.clone()))?;
            participant.transition(ParticipantState::Disconnected)?;
            let info = participant.info();
            let now_empty = state.participants.is_empty();
            if now_empty {
                state.empty_since = Some(Instant::now());
            }
            (info, now_empty)
        };
        if now_empty {
            self.arm_empty_timer();
        }

        info!(room = %self.id, participant = %id, "participant left");
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::ParticipantLeft {
                participant: info.clone(),
            },
        ));
        Ok(info)
    }

    /// Registers a track under its owner, gated by the publish grant.
    pub async fn publish_track(
        &self,
        owner: &ParticipantId,
        track: MediaTrack,
    ) -> Result<MediaTrack, CoreError> {
        let published = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CoreError::RoomClosed(self.id.clone()));
            }
            let participant = state
                .participants
                .get_mut(owner)
                .ok_or_else(|| CoreError::ParticipantNotFound(owner.clone()))?;
            if !participant.grants.can_publish {
                return Err(CoreError::Unauthorized(format!(
                    "participant {} lacks the publish grant",
                    owner
                )));
            }
            participant.add_track(track.clone())?;
            track
        };

        info!(room = %self.id, owner = %owner, track = %published.id, "track published");
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::TrackPublished {
                track: published.clone(),
            },
        ));
        Ok(published)
    }

    /// Removes a track. Only the owner or an admin may unpublish.
    pub async fn unpublish_track(
        &self,
        requester: &ParticipantId,
        track_id: &TrackId,
    ) -> Result<MediaTrack, CoreError> {
        let removed = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CoreError::RoomClosed(self.id.clone()));
            }
            let requester_admin = state
                .participants
                .get(requester)
                .ok_or_else(|| CoreError::ParticipantNotFound(requester.clone()))?
                .grants
                .admin;

            let owner_id = state
                .participants
                .values()
                .find(|p| p.track(track_id).is_some())
                .map(|p| p.id.clone())
                .ok_or_else(|| CoreError::TrackNotFound(track_id.clone()))?;

            if &owner_id != requester && !requester_admin {
                return Err(CoreError::Unauthorized(format!(
                    "participant {} may not unpublish track {} owned by {}",
                    requester, track_id, owner_id
                )));
            }

            let owner = state
                .participants
                .get_mut(&owner_id)
                .ok_or_else(|| CoreError::ParticipantNotFound(owner_id.clone()))?;
            owner.remove_track(track_id)?
        };

        info!(room = %self.id, requester = %requester, track = %track_id, "track unpublished");
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::TrackUnpublished {
                track_id: removed.id.clone(),
                owner: removed.owner.clone(),
            },
        ));
        Ok(removed)
    }

    /// Atomically replaces a participant's grant set.
    pub async fn update_participant_grants(
        &self,
        id: &ParticipantId,
        grants: Grants,
    ) -> Result<ParticipantInfo, CoreError> {
        let info = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CoreError::RoomClosed(self.id.clone()));
            }
            let participant = state
                .participants
                .get_mut(id)
                .ok_or_else(|| CoreError::ParticipantNotFound(id.clone()))?;
            participant.grants = grants;
            participant.info()
        };

        debug!(room = %self.id, participant = %id, "participant grants updated");
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::ParticipantUpdated {
                participant: info.clone(),
            },
        ));
        Ok(info)
    }

    /// Merges `patch` into the room metadata and emits the merged bag.
    pub async fn update_metadata(&self, patch: Metadata) -> Result<Metadata, CoreError> {
        let merged = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CoreError::RoomClosed(self.id.clone()));
            }
            for (key, value) in patch {
                state.metadata.insert(key, value);
            }
            state.metadata.clone()
        };

        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::MetadataUpdated {
                metadata: merged.clone(),
            },
        ));
        Ok(merged)
    }

    /// Marks a joined participant as reconnecting after a transport drop.
    pub async fn mark_reconnecting(&self, id: &ParticipantId) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        let participant = state
            .participants
            .get_mut(id)
            .ok_or_else(|| CoreError::ParticipantNotFound(id.clone()))?;
        participant.transition(ParticipantState::Reconnecting)
    }

    /// Restores a reconnecting participant to `Joined`.
    pub async fn mark_rejoined(&self, id: &ParticipantId) -> Result<ParticipantInfo, CoreError> {
        let info = {
            let mut state = self.state.write().await;
            let participant = state
                .participants
                .get_mut(id)
                .ok_or_else(|| CoreError::ParticipantNotFound(id.clone()))?;
            participant.transition(ParticipantState::Joined)?;
            participant.info()
        };
        self.events.publish(RoomEvent::new(
            self.id.clone(),
            EventPayload::ParticipantUpdated {
                participant: info.clone(),
            },
        ));
        Ok(info)
    }

    /// Closes the room. Idempotent; every member transitions to
    /// `Disconnected` and the empty timer is disarmed. The manager emits
    /// `room.deleted` after calling this.
    pub async fn close(&self) {
        let newly_closed = {
            let mut state = self.state.write().await;
            if state.closed {
                false
            } else {
                state.closed = true;
                for participant in state.participants.values_mut() {
                    // Any pre-terminal state may fall to Disconnected here.
                    let _ = participant.transition(ParticipantState::Disconnected);
                }
                state.participants.clear();
                true
            }
        };
        if newly_closed {
            self.disarm_empty_timer();
            info!(room = %self.id, "room closed");
        }
    }

    fn arm_empty_timer(&self) {
        if self.empty_timeout.is_zero() {
            return;
        }
        let timeout = self.empty_timeout;
        let id = self.id.clone();
        let tx = self.empty_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(room = %id, "empty timeout elapsed");
            let _ = tx.send(id);
        });
        let mut slot = self.empty_timer.lock().unwrap();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn disarm_empty_timer(&self) {
        if let Some(handle) = self.empty_timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(handle) = self.empty_timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}
