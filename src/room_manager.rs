//! Global room registry: creation, lookup, authenticated join, deletion,
//! empty-room reaping and shutdown.

use crate::error::CoreError;
use crate::events::{EventBus, EventPayload, RoomEvent};
use crate::id_types::{ParticipantId, RoomId, UserId};
use crate::participant::{Metadata, Participant, ParticipantInfo};
use crate::room::{Room, RoomOptions};
use crate::token::TokenVerifier;
use dashmap::DashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Deployment-time policy for the registry.
#[derive(Debug, Clone)]
pub struct RoomManagerOptions {
    /// Cap applied when a room's own cap is 0. 0 means unlimited.
    pub default_max_participants: usize,
    /// Empty-timeout applied when a room does not specify one. Zero means
    /// rooms are never reaped.
    pub default_empty_timeout: Duration,
    /// Whether a token join against a missing room creates it.
    pub auto_create: bool,
}

impl Default for RoomManagerOptions {
    fn default() -> Self {
        RoomManagerOptions {
            default_max_participants: 0,
            default_empty_timeout: Duration::from_secs(300),
            auto_create: true,
        }
    }
}

/// An authenticated join request as carried by the signaling layer.
#[derive(Debug, Clone)]
pub struct JoinRoomRequest {
    pub room_name: String,
    pub token: String,
    pub metadata: Metadata,
}

pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Room>>,
    by_name: DashMap<String, RoomId>,
    events: EventBus,
    verifier: TokenVerifier,
    options: RoomManagerOptions,
    empty_tx: mpsc::UnboundedSender<RoomId>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    /// Builds the registry and starts its reaper task. The reaper reacts
    /// to empty-timer notifications from rooms and performs the delete
    /// outside any room lock.
    pub fn new(options: RoomManagerOptions, events: EventBus, verifier: TokenVerifier) -> Arc<Self> {
        let (empty_tx, mut empty_rx) = mpsc::unbounded_channel::<RoomId>();
        let manager = Arc::new(RoomManager {
            rooms: DashMap::new(),
            by_name: DashMap::new(),
            events,
            verifier,
            options,
            empty_tx,
            reaper: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let handle = tokio::spawn(async move {
            while let Some(room_id) = empty_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.reap_if_empty(&room_id).await;
            }
        });
        *manager.reaper.lock().unwrap() = Some(handle);
        manager
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Creates a room. Names are unique across the registry.
    pub async fn create_room(&self, options: RoomOptions) -> Result<Arc<Room>, CoreError> {
        let id = RoomId::generate();
        let name = options.name.clone();

        // The name entry is the registration point; concurrent creates of
        // the same name serialize here.
        match self.by_name.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoreError::RoomExists(name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let room = Arc::new(Room::new(
            id.clone(),
            options,
            self.options.default_max_participants,
            self.options.default_empty_timeout,
            self.events.clone(),
            self.empty_tx.clone(),
        ));

        if self.rooms.insert(id.clone(), room.clone()).is_some() {
            // A colliding generated id means the registry is corrupt.
            panic!("duplicate room id in registry: {id}");
        }

        info!(room = %id, name = %name, "room created");
        self.events.publish(RoomEvent::new(
            id,
            EventPayload::RoomCreated { name },
        ));
        Ok(room)
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Room>> {
        let id = self.by_name.get(name)?.value().clone();
        self.get(&id)
    }

    pub fn list(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.rooms.len()
    }

    /// Closes and unregisters a room, then announces `room.deleted`.
    pub async fn delete_room(&self, id: &RoomId) -> Result<(), CoreError> {
        let (_, room) = self
            .rooms
            .remove(id)
            .ok_or_else(|| CoreError::RoomNotFound(id.clone()))?;
        self.by_name.remove(room.name());
        room.close().await;

        info!(room = %id, name = %room.name(), "room deleted");
        self.events
            .publish(RoomEvent::new(id.clone(), EventPayload::RoomDeleted {}));
        Ok(())
    }

    /// Authenticates a token and admits the participant, creating the
    /// room first when policy allows.
    pub async fn join_with_token(
        &self,
        request: JoinRoomRequest,
    ) -> Result<(Arc<Room>, ParticipantInfo), CoreError> {
        let claims = self.verifier.verify(&request.token, &request.room_name)?;

        let room = match self.get_by_name(&request.room_name) {
            Some(room) => room,
            None if self.options.auto_create => {
                match self
                    .create_room(RoomOptions {
                        name: request.room_name.clone(),
                        creator: Some(UserId::from(claims.identity.clone())),
                        ..RoomOptions::default()
                    })
                    .await
                {
                    Ok(room) => room,
                    // A concurrent join created it first; use theirs.
                    Err(CoreError::RoomExists(_)) => {
                        self.get_by_name(&request.room_name).ok_or_else(|| {
                            CoreError::RoomNotFound(RoomId::from(request.room_name.clone()))
                        })?
                    }
                    Err(err) => return Err(err),
                }
            }
            None => {
                return Err(CoreError::RoomNotFound(RoomId::from(
                    request.room_name.clone(),
                )))
            }
        };

        let mut metadata = claims.metadata.clone();
        metadata.extend(request.metadata);
        let participant = Participant::new(
            ParticipantId::from(claims.identity.clone()),
            UserId::from(claims.identity.clone()),
            claims.name.clone(),
            claims.grants(),
        )
        .with_metadata(metadata);

        let info = room.add_participant(participant).await?;
        Ok((room, info))
    }

    /// Deletes every room that has outlived its empty-timeout. Returns
    /// how many were removed. Complements the per-room timers; callers
    /// can run it on their own cadence.
    pub async fn cleanup_empty_rooms(&self) -> usize {
        let mut reaped = 0;
        let candidates: Vec<Arc<Room>> = self.list();
        for room in candidates {
            if room.empty_timeout().is_zero() {
                continue;
            }
            let expired = matches!(
                room.empty_for().await,
                Some(elapsed) if elapsed >= room.empty_timeout()
            );
            if expired && self.delete_room(&room.id().clone()).await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }

    async fn reap_if_empty(&self, id: &RoomId) {
        let Some(room) = self.get(id) else { return };
        if !room.is_empty().await {
            // A join raced the timer notification; the room stays.
            return;
        }
        if let Err(err) = self.delete_room(id).await {
            warn!(room = %id, error = %err, "empty-room reap failed");
        }
    }

    /// Closes every room, clears the registry and stops the reaper.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
        let rooms: Vec<Arc<Room>> = self.list();
        for room in rooms {
            room.close().await;
            self.events.publish(RoomEvent::new(
                room.id().clone(),
                EventPayload::RoomDeleted {},
            ));
        }
        self.rooms.clear();
        self.by_name.clear();
        info!("room manager shut down");
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
    }
}
