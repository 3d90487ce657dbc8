//! Per-user cross-room resource ledger: room and track ceilings plus
//! bandwidth apportionment across a user's active rooms.
//!
//! All bandwidth writes go through this module; other components read
//! snapshots. Lock order is registry first, then the session's own lock.

use crate::error::CoreError;
use crate::id_types::{ParticipantId, RoomId, TrackId, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How a user's bandwidth budget is split across their active rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthStrategy {
    /// Every active room gets an equal share.
    Equal,
    /// Planned: weight rooms by how many tracks the user receives there.
    /// Currently falls through to the Equal split.
    Proportional,
    /// Planned: weight rooms by their `priority` metadata tag. Currently
    /// falls through to the Equal split.
    Priority,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_rooms_per_user: usize,
    pub max_tracks_per_user: usize,
    /// Bits per second across all rooms.
    pub max_bandwidth_per_user: u64,
    pub session_timeout: Duration,
    pub strategy: BandwidthStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_rooms_per_user: 5,
            max_tracks_per_user: 20,
            max_bandwidth_per_user: 10_000_000,
            session_timeout: Duration::from_secs(1800),
            strategy: BandwidthStrategy::Equal,
        }
    }
}

/// One room the user is currently in.
#[derive(Debug, Clone, Serialize)]
pub struct RoomParticipation {
    pub participant_id: ParticipantId,
    /// Tracks the user receives in this room.
    pub subscriptions: HashSet<TrackId>,
    pub allocated_bandwidth: u64,
    /// Priority tag captured from room metadata, for the planned
    /// `Priority` weighting.
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSession {
    pub user_id: UserId,
    pub active_rooms: HashMap<RoomId, RoomParticipation>,
    pub track_count: usize,
    pub total_bandwidth: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

pub struct SessionManager {
    sessions: DashMap<UserId, Arc<Mutex<UserSession>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        SessionManager {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Records a user entering a room, enforcing the per-user room cap
    /// and reapportioning bandwidth. Returns the room's new allocation.
    pub async fn join_room(
        &self,
        user: &UserId,
        room: &RoomId,
        participant: &ParticipantId,
        priority: u32,
    ) -> Result<u64, CoreError> {
        let session = self.get_or_create(user);
        let mut session = session.lock().await;

        if !session.active_rooms.contains_key(room)
            && session.active_rooms.len() >= self.config.max_rooms_per_user
        {
            return Err(CoreError::RoomLimitExceeded(
                user.clone(),
                self.config.max_rooms_per_user,
            ));
        }

        session.active_rooms.insert(
            room.clone(),
            RoomParticipation {
                participant_id: participant.clone(),
                subscriptions: HashSet::new(),
                allocated_bandwidth: 0,
                priority: priority.max(1),
            },
        );
        session.last_activity = Utc::now();
        self.reapportion(&mut session);

        let allocated = session.active_rooms[room].allocated_bandwidth;
        info!(user = %user, room = %room, allocated, "session joined room");
        Ok(allocated)
    }

    /// Removes a room participation and reapportions. Unknown rooms are a
    /// no-op; the capability teardown already happened upstream.
    pub async fn leave_room(&self, user: &UserId, room: &RoomId) -> Result<(), CoreError> {
        let session = self
            .sessions
            .get(user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::SessionNotFound(user.clone()))?;
        let mut session = session.lock().await;

        if let Some(participation) = session.active_rooms.remove(room) {
            session.track_count = session
                .track_count
                .saturating_sub(participation.subscriptions.len());
            session.last_activity = Utc::now();
            self.reapportion(&mut session);
            info!(user = %user, room = %room, "session left room");
        }
        Ok(())
    }

    /// Counts a newly published track against the user's ceiling.
    pub async fn add_track(&self, user: &UserId) -> Result<usize, CoreError> {
        let session = self
            .sessions
            .get(user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::SessionNotFound(user.clone()))?;
        let mut session = session.lock().await;

        if session.track_count >= self.config.max_tracks_per_user {
            return Err(CoreError::TrackLimitExceeded(
                user.clone(),
                self.config.max_tracks_per_user,
            ));
        }
        session.track_count += 1;
        session.last_activity = Utc::now();
        Ok(session.track_count)
    }

    pub async fn remove_track(&self, user: &UserId) -> Result<usize, CoreError> {
        let session = self
            .sessions
            .get(user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::SessionNotFound(user.clone()))?;
        let mut session = session.lock().await;
        session.track_count = session.track_count.saturating_sub(1);
        session.last_activity = Utc::now();
        Ok(session.track_count)
    }

    /// Records that the user now receives `track` in `room`. Bookkeeping
    /// for the planned `Proportional` weighting.
    pub async fn record_subscription(
        &self,
        user: &UserId,
        room: &RoomId,
        track: &TrackId,
    ) -> Result<(), CoreError> {
        self.with_participation(user, room, |participation| {
            participation.subscriptions.insert(track.clone());
        })
        .await
    }

    pub async fn drop_subscription(
        &self,
        user: &UserId,
        room: &RoomId,
        track: &TrackId,
    ) -> Result<(), CoreError> {
        self.with_participation(user, room, |participation| {
            participation.subscriptions.remove(track);
        })
        .await
    }

    /// Updates a room's priority tag. Bookkeeping for the planned
    /// `Priority` weighting.
    pub async fn set_room_priority(
        &self,
        user: &UserId,
        room: &RoomId,
        priority: u32,
    ) -> Result<(), CoreError> {
        self.with_participation(user, room, |participation| {
            participation.priority = priority.max(1);
        })
        .await
    }

    pub async fn session(&self, user: &UserId) -> Option<UserSession> {
        let session = self.sessions.get(user)?.value().clone();
        let session = session.lock().await;
        Some(session.clone())
    }

    pub async fn allocation(&self, user: &UserId, room: &RoomId) -> Option<u64> {
        let session = self.session(user).await?;
        session
            .active_rooms
            .get(room)
            .map(|p| p.allocated_bandwidth)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Purges sessions that have gone idle past the timeout and hold no
    /// active rooms. Returns how many were removed.
    pub async fn cleanup_inactive_sessions(&self) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.session_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(0));
        let snapshot: Vec<(UserId, Arc<Mutex<UserSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut stale = Vec::new();
        for (user, session) in snapshot {
            let session = session.lock().await;
            if session.active_rooms.is_empty() && session.last_activity < cutoff {
                stale.push(user);
            }
        }
        for user in &stale {
            self.sessions.remove(user);
            debug!(user = %user, "inactive session purged");
        }
        stale.len()
    }

    fn get_or_create(&self, user: &UserId) -> Arc<Mutex<UserSession>> {
        self.sessions
            .entry(user.clone())
            .or_insert_with(|| {
                let now = Utc::now();
                Arc::new(Mutex::new(UserSession {
                    user_id: user.clone(),
                    active_rooms: HashMap::new(),
                    track_count: 0,
                    total_bandwidth: 0,
                    created_at: now,
                    last_activity: now,
                }))
            })
            .value()
            .clone()
    }

    async fn with_participation<F>(
        &self,
        user: &UserId,
        room: &RoomId,
        mutate: F,
    ) -> Result<(), CoreError>
    where
        F: FnOnce(&mut RoomParticipation),
    {
        let session = self
            .sessions
            .get(user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::SessionNotFound(user.clone()))?;
        let mut session = session.lock().await;
        let participation = session
            .active_rooms
            .get_mut(room)
            .ok_or_else(|| CoreError::RoomNotFound(room.clone()))?;
        mutate(participation);
        session.last_activity = Utc::now();
        self.reapportion(&mut session);
        Ok(())
    }

    /// Single write path for bandwidth. Integer division rounds down, so
    /// the sum never exceeds the per-user budget.
    fn reapportion(&self, session: &mut UserSession) {
        let budget = self.config.max_bandwidth_per_user;
        let room_count = session.active_rooms.len() as u64;
        if room_count == 0 {
            session.total_bandwidth = 0;
            return;
        }

        // TODO: weight Proportional by the recorded subscription counts and
        // Priority by the per-room priority tag; until then both fall
        // through to the Equal split.
        let share = match self.config.strategy {
            BandwidthStrategy::Equal
            | BandwidthStrategy::Proportional
            | BandwidthStrategy::Priority => budget / room_count,
        };

        let mut total = 0;
        for participation in session.active_rooms.values_mut() {
            participation.allocated_bandwidth = share;
            total += share;
        }
        session.total_bandwidth = total;
    }
}
