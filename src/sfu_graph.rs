//! Binds one room to the external media fabric.
//!
//! The graph owns every `Publisher`/`Subscriber` handle minted for the
//! room and guarantees each one is stopped on every exit path: unsubscribe,
//! unpublish, participant departure and graph shutdown. It never holds
//! references into SFU internals; only the capability handles travel here.

use crate::error::CoreError;
use crate::id_types::{ParticipantId, TrackId};
use crate::room::Room;
use crate::sfu::{MediaSfu, Publisher, Subscriber};
use crate::subscription::{
    SimulcastConfig, Subscription, SubscriptionManager, SubscriptionState, TrackQuality,
};
use crate::track::{MediaTrack, TrackKind};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type EdgeKey = (ParticipantId, ParticipantId, TrackId);

pub struct RoomSfu {
    room: Arc<Room>,
    sfu: Arc<dyn MediaSfu>,
    // Handles are Arc'd so they can be cloned out of the registries
    // before any await; map references never live across a suspension.
    publishers: DashMap<ParticipantId, Arc<dyn Publisher>>,
    subscribers: DashMap<EdgeKey, Arc<dyn Subscriber>>,
    subscriptions: SubscriptionManager,
    auto_subscribe: bool,
}

impl RoomSfu {
    pub fn new(
        room: Arc<Room>,
        sfu: Arc<dyn MediaSfu>,
        simulcast: SimulcastConfig,
        auto_subscribe: bool,
    ) -> Self {
        RoomSfu {
            room,
            sfu,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            subscriptions: SubscriptionManager::new(simulcast),
            auto_subscribe,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Join hook. Mints the ingest handle for publishers and, under the
    /// default policy, subscribes the newcomer to every track already in
    /// the room that it may receive.
    ///
    /// SFU failures here are logged and swallowed: membership survives a
    /// media hiccup.
    pub async fn on_participant_joined(&self, id: &ParticipantId) {
        let Some(grants) = self.room.grants_of(id).await else {
            return;
        };

        if grants.can_publish && !self.publishers.contains_key(id) {
            match self.sfu.create_publisher(id).await {
                Ok(handle) => {
                    self.publishers.insert(id.clone(), Arc::from(handle));
                }
                Err(err) => {
                    warn!(participant = %id, error = %err, "publisher setup failed");
                }
            }
        }

        if !self.auto_subscribe || !grants.can_subscribe {
            return;
        }
        // Tracks committed before this join; concurrent publishes reach
        // the newcomer through the normal publish fan-out.
        for track in self.room.tracks().await {
            if &track.owner == id {
                continue;
            }
            if let Err(err) = self
                .subscribe(id.clone(), track.owner.clone(), track.id.clone(), TrackQuality::Auto, None)
                .await
            {
                warn!(
                    participant = %id,
                    track = %track.id,
                    error = %err,
                    "auto-subscribe failed"
                );
            }
        }
    }

    /// Publishes a track and fans it out to every other member holding
    /// the subscribe grant.
    pub async fn publish_track(
        &self,
        owner: &ParticipantId,
        track_id: TrackId,
        kind: TrackKind,
        label: String,
        simulcast: bool,
    ) -> Result<MediaTrack, CoreError> {
        let track = MediaTrack::new(track_id, kind, label, owner.clone()).with_simulcast(simulcast);
        let track = self.room.publish_track(owner, track).await?;

        if !self.publishers.contains_key(owner) {
            let handle = self.sfu.create_publisher(owner).await?;
            self.publishers.insert(owner.clone(), Arc::from(handle));
        }

        if self.auto_subscribe {
            for member in self.room.participants().await {
                if &member.id == owner {
                    continue;
                }
                let can_subscribe = self
                    .room
                    .grants_of(&member.id)
                    .await
                    .map(|g| g.can_subscribe)
                    .unwrap_or(false);
                if !can_subscribe {
                    continue;
                }
                if let Err(err) = self
                    .subscribe(
                        member.id.clone(),
                        owner.clone(),
                        track.id.clone(),
                        TrackQuality::Auto,
                        None,
                    )
                    .await
                {
                    warn!(
                        subscriber = %member.id,
                        track = %track.id,
                        error = %err,
                        "publish fan-out subscribe failed"
                    );
                }
            }
        }
        Ok(track)
    }

    /// Unpublishes a track and tears down every subscription edge
    /// referencing it.
    pub async fn unpublish_track(
        &self,
        requester: &ParticipantId,
        track_id: &TrackId,
    ) -> Result<(), CoreError> {
        let removed = self.room.unpublish_track(requester, track_id).await?;
        for row in self.subscriptions.for_track(track_id) {
            self.teardown_edge(&row.subscriber, &row.publisher, track_id).await;
        }
        debug!(track = %removed.id, owner = %removed.owner, "track torn down");
        Ok(())
    }

    /// Establishes (or re-tunes) one subscription edge.
    ///
    /// Guarantees: no self-subscription, and exactly one live Subscriber
    /// per (subscriber, publisher, track). Re-subscribing updates the
    /// requested quality and switches the live forwarder's layer.
    pub async fn subscribe(
        &self,
        subscriber: ParticipantId,
        publisher: ParticipantId,
        track_id: TrackId,
        quality: TrackQuality,
        available_bps: Option<u64>,
    ) -> Result<Subscription, CoreError> {
        if subscriber == publisher {
            return Err(CoreError::Validation(
                "participants cannot subscribe to their own tracks".to_string(),
            ));
        }
        let grants = self
            .room
            .grants_of(&subscriber)
            .await
            .ok_or_else(|| CoreError::ParticipantNotFound(subscriber.clone()))?;
        if !grants.can_subscribe {
            return Err(CoreError::Unauthorized(format!(
                "participant {} lacks the subscribe grant",
                subscriber
            )));
        }
        let track = self
            .room
            .find_track(&track_id)
            .await
            .ok_or_else(|| CoreError::TrackNotFound(track_id.clone()))?;
        if track.owner != publisher {
            return Err(CoreError::TrackNotFound(track_id));
        }

        let (row, _created) = self.subscriptions.upsert(
            subscriber.clone(),
            publisher.clone(),
            track_id.clone(),
            quality,
            available_bps,
        );

        let key = (subscriber.clone(), publisher.clone(), track_id.clone());
        let existing = self.subscribers.get(&key).map(|edge| edge.value().clone());
        if let Some(existing) = existing {
            existing.switch_layer(row.effective).await;
            return Ok(row);
        }

        match self
            .sfu
            .create_subscriber(&subscriber, &publisher, &track_id, row.effective)
            .await
        {
            Ok(handle) => {
                let handle: Arc<dyn Subscriber> = Arc::from(handle);
                // A concurrent subscribe may have won the race; keep the
                // first handle and release the duplicate.
                let duplicate = match self.subscribers.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(_) => Some(handle),
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(handle);
                        None
                    }
                };
                if let Some(duplicate) = duplicate {
                    duplicate.stop().await;
                }
                self.subscriptions
                    .set_state(&subscriber, &track_id, SubscriptionState::Subscribed);
                Ok(self.subscriptions.get(&subscriber, &track_id).unwrap_or(row))
            }
            Err(err) => {
                self.subscriptions
                    .set_state(&subscriber, &track_id, SubscriptionState::Failed);
                Err(err)
            }
        }
    }

    /// Removes one subscription edge. A second call for the same pair is
    /// a no-op.
    pub async fn unsubscribe(
        &self,
        subscriber: &ParticipantId,
        track_id: &TrackId,
    ) -> Result<(), CoreError> {
        let Some(row) = self.subscriptions.get(subscriber, track_id) else {
            return Ok(());
        };
        self.subscriptions
            .set_state(subscriber, track_id, SubscriptionState::Unsubscribing);
        self.teardown_edge(subscriber, &row.publisher, track_id).await;
        Ok(())
    }

    /// Departure hook: releases the ingest handle, every edge the
    /// participant holds and every edge pointing at its tracks.
    pub async fn on_participant_left(&self, id: &ParticipantId) {
        if let Some((_, publisher)) = self.publishers.remove(id) {
            publisher.stop().await;
        }
        let edges: Vec<Subscription> = self
            .subscriptions
            .for_subscriber(id)
            .into_iter()
            .chain(self.subscriptions.for_track_owner(id))
            .collect();
        for row in edges {
            self.teardown_edge(&row.subscriber, &row.publisher, &row.track).await;
        }
        info!(participant = %id, "media edges released");
    }

    /// Applies a fresh downlink estimate: every `Auto` edge of the
    /// subscriber may switch layers.
    pub async fn apply_bandwidth(&self, subscriber: &ParticipantId, available_bps: u64) {
        for switch in self.subscriptions.apply_bandwidth(subscriber, available_bps) {
            let key = (
                switch.subscriber.clone(),
                switch.publisher.clone(),
                switch.track.clone(),
            );
            let handle = self.subscribers.get(&key).map(|edge| edge.value().clone());
            if let Some(handle) = handle {
                handle.switch_layer(switch.quality).await;
            }
        }
    }

    /// Stops every handle. Used when the room closes.
    pub async fn shutdown(&self) {
        let edge_keys: Vec<EdgeKey> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        for key in edge_keys {
            if let Some((_, handle)) = self.subscribers.remove(&key) {
                handle.stop().await;
            }
            self.subscriptions.remove(&key.0, &key.2);
        }
        let publisher_ids: Vec<ParticipantId> =
            self.publishers.iter().map(|e| e.key().clone()).collect();
        for id in publisher_ids {
            if let Some((_, handle)) = self.publishers.remove(&id) {
                handle.stop().await;
            }
        }
    }

    pub fn live_subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn live_publisher_count(&self) -> usize {
        self.publishers.len()
    }

    async fn teardown_edge(
        &self,
        subscriber: &ParticipantId,
        publisher: &ParticipantId,
        track_id: &TrackId,
    ) {
        let key = (subscriber.clone(), publisher.clone(), track_id.clone());
        if let Some((_, handle)) = self.subscribers.remove(&key) {
            handle.stop().await;
        }
        self.subscriptions.remove(subscriber, track_id);
    }
}
