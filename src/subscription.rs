//! Per-subscription quality state and simulcast layer selection.

use crate::id_types::{ParticipantId, TrackId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Quality a subscriber asks for. `Auto` lets downlink bandwidth drive
/// the layer; explicit levels are sticky until the next subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackQuality {
    High,
    Medium,
    Low,
    Auto,
}

/// Concrete simulcast rung, as opposed to the request-side [`TrackQuality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerQuality {
    High,
    Medium,
    Low,
}

/// One simulcast encoding offered by a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulcastLayer {
    pub quality: LayerQuality,
    pub max_width: u32,
    pub max_height: u32,
    pub max_bitrate: u64,
    pub max_framerate: u32,
}

/// Ordered layer set, highest bitrate first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulcastConfig {
    layers: Vec<SimulcastLayer>,
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        SimulcastConfig::new(vec![
            SimulcastLayer {
                quality: LayerQuality::High,
                max_width: 1280,
                max_height: 720,
                max_bitrate: 2_500_000,
                max_framerate: 30,
            },
            SimulcastLayer {
                quality: LayerQuality::Medium,
                max_width: 640,
                max_height: 360,
                max_bitrate: 800_000,
                max_framerate: 20,
            },
            SimulcastLayer {
                quality: LayerQuality::Low,
                max_width: 320,
                max_height: 180,
                max_bitrate: 250_000,
                max_framerate: 15,
            },
        ])
    }
}

impl SimulcastConfig {
    /// Builds a config, sorting layers by decreasing bitrate ceiling.
    /// Panics on an empty layer list; a publisher always has at least one
    /// encoding.
    pub fn new(mut layers: Vec<SimulcastLayer>) -> Self {
        assert!(!layers.is_empty(), "simulcast layer list must not be empty");
        layers.sort_by(|a, b| b.max_bitrate.cmp(&a.max_bitrate));
        SimulcastConfig { layers }
    }

    pub fn layers(&self) -> &[SimulcastLayer] {
        &self.layers
    }

    fn highest(&self) -> &SimulcastLayer {
        &self.layers[0]
    }

    fn lowest(&self) -> &SimulcastLayer {
        self.layers.last().unwrap_or(&self.layers[0])
    }

    /// Picks the layer to forward for a requested quality and the current
    /// downlink estimate.
    ///
    /// `Auto` walks the layers from highest to lowest and returns the
    /// first whose bitrate ceiling fits; when none fit (including a zero
    /// estimate) the lowest layer is returned. With no estimate at all the
    /// highest layer wins. Explicit requests map to the tagged layer.
    pub fn select_layer(
        &self,
        requested: TrackQuality,
        available_bps: Option<u64>,
    ) -> &SimulcastLayer {
        match requested {
            TrackQuality::Auto => match available_bps {
                None => self.highest(),
                Some(bandwidth) => self
                    .layers
                    .iter()
                    .find(|layer| layer.max_bitrate <= bandwidth)
                    .unwrap_or_else(|| self.lowest()),
            },
            TrackQuality::High => self.by_quality(LayerQuality::High),
            TrackQuality::Medium => self.by_quality(LayerQuality::Medium),
            TrackQuality::Low => self.by_quality(LayerQuality::Low),
        }
    }

    fn by_quality(&self, quality: LayerQuality) -> &SimulcastLayer {
        self.layers
            .iter()
            .find(|layer| layer.quality == quality)
            .unwrap_or_else(|| self.lowest())
    }
}

/// Lifecycle of one (subscriber, track) edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Subscribing,
    Subscribed,
    Unsubscribing,
    Unsubscribed,
    Failed,
}

/// One subscription row. At most one exists per (subscriber, track);
/// re-subscribing updates the quality in place.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub subscriber: ParticipantId,
    pub publisher: ParticipantId,
    pub track: TrackId,
    pub requested: TrackQuality,
    /// Layer currently forwarded.
    pub effective: LayerQuality,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A quality change the SFU should act on.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSwitch {
    pub subscriber: ParticipantId,
    pub publisher: ParticipantId,
    pub track: TrackId,
    pub quality: LayerQuality,
}

/// Tracks every subscription's quality state for one room.
pub struct SubscriptionManager {
    rows: DashMap<(ParticipantId, TrackId), Subscription>,
    simulcast: SimulcastConfig,
}

impl SubscriptionManager {
    pub fn new(simulcast: SimulcastConfig) -> Self {
        SubscriptionManager {
            rows: DashMap::new(),
            simulcast,
        }
    }

    pub fn simulcast(&self) -> &SimulcastConfig {
        &self.simulcast
    }

    /// Creates or updates the row for (subscriber, track).
    ///
    /// Returns the row snapshot and whether it was newly created. An
    /// existing row keeps its identity; only quality and timestamps move.
    pub fn upsert(
        &self,
        subscriber: ParticipantId,
        publisher: ParticipantId,
        track: TrackId,
        requested: TrackQuality,
        available_bps: Option<u64>,
    ) -> (Subscription, bool) {
        let effective = self.simulcast.select_layer(requested, available_bps).quality;
        let key = (subscriber.clone(), track.clone());
        let mut created = false;
        let row = self
            .rows
            .entry(key)
            .and_modify(|row| {
                row.requested = requested;
                row.effective = effective;
                row.updated_at = Utc::now();
            })
            .or_insert_with(|| {
                created = true;
                let now = Utc::now();
                Subscription {
                    subscriber,
                    publisher,
                    track,
                    requested,
                    effective,
                    state: SubscriptionState::Subscribing,
                    created_at: now,
                    updated_at: now,
                }
            });
        let snapshot = row.value().clone();
        drop(row);
        (snapshot, created)
    }

    pub fn set_state(&self, subscriber: &ParticipantId, track: &TrackId, state: SubscriptionState) {
        if let Some(mut row) = self.rows.get_mut(&(subscriber.clone(), track.clone())) {
            row.state = state;
            row.updated_at = Utc::now();
        }
    }

    /// Removes the row; a second call for the same pair is a no-op.
    pub fn remove(&self, subscriber: &ParticipantId, track: &TrackId) -> Option<Subscription> {
        self.rows
            .remove(&(subscriber.clone(), track.clone()))
            .map(|(_, mut row)| {
                row.state = SubscriptionState::Unsubscribed;
                row
            })
    }

    pub fn get(&self, subscriber: &ParticipantId, track: &TrackId) -> Option<Subscription> {
        self.rows
            .get(&(subscriber.clone(), track.clone()))
            .map(|row| row.value().clone())
    }

    pub fn for_track(&self, track: &TrackId) -> Vec<Subscription> {
        self.rows
            .iter()
            .filter(|entry| &entry.value().track == track)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn for_subscriber(&self, subscriber: &ParticipantId) -> Vec<Subscription> {
        self.rows
            .iter()
            .filter(|entry| &entry.value().subscriber == subscriber)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Rows whose publisher side is `owner`, i.e. edges pointing at that
    /// participant's tracks.
    pub fn for_track_owner(&self, owner: &ParticipantId) -> Vec<Subscription> {
        self.rows
            .iter()
            .filter(|entry| &entry.value().publisher == owner)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Re-evaluates every `Auto` subscription of one subscriber against a
    /// fresh downlink estimate. Explicit quality requests never move.
    /// Returns the switches whose effective layer changed.
    pub fn apply_bandwidth(
        &self,
        subscriber: &ParticipantId,
        available_bps: u64,
    ) -> Vec<LayerSwitch> {
        let mut switches = Vec::new();
        for mut entry in self.rows.iter_mut() {
            let row = entry.value_mut();
            if &row.subscriber != subscriber || row.requested != TrackQuality::Auto {
                continue;
            }
            let next = self
                .simulcast
                .select_layer(TrackQuality::Auto, Some(available_bps))
                .quality;
            if next != row.effective {
                debug!(
                    subscriber = %row.subscriber,
                    track = %row.track,
                    from = ?row.effective,
                    to = ?next,
                    "bandwidth-driven layer switch"
                );
                row.effective = next;
                row.updated_at = Utc::now();
                switches.push(LayerSwitch {
                    subscriber: row.subscriber.clone(),
                    publisher: row.publisher.clone(),
                    track: row.track.clone(),
                    quality: next,
                });
            }
        }
        switches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers_3m_1_5m_500k() -> SimulcastConfig {
        SimulcastConfig::new(vec![
            SimulcastLayer {
                quality: LayerQuality::Low,
                max_width: 320,
                max_height: 180,
                max_bitrate: 500_000,
                max_framerate: 15,
            },
            SimulcastLayer {
                quality: LayerQuality::High,
                max_width: 1280,
                max_height: 720,
                max_bitrate: 3_000_000,
                max_framerate: 30,
            },
            SimulcastLayer {
                quality: LayerQuality::Medium,
                max_width: 640,
                max_height: 360,
                max_bitrate: 1_500_000,
                max_framerate: 20,
            },
        ])
    }

    #[test]
    fn test_layers_sorted_by_bitrate() {
        let config = layers_3m_1_5m_500k();
        let bitrates: Vec<u64> = config.layers().iter().map(|l| l.max_bitrate).collect();
        assert_eq!(bitrates, vec![3_000_000, 1_500_000, 500_000]);
    }

    #[test]
    fn test_auto_selection_under_bandwidth() {
        let config = layers_3m_1_5m_500k();
        let pick = |bps| config.select_layer(TrackQuality::Auto, Some(bps)).quality;
        assert_eq!(pick(1_000_000), LayerQuality::Low);
        assert_eq!(pick(1_500_000), LayerQuality::Medium);
        assert_eq!(pick(400_000), LayerQuality::Low);
        assert_eq!(pick(10_000_000), LayerQuality::High);
    }

    #[test]
    fn test_auto_with_zero_bandwidth_returns_lowest() {
        let config = layers_3m_1_5m_500k();
        assert_eq!(
            config.select_layer(TrackQuality::Auto, Some(0)).quality,
            LayerQuality::Low
        );
    }

    #[test]
    fn test_auto_with_no_estimate_returns_highest() {
        let config = layers_3m_1_5m_500k();
        assert_eq!(
            config.select_layer(TrackQuality::Auto, None).quality,
            LayerQuality::High
        );
    }

    #[test]
    fn test_explicit_requests_map_to_tagged_layer() {
        let config = layers_3m_1_5m_500k();
        assert_eq!(
            config.select_layer(TrackQuality::Medium, Some(100)).quality,
            LayerQuality::Medium
        );
        assert_eq!(
            config.select_layer(TrackQuality::High, Some(0)).quality,
            LayerQuality::High
        );
    }

    #[test]
    fn test_resubscribe_updates_quality_in_place() {
        let manager = SubscriptionManager::new(layers_3m_1_5m_500k());
        let sub = ParticipantId::from("s");
        let publisher = ParticipantId::from("p");
        let track = TrackId::from("t");

        let (first, created) = manager.upsert(
            sub.clone(),
            publisher.clone(),
            track.clone(),
            TrackQuality::High,
            None,
        );
        assert!(created);
        assert_eq!(first.requested, TrackQuality::High);

        let (second, created) = manager.upsert(
            sub.clone(),
            publisher,
            track.clone(),
            TrackQuality::Low,
            None,
        );
        assert!(!created);
        assert_eq!(second.requested, TrackQuality::Low);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = SubscriptionManager::new(SimulcastConfig::default());
        let sub = ParticipantId::from("s");
        let track = TrackId::from("t");
        manager.upsert(
            sub.clone(),
            ParticipantId::from("p"),
            track.clone(),
            TrackQuality::Auto,
            None,
        );

        let removed = manager.remove(&sub, &track).unwrap();
        assert_eq!(removed.state, SubscriptionState::Unsubscribed);
        assert!(manager.remove(&sub, &track).is_none());
    }

    #[test]
    fn test_bandwidth_moves_auto_but_not_explicit() {
        let manager = SubscriptionManager::new(layers_3m_1_5m_500k());
        let sub = ParticipantId::from("s");
        let publisher = ParticipantId::from("p");

        manager.upsert(
            sub.clone(),
            publisher.clone(),
            TrackId::from("auto-track"),
            TrackQuality::Auto,
            None,
        );
        manager.upsert(
            sub.clone(),
            publisher,
            TrackId::from("pinned-track"),
            TrackQuality::High,
            None,
        );

        let switches = manager.apply_bandwidth(&sub, 1_600_000);
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].track, TrackId::from("auto-track"));
        assert_eq!(switches[0].quality, LayerQuality::Medium);

        // Same estimate again: nothing changes.
        assert!(manager.apply_bandwidth(&sub, 1_600_000).is_empty());

        let pinned = manager.get(&sub, &TrackId::from("pinned-track")).unwrap();
        assert_eq!(pinned.effective, LayerQuality::High);
    }

    #[test]
    fn test_for_track_and_for_subscriber() {
        let manager = SubscriptionManager::new(SimulcastConfig::default());
        let track = TrackId::from("t");
        for name in ["a", "b", "c"] {
            manager.upsert(
                ParticipantId::from(name),
                ParticipantId::from("pub"),
                track.clone(),
                TrackQuality::Auto,
                None,
            );
        }
        assert_eq!(manager.for_track(&track).len(), 3);
        assert_eq!(manager.for_subscriber(&ParticipantId::from("a")).len(), 1);
    }
}
