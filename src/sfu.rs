//! Capability interface to the external media fabric.
//!
//! The core never touches codecs, SRTP or ICE. It consumes opaque
//! [`Publisher`] and [`Subscriber`] handles minted by an embedding-provided
//! [`MediaSfu`], and guarantees `stop` is called on every exit path so the
//! underlying transport resources are released.

use crate::error::CoreError;
use crate::id_types::{ParticipantId, TrackId};
use crate::subscription::LayerQuality;
use async_trait::async_trait;

/// Media ingest handle for one publishing participant.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Releases transport resources. Idempotent.
    async fn stop(&self);
}

/// Media forwarding handle for one (subscriber, publisher, track) edge.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Releases transport resources. Idempotent.
    async fn stop(&self);

    /// Asks the forwarder to switch to a different simulcast layer.
    async fn switch_layer(&self, quality: LayerQuality);
}

/// Factory for publisher/subscriber capabilities, implemented by the
/// embedding media engine.
#[async_trait]
pub trait MediaSfu: Send + Sync {
    async fn create_publisher(
        &self,
        participant: &ParticipantId,
    ) -> Result<Box<dyn Publisher>, CoreError>;

    async fn create_subscriber(
        &self,
        subscriber: &ParticipantId,
        publisher: &ParticipantId,
        track: &TrackId,
        quality: LayerQuality,
    ) -> Result<Box<dyn Subscriber>, CoreError>;
}

/// SFU that mints inert handles. Lets the core run without a media engine:
/// signaling-only deployments, load simulation, tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSfu;

struct NullHandle;

#[async_trait]
impl Publisher for NullHandle {
    async fn stop(&self) {}
}

#[async_trait]
impl Subscriber for NullHandle {
    async fn stop(&self) {}
    async fn switch_layer(&self, _quality: LayerQuality) {}
}

#[async_trait]
impl MediaSfu for NullSfu {
    async fn create_publisher(
        &self,
        _participant: &ParticipantId,
    ) -> Result<Box<dyn Publisher>, CoreError> {
        Ok(Box::new(NullHandle))
    }

    async fn create_subscriber(
        &self,
        _subscriber: &ParticipantId,
        _publisher: &ParticipantId,
        _track: &TrackId,
        _quality: LayerQuality,
    ) -> Result<Box<dyn Subscriber>, CoreError> {
        Ok(Box::new(NullHandle))
    }
}
