//! The signaling protocol and its dispatcher.
//!
//! Frames are UTF-8 JSON objects `{type, room_id?, data?}` riding a
//! bidirectional transport the embedding host provides. The handler is
//! the engine's front door: it authenticates joins, drives the room /
//! session / SFU components and fans committed room events back out to
//! every connection in the room.

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{EventBus, EventPayload, EventType, RoomEvent, SubscriptionHandle};
use crate::id_types::{ParticipantId, RoomId, TrackId, UserId};
use crate::participant::Metadata;
use crate::quality::{QualityMonitor, TransportStats};
use crate::reconnect::{ReconnectAttempt, ReconnectionController, ReconnectionState};
use crate::room::Room;
use crate::room_manager::{JoinRoomRequest, RoomManager, RoomManagerOptions};
use crate::session::SessionManager;
use crate::sfu::MediaSfu;
use crate::sfu_graph::RoomSfu;
use crate::subscription::TrackQuality;
use crate::token::TokenVerifier;
use crate::track::TrackKind;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Closed set of frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    JoinRoom,
    LeaveRoom,
    PublishTrack,
    UnpublishTrack,
    SubscribeTrack,
    UnsubscribeTrack,
    UpdateMetadata,
    SendData,
    RoomEvent,
    Error,
    Ping,
    Pong,
}

/// One signaling frame. `data` is an opaque nested object decoded per
/// frame type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SignalFrame {
    pub fn new(kind: FrameType) -> Self {
        SignalFrame {
            kind,
            room_id: None,
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(
        kind: FrameType,
        room_id: Option<RoomId>,
        data: &T,
    ) -> Result<Self, CoreError> {
        let data = serde_json::to_value(data)
            .map_err(|e| CoreError::Validation(format!("unencodable frame data: {e}")))?;
        Ok(SignalFrame {
            kind,
            room_id,
            data: Some(data),
        })
    }

    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|e| CoreError::Validation(format!("malformed frame: {e}")))
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self)
            .map_err(|e| CoreError::Validation(format!("unencodable frame: {e}")))
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| CoreError::Validation("frame is missing data".to_string()))?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::Validation(format!("invalid frame data: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomData {
    pub room_id: String,
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedData {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishTrackData {
    pub track_id: TrackId,
    pub kind: TrackKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub simulcast: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpublishTrackData {
    pub track_id: TrackId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeTrackData {
    /// Publisher whose track is requested.
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
    #[serde(default)]
    pub quality: Option<TrackQuality>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeTrackData {
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMetadataData {
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDataData {
    pub topic: String,
    pub payload: Bytes,
    /// Explicit recipients; empty means everyone else in the room.
    #[serde(default)]
    pub to: Vec<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEventData {
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

pub type FrameSender = mpsc::Sender<SignalFrame>;

/// Outbound queue depth per connection. Slow consumers lose room events
/// rather than stalling the engine.
const OUTBOUND_BUFFER: usize = 64;

/// Per-transport-connection state, owned by the transport task.
pub struct ConnectionContext {
    outbound: FrameSender,
    identity: Option<(RoomId, ParticipantId, UserId)>,
}

impl ConnectionContext {
    pub fn identity(&self) -> Option<&(RoomId, ParticipantId, UserId)> {
        self.identity.as_ref()
    }

    async fn send(&self, frame: SignalFrame) {
        // The connection owner holds the receiver; a send only fails when
        // the transport already went away.
        let _ = self.outbound.send(frame).await;
    }
}

/// The engine's signaling front door. Owns the room registry, session
/// ledger, per-room SFU graphs, quality monitor and reconnection
/// controller, and the registry of live connections.
pub struct SignalingHandler {
    rooms: Arc<RoomManager>,
    sessions: Arc<SessionManager>,
    sfu: Arc<dyn MediaSfu>,
    graphs: DashMap<RoomId, Arc<RoomSfu>>,
    connections: Arc<DashMap<(RoomId, ParticipantId), FrameSender>>,
    quality: Arc<QualityMonitor>,
    reconnect: ReconnectionController,
    config: EngineConfig,
    _event_fanout: SubscriptionHandle,
}

impl SignalingHandler {
    /// Builds the full engine around the provided media capability.
    pub fn new(config: EngineConfig, sfu: Arc<dyn MediaSfu>) -> Arc<Self> {
        let events = EventBus::new();
        let verifier = TokenVerifier::new(config.token_secret.clone());
        let rooms = RoomManager::new(
            RoomManagerOptions {
                default_max_participants: config.max_participants_per_room,
                default_empty_timeout: config.empty_room_timeout,
                auto_create: config.auto_create_rooms,
            },
            events.clone(),
            verifier,
        );
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        let quality = Arc::new(QualityMonitor::new(
            config.quality_thresholds,
            config.quality_history_limit,
        ));
        let reconnect = ReconnectionController::new(config.reconnection.clone());

        let connections: Arc<DashMap<(RoomId, ParticipantId), FrameSender>> =
            Arc::new(DashMap::new());
        let fanout_connections = connections.clone();
        let fanout = events.subscribe_all(move |event| {
            fan_out_event(&fanout_connections, event);
        });

        let handler = Arc::new(SignalingHandler {
            rooms,
            sessions,
            sfu,
            graphs: DashMap::new(),
            connections,
            quality,
            reconnect,
            config,
            _event_fanout: fanout,
        });

        // Terminal reconnection states feed back into membership: success
        // restores Joined, giving up finalizes the departure.
        let weak = Arc::downgrade(&handler);
        handler.reconnect.on_result(move |room, participant, state| {
            let Some(handler) = weak.upgrade() else { return };
            let room = room.clone();
            let participant = participant.clone();
            tokio::spawn(async move {
                match state {
                    ReconnectionState::Reconnected => {
                        if let Some(room) = handler.rooms.get(&room) {
                            if let Err(err) = room.mark_rejoined(&participant).await {
                                warn!(participant = %participant, error = %err, "rejoin bookkeeping failed");
                            }
                        }
                    }
                    ReconnectionState::Failed => {
                        handler.finalize_departure(&room, &participant).await;
                    }
                    _ => {}
                }
            });
        });

        // Room deletions drop the room's graph and connections.
        let weak = Arc::downgrade(&handler);
        handler
            .rooms
            .events()
            .subscribe(EventType::RoomDeleted, move |event| {
                let Some(handler) = weak.upgrade() else { return };
                let room_id = event.room_id.clone();
                handler.connections.retain(|key, _| key.0 != room_id);
                if let Some((_, graph)) = handler.graphs.remove(&room_id) {
                    tokio::spawn(async move { graph.shutdown().await });
                }
            })
            .detach();

        handler
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn quality(&self) -> &Arc<QualityMonitor> {
        &self.quality
    }

    pub fn reconnections(&self) -> &ReconnectionController {
        &self.reconnect
    }

    /// Opens a logical connection: the transport task keeps the context
    /// and drains the returned stream of outbound frames.
    pub fn open_connection(&self) -> (ConnectionContext, ReceiverStream<SignalFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            ConnectionContext {
                outbound: tx,
                identity: None,
            },
            ReceiverStream::new(rx),
        )
    }

    /// Decodes and dispatches one raw frame, translating any failure into
    /// an outbound `error` frame.
    pub async fn handle_raw(&self, conn: &mut ConnectionContext, raw: &str) {
        match SignalFrame::decode(raw) {
            Ok(frame) => self.handle_frame(conn, frame).await,
            Err(err) => self.send_error(conn, &err).await,
        }
    }

    /// Dispatches one decoded frame.
    pub async fn handle_frame(&self, conn: &mut ConnectionContext, frame: SignalFrame) {
        if let Err(err) = self.dispatch(conn, frame).await {
            self.send_error(conn, &err).await;
        }
    }

    async fn dispatch(
        &self,
        conn: &mut ConnectionContext,
        frame: SignalFrame,
    ) -> Result<(), CoreError> {
        match frame.kind {
            FrameType::Ping => {
                conn.send(SignalFrame::new(FrameType::Pong)).await;
                Ok(())
            }
            FrameType::Pong => Ok(()),
            FrameType::JoinRoom => self.handle_join(conn, frame.payload()?).await,
            FrameType::LeaveRoom => self.handle_leave(conn).await,
            FrameType::PublishTrack => self.handle_publish(conn, frame.payload()?).await,
            FrameType::UnpublishTrack => self.handle_unpublish(conn, frame.payload()?).await,
            FrameType::SubscribeTrack => self.handle_subscribe(conn, frame.payload()?).await,
            FrameType::UnsubscribeTrack => self.handle_unsubscribe(conn, frame.payload()?).await,
            FrameType::UpdateMetadata => self.handle_update_metadata(conn, frame.payload()?).await,
            FrameType::SendData => self.handle_send_data(conn, frame.payload()?).await,
            FrameType::RoomEvent | FrameType::Error => Err(CoreError::Validation(
                "server-originated frame type".to_string(),
            )),
        }
    }

    async fn handle_join(
        &self,
        conn: &mut ConnectionContext,
        data: JoinRoomData,
    ) -> Result<(), CoreError> {
        if conn.identity.is_some() {
            return Err(CoreError::Validation(
                "connection already joined a room".to_string(),
            ));
        }

        let (room, info) = self
            .rooms
            .join_with_token(JoinRoomRequest {
                room_name: data.room_id.clone(),
                token: data.token,
                metadata: Metadata::new(),
            })
            .await?;

        let user = info.user_id.clone();
        let priority = room_priority(&room).await;
        if let Err(err) = self
            .sessions
            .join_room(&user, room.id(), &info.id, priority)
            .await
        {
            // The ledger rejected the join; roll the membership back.
            let _ = room.remove_participant(&info.id).await;
            return Err(err);
        }

        let graph = self.graph_for(&room);
        graph.on_participant_joined(&info.id).await;

        self.connections
            .insert((room.id().clone(), info.id.clone()), conn.outbound.clone());
        conn.identity = Some((room.id().clone(), info.id.clone(), user));

        info!(room = %room.id(), participant = %info.id, "signaling join complete");
        let reply = SignalFrame::with_data(
            FrameType::JoinRoom,
            Some(room.id().clone()),
            &JoinedData {
                participant_id: info.id,
            },
        )?;
        conn.send(reply).await;
        Ok(())
    }

    async fn handle_leave(&self, conn: &mut ConnectionContext) -> Result<(), CoreError> {
        let (room_id, participant, _user) = conn
            .identity
            .take()
            .ok_or_else(|| CoreError::Validation("not joined to any room".to_string()))?;

        self.reconnect.cancel(&participant);
        self.finalize_departure(&room_id, &participant).await;
        conn.send(SignalFrame {
            kind: FrameType::LeaveRoom,
            room_id: Some(room_id),
            data: None,
        })
        .await;
        Ok(())
    }

    async fn handle_publish(
        &self,
        conn: &mut ConnectionContext,
        data: PublishTrackData,
    ) -> Result<(), CoreError> {
        let (room_id, participant, user) = identity(conn)?;
        let graph = self.graph_by_id(&room_id)?;

        self.sessions.add_track(&user).await?;
        let label = data.label.unwrap_or_else(|| match data.kind {
            TrackKind::Audio => "microphone".to_string(),
            TrackKind::Video => "camera".to_string(),
        });
        let result = graph
            .publish_track(
                &participant,
                data.track_id,
                data.kind,
                label,
                data.simulcast.unwrap_or(false),
            )
            .await;
        if result.is_err() {
            let _ = self.sessions.remove_track(&user).await;
        }
        result.map(|_| ())
    }

    async fn handle_unpublish(
        &self,
        conn: &mut ConnectionContext,
        data: UnpublishTrackData,
    ) -> Result<(), CoreError> {
        let (room_id, participant, user) = identity(conn)?;
        let graph = self.graph_by_id(&room_id)?;
        graph.unpublish_track(&participant, &data.track_id).await?;
        let _ = self.sessions.remove_track(&user).await;
        Ok(())
    }

    async fn handle_subscribe(
        &self,
        conn: &mut ConnectionContext,
        data: SubscribeTrackData,
    ) -> Result<(), CoreError> {
        let (room_id, participant, user) = identity(conn)?;
        let graph = self.graph_by_id(&room_id)?;
        let available = self.quality.available_bps(&participant);
        graph
            .subscribe(
                participant.clone(),
                data.participant_id,
                data.track_id.clone(),
                data.quality.unwrap_or(TrackQuality::Auto),
                available,
            )
            .await?;
        self.sessions
            .record_subscription(&user, &room_id, &data.track_id)
            .await?;
        Ok(())
    }

    async fn handle_unsubscribe(
        &self,
        conn: &mut ConnectionContext,
        data: UnsubscribeTrackData,
    ) -> Result<(), CoreError> {
        let (room_id, participant, user) = identity(conn)?;
        let graph = self.graph_by_id(&room_id)?;
        graph.unsubscribe(&participant, &data.track_id).await?;
        let _ = self
            .sessions
            .drop_subscription(&user, &room_id, &data.track_id)
            .await;
        Ok(())
    }

    async fn handle_update_metadata(
        &self,
        conn: &mut ConnectionContext,
        data: UpdateMetadataData,
    ) -> Result<(), CoreError> {
        let (room_id, _participant, user) = identity(conn)?;
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))?;
        let merged = room.update_metadata(data.metadata).await?;

        // The priority tag is tracked in the session ledger.
        if let Some(priority) = merged.get("priority").and_then(|v| v.as_u64()) {
            let _ = self
                .sessions
                .set_room_priority(&user, &room_id, priority as u32)
                .await;
        }
        Ok(())
    }

    async fn handle_send_data(
        &self,
        conn: &mut ConnectionContext,
        data: SendDataData,
    ) -> Result<(), CoreError> {
        let (room_id, participant, _user) = identity(conn)?;
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))?;
        let grants = room
            .grants_of(&participant)
            .await
            .ok_or_else(|| CoreError::ParticipantNotFound(participant.clone()))?;
        if !grants.can_publish_data {
            return Err(CoreError::Unauthorized(format!(
                "participant {} lacks the data grant",
                participant
            )));
        }

        let frame = SignalFrame::with_data(
            FrameType::SendData,
            Some(room_id.clone()),
            &SendDataData {
                topic: data.topic,
                payload: data.payload,
                to: Vec::new(),
            },
        )?;

        if data.to.is_empty() {
            for entry in self.connections.iter() {
                let (conn_room, conn_participant) = entry.key();
                if conn_room == &room_id && conn_participant != &participant {
                    let _ = entry.value().try_send(frame.clone());
                }
            }
        } else {
            for recipient in &data.to {
                if let Some(sender) = self.connections.get(&(room_id.clone(), recipient.clone())) {
                    let _ = sender.try_send(frame.clone());
                }
            }
        }
        Ok(())
    }

    /// Transport-declared disconnect: membership survives while the
    /// provided capability retries; giving up finalizes the departure.
    pub async fn on_transport_disconnect(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
        attempt: Arc<dyn ReconnectAttempt>,
    ) -> Result<(), CoreError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))?;
        room.mark_reconnecting(participant).await?;
        self.reconnect
            .start(room_id.clone(), participant.clone(), attempt)
    }

    /// Periodic transport statistics for one participant. Feeds the
    /// quality monitor and re-tunes `Auto` subscriptions.
    pub async fn ingest_stats(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
        stats: TransportStats,
    ) {
        let sample = self.quality.record(participant, stats);
        if let Ok(graph) = self.graph_by_id(room_id) {
            graph.apply_bandwidth(participant, sample.available_bps).await;
        }
    }

    /// Full teardown for one participant: media handles, membership,
    /// session ledger, quality history and connection registry.
    async fn finalize_departure(&self, room_id: &RoomId, participant: &ParticipantId) {
        let user = UserId::from(participant.as_ref());
        if let Ok(graph) = self.graph_by_id(room_id) {
            graph.on_participant_left(participant).await;
        }
        if let Some(room) = self.rooms.get(room_id) {
            match room.remove_participant(participant).await {
                Ok(_) => {}
                Err(CoreError::ParticipantNotFound(_)) => {}
                Err(err) => {
                    warn!(room = %room_id, participant = %participant, error = %err, "departure bookkeeping failed")
                }
            }
        }
        let _ = self.sessions.leave_room(&user, room_id).await;
        self.quality.forget(participant);
        self.connections
            .remove(&(room_id.clone(), participant.clone()));
        debug!(room = %room_id, participant = %participant, "departure finalized");
    }

    /// Cancels reconnections and shuts down rooms, graphs and
    /// connections.
    pub async fn shutdown(&self) {
        self.reconnect.shutdown();
        let graph_ids: Vec<RoomId> = self.graphs.iter().map(|e| e.key().clone()).collect();
        for id in graph_ids {
            if let Some((_, graph)) = self.graphs.remove(&id) {
                graph.shutdown().await;
            }
        }
        self.rooms.shutdown().await;
        self.connections.clear();
    }

    fn graph_for(&self, room: &Arc<Room>) -> Arc<RoomSfu> {
        self.graphs
            .entry(room.id().clone())
            .or_insert_with(|| {
                Arc::new(RoomSfu::new(
                    room.clone(),
                    self.sfu.clone(),
                    self.config.simulcast.clone(),
                    self.config.auto_subscribe,
                ))
            })
            .value()
            .clone()
    }

    fn graph_by_id(&self, room_id: &RoomId) -> Result<Arc<RoomSfu>, CoreError> {
        self.graphs
            .get(room_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))
    }

    async fn send_error(&self, conn: &ConnectionContext, err: &CoreError) {
        warn!(error = %err, kind = ?err.kind(), "signaling error");
        if let Ok(frame) = SignalFrame::with_data(
            FrameType::Error,
            None,
            &ErrorData {
                error: err.to_string(),
            },
        ) {
            conn.send(frame).await;
        }
    }
}

fn identity(conn: &ConnectionContext) -> Result<(RoomId, ParticipantId, UserId), CoreError> {
    conn.identity
        .clone()
        .ok_or_else(|| CoreError::Validation("not joined to any room".to_string()))
}

async fn room_priority(room: &Arc<Room>) -> u32 {
    room.metadata()
        .await
        .get("priority")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32
}

/// Broadcasts a committed room event to every connection in the room.
/// Facts about hidden participants stay off the wire, and a participant
/// is not told about its own membership changes (it already got the
/// direct reply).
fn fan_out_event(
    connections: &DashMap<(RoomId, ParticipantId), FrameSender>,
    event: &RoomEvent,
) {
    let subject = match &event.payload {
        EventPayload::ParticipantJoined { participant }
        | EventPayload::ParticipantLeft { participant }
        | EventPayload::ParticipantUpdated { participant } => {
            if participant.hidden {
                return;
            }
            Some(participant.id.clone())
        }
        _ => None,
    };

    let data = match serde_json::to_value(&event.payload) {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "room event not encodable");
            return;
        }
    };
    let frame = match SignalFrame::with_data(
        FrameType::RoomEvent,
        Some(event.room_id.clone()),
        &RoomEventData {
            event_type: event.kind(),
            data,
            timestamp: event.timestamp,
        },
    ) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    for entry in connections.iter() {
        let (conn_room, conn_participant) = entry.key();
        if conn_room != &event.room_id {
            continue;
        }
        if subject.as_ref() == Some(conn_participant) {
            continue;
        }
        // try_send: a slow consumer loses events instead of stalling the
        // fan-out task.
        let _ = entry.value().try_send(frame.clone());
    }
}
