//! Cross-module flows exercised through the signaling front door.

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::id_types::{ParticipantId, RoomId, TrackId};
use crate::participant::ParticipantState;
use crate::quality::TransportStats;
use crate::reconnect::ReconnectAttempt;
use crate::sfu::{MediaSfu, NullSfu, Publisher, Subscriber};
use crate::signaling::{
    FrameType, JoinRoomData, JoinedData, PublishTrackData, SignalFrame, SignalingHandler,
    SubscribeTrackData,
};
use crate::subscription::{LayerQuality, SimulcastConfig, SimulcastLayer, TrackQuality};
use crate::token::{AccessToken, VideoGrant};
use crate::track::TrackKind;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Records every subscriber edge the engine asks for.
#[derive(Default)]
struct RecordingSfu {
    subscribers: Mutex<Vec<(String, String, String, LayerQuality)>>,
}

struct InertHandle;

#[async_trait]
impl Publisher for InertHandle {
    async fn stop(&self) {}
}

#[async_trait]
impl Subscriber for InertHandle {
    async fn stop(&self) {}
    async fn switch_layer(&self, _quality: LayerQuality) {}
}

#[async_trait]
impl MediaSfu for RecordingSfu {
    async fn create_publisher(
        &self,
        _participant: &ParticipantId,
    ) -> Result<Box<dyn Publisher>, CoreError> {
        Ok(Box::new(InertHandle))
    }

    async fn create_subscriber(
        &self,
        subscriber: &ParticipantId,
        publisher: &ParticipantId,
        track: &TrackId,
        quality: LayerQuality,
    ) -> Result<Box<dyn Subscriber>, CoreError> {
        self.subscribers.lock().unwrap().push((
            subscriber.to_string(),
            publisher.to_string(),
            track.to_string(),
            quality,
        ));
        Ok(Box::new(InertHandle))
    }
}

fn token(identity: &str, room: &str, can_publish: bool) -> String {
    AccessToken::new(identity)
        .room(room)
        .grant(VideoGrant {
            room: room.to_string(),
            room_join: true,
            can_publish,
            can_subscribe: true,
            can_publish_data: true,
            ..VideoGrant::default()
        })
        .sign("k")
        .unwrap()
}

fn join_frame(identity: &str, room: &str, can_publish: bool) -> SignalFrame {
    SignalFrame::with_data(
        FrameType::JoinRoom,
        None,
        &JoinRoomData {
            room_id: room.to_string(),
            user_id: identity.to_string(),
            token: token(identity, room, can_publish),
        },
    )
    .unwrap()
}

fn publish_frame(track: &str, kind: TrackKind) -> SignalFrame {
    SignalFrame::with_data(
        FrameType::PublishTrack,
        None,
        &PublishTrackData {
            track_id: TrackId::from(track),
            kind,
            label: None,
            simulcast: None,
        },
    )
    .unwrap()
}

fn engine_with(sfu: Arc<dyn MediaSfu>) -> Arc<SignalingHandler> {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    SignalingHandler::new(config, sfu)
}

#[tokio::test]
async fn test_auth_then_join_full_flow() {
    let handler = engine_with(Arc::new(NullSfu));

    let (mut conn, mut rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", true)).await;

    let reply = rx.next().await.unwrap();
    assert_eq!(reply.kind, FrameType::JoinRoom);
    let joined: JoinedData = serde_json::from_value(reply.data.unwrap()).unwrap();
    assert_eq!(joined.participant_id, ParticipantId::from("u1"));

    let room = handler.rooms().get_by_name("r").expect("room created");
    let info = room.participant(&ParticipantId::from("u1")).await.unwrap();
    assert_eq!(info.state, ParticipantState::Joined);
    assert_eq!(info.name, "u1");
    let grants = room.grants_of(&ParticipantId::from("u1")).await.unwrap();
    assert!(grants.can_publish);
    assert!(grants.can_subscribe);
}

#[tokio::test]
async fn test_cross_room_token_mismatch_leaves_no_state() {
    let handler = engine_with(Arc::new(NullSfu));
    let (mut conn, mut rx) = handler.open_connection();

    let frame = SignalFrame::with_data(
        FrameType::JoinRoom,
        None,
        &JoinRoomData {
            room_id: "r2".to_string(),
            user_id: "u1".to_string(),
            token: token("u1", "r1", true),
        },
    )
    .unwrap();
    handler.handle_frame(&mut conn, frame).await;

    assert_eq!(rx.next().await.unwrap().kind, FrameType::Error);
    assert_eq!(handler.rooms().count(), 0);
    assert_eq!(handler.sessions().session_count(), 0);
}

#[tokio::test]
async fn test_auto_subscribe_on_join_targets_existing_tracks() {
    let sfu = Arc::new(RecordingSfu::default());
    let handler = engine_with(sfu.clone());

    // A publishes t1, B is present, then C joins.
    let (mut conn_a, _rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("A", "r", true)).await;
    handler
        .handle_frame(&mut conn_a, publish_frame("t1", TrackKind::Video))
        .await;

    let (mut conn_b, _rx_b) = handler.open_connection();
    handler.handle_frame(&mut conn_b, join_frame("B", "r", false)).await;

    let (mut conn_c, _rx_c) = handler.open_connection();
    handler.handle_frame(&mut conn_c, join_frame("C", "r", false)).await;

    let edges = sfu.subscribers.lock().unwrap().clone();
    let c_edges: Vec<_> = edges.iter().filter(|(s, _, _, _)| s == "C").collect();
    assert_eq!(c_edges.len(), 1, "exactly one edge for C: {edges:?}");
    assert_eq!(
        c_edges[0],
        &(
            "C".to_string(),
            "A".to_string(),
            "t1".to_string(),
            LayerQuality::High
        )
    );
    assert!(edges.iter().all(|(s, p, _, _)| s != p), "no self-subscription");
}

#[tokio::test]
async fn test_simulcast_selection_through_engine_config() {
    let layers = SimulcastConfig::new(vec![
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
        SimulcastLayer {
            quality: LayerQuality::Low,
            max_width: 320,
            max_height: 180,
            max_bitrate: 500_000,
            max_framerate: 15,
        },
    ]);
    let pick = |bps| layers.select_layer(TrackQuality::Auto, Some(bps)).quality;
    assert_eq!(pick(1_000_000), LayerQuality::Low);
    assert_eq!(pick(1_500_000), LayerQuality::Medium);
    assert_eq!(pick(400_000), LayerQuality::Low);
    assert_eq!(pick(10_000_000), LayerQuality::High);
}

#[tokio::test]
async fn test_bandwidth_sample_retunes_auto_subscription() {
    let sfu = Arc::new(RecordingSfu::default());
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    let handler = SignalingHandler::new(config, sfu);

    let (mut conn_a, _rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("A", "r", true)).await;
    handler
        .handle_frame(&mut conn_a, publish_frame("t1", TrackKind::Video))
        .await;

    let (mut conn_b, _rx_b) = handler.open_connection();
    handler.handle_frame(&mut conn_b, join_frame("B", "r", false)).await;

    let room_id = handler.rooms().get_by_name("r").unwrap().id().clone();
    let b = ParticipantId::from("B");
    handler
        .ingest_stats(
            &room_id,
            &b,
            TransportStats {
                packet_loss: 0.5,
                jitter_ms: 10.0,
                rtt_ms: 40.0,
                available_bps: 300_000,
                score: None,
            },
        )
        .await;

    assert_eq!(handler.quality().available_bps(&b), Some(300_000));
}

#[tokio::test]
async fn test_empty_room_reaped_after_timeout() {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::from_millis(100);
    let handler = SignalingHandler::new(config, Arc::new(NullSfu));

    let (mut conn, _rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", true)).await;
    handler
        .handle_frame(&mut conn, SignalFrame::new(FrameType::LeaveRoom))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    handler.rooms().cleanup_empty_rooms().await;
    assert!(handler.rooms().get_by_name("r").is_none());
}

struct AlwaysFails;

#[async_trait]
impl ReconnectAttempt for AlwaysFails {
    async fn attempt(
        &self,
        _room: &RoomId,
        _participant: &ParticipantId,
    ) -> Result<(), CoreError> {
        Err(CoreError::ConnectionFailed("still unreachable".to_string()))
    }
}

struct SucceedsImmediately;

#[async_trait]
impl ReconnectAttempt for SucceedsImmediately {
    async fn attempt(
        &self,
        _room: &RoomId,
        _participant: &ParticipantId,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_disconnect_then_give_up_removes_participant() {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    config.reconnection.max_attempts = 2;
    config.reconnection.initial_delay = Duration::from_millis(10);
    config.reconnection.max_delay = Duration::from_millis(20);
    let handler = SignalingHandler::new(config, Arc::new(NullSfu));

    let (mut conn, _rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", true)).await;
    let room = handler.rooms().get_by_name("r").unwrap();
    let p = ParticipantId::from("u1");

    handler
        .on_transport_disconnect(&room.id().clone(), &p, Arc::new(AlwaysFails))
        .await
        .unwrap();
    assert_eq!(
        room.participant(&p).await.unwrap().state,
        ParticipantState::Reconnecting
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(room.participant(&p).await.is_none(), "departure finalized");
    assert!(handler
        .sessions()
        .session(&crate::id_types::UserId::from("u1"))
        .await
        .map(|s| s.active_rooms.is_empty())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_disconnect_then_recovery_restores_joined() {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    config.reconnection.initial_delay = Duration::from_millis(10);
    let handler = SignalingHandler::new(config, Arc::new(NullSfu));

    let (mut conn, _rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", true)).await;
    let room = handler.rooms().get_by_name("r").unwrap();
    let p = ParticipantId::from("u1");

    handler
        .on_transport_disconnect(&room.id().clone(), &p, Arc::new(SucceedsImmediately))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        room.participant(&p).await.unwrap().state,
        ParticipantState::Joined
    );
}

#[tokio::test]
async fn test_room_limit_rejects_second_join() {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    config.session.max_rooms_per_user = 1;
    let handler = SignalingHandler::new(config, Arc::new(NullSfu));

    let (mut conn_a, mut rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("u1", "r1", true)).await;
    assert_eq!(rx_a.next().await.unwrap().kind, FrameType::JoinRoom);

    let (mut conn_b, mut rx_b) = handler.open_connection();
    handler.handle_frame(&mut conn_b, join_frame("u1", "r2", true)).await;
    let reply = rx_b.next().await.unwrap();
    assert_eq!(reply.kind, FrameType::Error);
    let error: crate::signaling::ErrorData =
        serde_json::from_value(reply.data.unwrap()).unwrap();
    assert!(error.error.contains("room limit"), "{}", error.error);

    // The rejected join left no membership behind.
    let r2 = handler.rooms().get_by_name("r2").unwrap();
    assert!(r2.is_empty().await);
}

#[tokio::test]
async fn test_track_limit_enforced_through_publish() {
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    config.session.max_tracks_per_user = 1;
    let handler = SignalingHandler::new(config, Arc::new(NullSfu));

    let (mut conn, mut rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", true)).await;
    assert_eq!(rx.next().await.unwrap().kind, FrameType::JoinRoom);

    handler
        .handle_frame(&mut conn, publish_frame("t1", TrackKind::Video))
        .await;
    handler
        .handle_frame(&mut conn, publish_frame("t2", TrackKind::Audio))
        .await;

    let error = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let frame = rx.next().await.unwrap();
            if frame.kind == FrameType::Error {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    let data: crate::signaling::ErrorData =
        serde_json::from_value(error.data.unwrap()).unwrap();
    assert!(data.error.contains("track limit"), "{}", data.error);
}

#[tokio::test]
async fn test_publisher_without_grant_rejected() {
    let handler = engine_with(Arc::new(NullSfu));
    let (mut conn, mut rx) = handler.open_connection();
    handler.handle_frame(&mut conn, join_frame("u1", "r", false)).await;
    assert_eq!(rx.next().await.unwrap().kind, FrameType::JoinRoom);

    handler
        .handle_frame(&mut conn, publish_frame("t1", TrackKind::Video))
        .await;
    let error = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let frame = rx.next().await.unwrap();
            if frame.kind == FrameType::Error {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    let data: crate::signaling::ErrorData =
        serde_json::from_value(error.data.unwrap()).unwrap();
    assert!(data.error.contains("unauthorized"), "{}", data.error);
}

#[tokio::test]
async fn test_explicit_subscribe_and_idempotent_unsubscribe() {
    let sfu = Arc::new(RecordingSfu::default());
    let mut config = EngineConfig::new("k");
    config.empty_room_timeout = Duration::ZERO;
    config.auto_subscribe = false;
    let handler = SignalingHandler::new(config, sfu.clone());

    let (mut conn_a, _rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("A", "r", true)).await;
    handler
        .handle_frame(&mut conn_a, publish_frame("t1", TrackKind::Video))
        .await;

    let (mut conn_b, _rx_b) = handler.open_connection();
    handler.handle_frame(&mut conn_b, join_frame("B", "r", false)).await;

    // Auto-subscription disabled: nothing yet.
    assert!(sfu.subscribers.lock().unwrap().is_empty());

    let subscribe = SignalFrame::with_data(
        FrameType::SubscribeTrack,
        None,
        &SubscribeTrackData {
            participant_id: ParticipantId::from("A"),
            track_id: TrackId::from("t1"),
            quality: Some(TrackQuality::Medium),
        },
    )
    .unwrap();
    handler.handle_frame(&mut conn_b, subscribe).await;
    assert_eq!(sfu.subscribers.lock().unwrap().len(), 1);

    let unsubscribe = SignalFrame::with_data(
        FrameType::UnsubscribeTrack,
        None,
        &crate::signaling::UnsubscribeTrackData {
            participant_id: ParticipantId::from("A"),
            track_id: TrackId::from("t1"),
        },
    )
    .unwrap();
    handler.handle_frame(&mut conn_b, unsubscribe.clone()).await;
    // Second unsubscribe is a silent no-op.
    handler.handle_frame(&mut conn_b, unsubscribe).await;
}

#[tokio::test]
async fn test_hidden_participant_join_not_broadcast() {
    let handler = engine_with(Arc::new(NullSfu));

    let (mut conn_a, mut rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("A", "r", true)).await;
    assert_eq!(rx_a.next().await.unwrap().kind, FrameType::JoinRoom);

    let hidden_token = AccessToken::new("ghost")
        .room("r")
        .grant(VideoGrant {
            room: "r".to_string(),
            room_join: true,
            can_subscribe: true,
            hidden: true,
            ..VideoGrant::default()
        })
        .sign("k")
        .unwrap();
    let (mut conn_b, _rx_b) = handler.open_connection();
    let frame = SignalFrame::with_data(
        FrameType::JoinRoom,
        None,
        &JoinRoomData {
            room_id: "r".to_string(),
            user_id: "ghost".to_string(),
            token: hidden_token,
        },
    )
    .unwrap();
    handler.handle_frame(&mut conn_b, frame).await;

    // A never observes the hidden join.
    let result = tokio::time::timeout(Duration::from_millis(150), rx_a.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

#[tokio::test]
async fn test_concurrent_joins_land_in_one_room() {
    let handler = engine_with(Arc::new(NullSfu));
    let mut tasks = Vec::new();
    for i in 0..10 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            let (mut conn, mut rx) = handler.open_connection();
            handler
                .handle_frame(&mut conn, join_frame(&format!("user-{i}"), "shared", true))
                .await;
            let reply = rx.next().await.unwrap();
            (reply.kind, conn)
        }));
    }
    let successes = Arc::new(AtomicUsize::new(0));
    let mut conns = Vec::new();
    for task in tasks {
        let (kind, conn) = task.await.unwrap();
        if kind == FrameType::JoinRoom {
            successes.fetch_add(1, Ordering::SeqCst);
        }
        conns.push(conn);
    }
    assert_eq!(successes.load(Ordering::SeqCst), 10);

    let room = handler.rooms().get_by_name("shared").unwrap();
    assert_eq!(room.participant_count().await, 10);
    assert_eq!(handler.rooms().count(), 1);
}

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let handler = engine_with(Arc::new(NullSfu));
    let (mut conn_a, _rx_a) = handler.open_connection();
    handler.handle_frame(&mut conn_a, join_frame("A", "r1", true)).await;
    let (mut conn_b, _rx_b) = handler.open_connection();
    handler.handle_frame(&mut conn_b, join_frame("B", "r2", true)).await;

    handler.shutdown().await;
    assert_eq!(handler.rooms().count(), 0);
}
