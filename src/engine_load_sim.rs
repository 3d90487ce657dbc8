use anyhow::Result;
use bytes::Bytes;
use roomcast::config::EngineConfig;
use roomcast::sfu::NullSfu;
use roomcast::signaling::{
    FrameType, JoinRoomData, PublishTrackData, SendDataData, SignalFrame, SignalingHandler,
};
use roomcast::token::{AccessToken, VideoGrant};
use roomcast::track::TrackKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

const ROOMS: usize = 20;
const PARTICIPANTS_PER_ROOM: usize = 25;
const SECRET: &str = "load-sim-secret";

fn main() -> Result<()> {
    // We use a custom runtime to ensure we control the threads
    let rt = Runtime::new()?;
    rt.block_on(async {
        println!("🔥 Starting Conferencing Core Load Simulator...");
        println!("   - {} rooms x {} participants", ROOMS, PARTICIPANTS_PER_ROOM);

        let mut config = EngineConfig::new(SECRET);
        config.empty_room_timeout = Duration::ZERO;
        config.session.max_rooms_per_user = ROOMS;
        roomcast::logging::init(&config.rust_log);
        let handler = SignalingHandler::new(config, Arc::new(NullSfu));

        println!("   - Joining participants and publishing tracks...");
        let join_start = Instant::now();
        let mut connections = Vec::new();
        for room in 0..ROOMS {
            let room_name = format!("load-room-{room}");
            for seat in 0..PARTICIPANTS_PER_ROOM {
                let identity = format!("r{room}-p{seat}");
                let token = AccessToken::new(identity.clone())
                    .room(room_name.clone())
                    .grant(VideoGrant {
                        room: room_name.clone(),
                        room_join: true,
                        can_publish: true,
                        can_subscribe: true,
                        can_publish_data: true,
                        ..VideoGrant::default()
                    })
                    .sign(SECRET)
                    .expect("token signing");

                let (mut conn, rx) = handler.open_connection();
                let join = SignalFrame::with_data(
                    FrameType::JoinRoom,
                    None,
                    &JoinRoomData {
                        room_id: room_name.clone(),
                        user_id: identity.clone(),
                        token,
                    },
                )
                .expect("join frame");
                handler.handle_frame(&mut conn, join).await;

                // First participant in each room turns a camera on.
                if seat == 0 {
                    let publish = SignalFrame::with_data(
                        FrameType::PublishTrack,
                        None,
                        &PublishTrackData {
                            track_id: roomcast::TrackId::from(format!("cam-{room}")),
                            kind: TrackKind::Video,
                            label: Some("camera".to_string()),
                            simulcast: Some(true),
                        },
                    )
                    .expect("publish frame");
                    handler.handle_frame(&mut conn, publish).await;
                }
                connections.push((conn, rx));
            }
        }
        println!(
            "   - {} participants joined in {:.2?}",
            connections.len(),
            join_start.elapsed()
        );
        println!("   - Starting data broadcast loop (15 seconds)...");

        let payload = Bytes::from(vec![0u8; 512]);
        let start = Instant::now();
        let mut count: u64 = 0;
        let mut loop_start = Instant::now();
        let senders = ROOMS * PARTICIPANTS_PER_ROOM;

        while start.elapsed() < Duration::from_secs(15) {
            let index = (count as usize) % senders;
            let (conn, _) = &mut connections[index];
            let frame = SignalFrame::with_data(
                FrameType::SendData,
                None,
                &SendDataData {
                    topic: "load".to_string(),
                    payload: payload.clone(),
                    to: Vec::new(),
                },
            )
            .expect("data frame");
            handler.handle_frame(conn, frame).await;
            count += 1;

            if count % 1000 == 0 {
                let elapsed = loop_start.elapsed().as_secs_f64();
                if elapsed > 1.0 {
                    let fan_out = (PARTICIPANTS_PER_ROOM - 1) as f64;
                    println!(
                        "   ⚡ Status: {:.0} broadcasts/sec ({:.1} Mbps effective fan-out)",
                        count as f64 / elapsed,
                        (count as f64 * 512.0 * 8.0 * fan_out) / elapsed / 1_000_000.0
                    );
                    count = 0;
                    loop_start = Instant::now();
                }
            }
        }

        println!("   - Shutting down...");
        handler.shutdown().await;
        println!("✅ Simulation Complete.");
    });
    Ok(())
}
