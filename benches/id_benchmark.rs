use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashmap::DashMap;
use roomcast::id_types::{ParticipantId, RoomId, TrackId};

// Subscription edges are keyed (subscriber, publisher, track); the key is
// cloned once per edge on every publish fan-out and teardown.
fn bench_edge_key_clone(c: &mut Criterion) {
    let key = (
        ParticipantId::from("subscriber-7f3d9a12"),
        ParticipantId::from("publisher-0b44c1de"),
        TrackId::from("camera-main-1080p"),
    );
    c.bench_function("edge_key_clone", |b| {
        b.iter(|| {
            let _ = black_box(key.clone());
        })
    });
}

// Event fan-out resolves a (room, participant) sender per frame; model a
// mid-sized room's connection registry.
fn bench_connection_registry_lookup(c: &mut Criterion) {
    let registry: DashMap<(RoomId, ParticipantId), u32> = DashMap::new();
    let room = RoomId::from("all-hands-main");
    for seat in 0..200u32 {
        registry.insert(
            (room.clone(), ParticipantId::from(format!("seat-{seat}"))),
            seat,
        );
    }
    let key = (room, ParticipantId::from("seat-137"));

    c.bench_function("connection_registry_lookup", |b| {
        b.iter(|| {
            let _ = black_box(registry.get(&key).map(|entry| *entry.value()));
        })
    });
}

// Ids cross the signaling boundary as JSON strings in every frame.
fn bench_id_wire_round_trip(c: &mut Criterion) {
    let id = TrackId::from("camera-main-1080p");
    c.bench_function("id_wire_round_trip", |b| {
        b.iter(|| {
            let json = serde_json::to_string(&id).unwrap();
            let back: TrackId = serde_json::from_str(&json).unwrap();
            black_box(back)
        })
    });
}

// Room creation mints a fresh uuid-backed id.
fn bench_room_id_generate(c: &mut Criterion) {
    c.bench_function("room_id_generate", |b| {
        b.iter(|| black_box(RoomId::generate()))
    });
}

criterion_group!(
    benches,
    bench_edge_key_clone,
    bench_connection_registry_lookup,
    bench_id_wire_round_trip,
    bench_room_id_generate
);
criterion_main!(benches);
