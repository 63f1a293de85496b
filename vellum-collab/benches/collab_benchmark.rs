use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use vellum_collab::presence::PresenceRoster;
use vellum_collab::protocol::{ClientMessage, ServerEvent};
use vellum_collab::room::{Room, RoomMember};
use vellum_collab::storage::{NoteStore, StoreConfig};
use vellum_core::{BlockType, UserIdentity};

fn bench_event_encode(c: &mut Criterion) {
    let user = UserIdentity::new("bench");
    let event = ServerEvent::block_updated(
        Uuid::new_v4(),
        json!({"text": "The quick brown fox jumps over the lazy dog"}),
        &user,
    );

    c.bench_function("event_encode_block_updated", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let user = UserIdentity::new("bench");
    let event = ServerEvent::block_updated(
        Uuid::new_v4(),
        json!({"text": "The quick brown fox jumps over the lazy dog"}),
        &user,
    );
    let encoded = event.encode().unwrap();

    c.bench_function("event_decode_block_updated", |b| {
        b.iter(|| {
            black_box(ServerEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_client_frame_decode(c: &mut Criterion) {
    let frame = format!(
        r#"{{"type":"block_update","block_id":"{}","content":{{"text":"typing"}}}}"#,
        Uuid::new_v4()
    );

    c.bench_function("client_frame_decode", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let user = UserIdentity::new("sender");
    let event = ServerEvent::cursor_moved(Uuid::new_v4(), 42, &user);

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(Uuid::new_v4(), 128);

                // Seat 100 members
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (tx, rx) = mpsc::channel(1024);
                    room.add_member(RoomMember::new(
                        Uuid::new_v4(),
                        UserIdentity::new(format!("member{i}")),
                        tx,
                    ))
                    .await;
                    receivers.push(rx);
                }

                // Fan out 1 event
                let delivered = room.broadcast(black_box(&event), None).await;
                black_box(delivered);
            });
        })
    });
}

fn bench_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_frames_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(Uuid::new_v4(), 128);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (tx, rx) = mpsc::channel(2048);
                    room.add_member(RoomMember::new(
                        Uuid::new_v4(),
                        UserIdentity::new(format!("member{i}")),
                        tx,
                    ))
                    .await;
                    receivers.push(rx);
                }

                let frame = Arc::new(String::from(
                    r#"{"type":"cursor_moved","block_id":"0","position":1}"#,
                ));
                for _ in 0..1000 {
                    room.broadcast_frame(black_box(Arc::clone(&frame)), None).await;
                }
            });
        })
    });
}

fn bench_roster_handle_cursor(c: &mut Criterion) {
    let remote = UserIdentity::new("remote");

    c.bench_function("roster_handle_cursor", |b| {
        b.iter_custom(|iters| {
            let mut roster = PresenceRoster::new(Uuid::new_v4());
            roster.handle_event(&ServerEvent::user_joined(&remote));

            let start = std::time::Instant::now();
            for i in 0..iters {
                let event = ServerEvent::cursor_moved(Uuid::new_v4(), i, &remote);
                roster.handle_event(&event);
            }
            start.elapsed()
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_store_update_block(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("vellum_bench_update_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    };
    let store = NoteStore::open(config).unwrap();
    let author = Uuid::new_v4();
    let note = store.create_note(author, "Bench note").unwrap();
    let block = store
        .create_block(note.id, BlockType::Text, json!({"text": "0"}), 0, author)
        .unwrap();

    c.bench_function("store_update_block_content", |b| {
        // Distinct content per iteration so each update appends a version
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let (updated, _) = store
                .update_block_content(
                    black_box(note.id),
                    black_box(block.id),
                    json!({"text": i.to_string()}),
                    author,
                )
                .unwrap();
            black_box(updated);
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_list_blocks(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("vellum_bench_list_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    };
    let store = NoteStore::open(config).unwrap();
    let author = Uuid::new_v4();
    let note = store.create_note(author, "Wide note").unwrap();

    // Pre-populate with 100 blocks
    for i in 0..100u32 {
        store
            .create_block(
                note.id,
                BlockType::Text,
                json!({"text": format!("block {i}")}),
                i,
                author,
            )
            .unwrap();
    }

    c.bench_function("store_list_blocks_100", |b| {
        b.iter(|| {
            black_box(store.list_blocks(black_box(note.id)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_latest_version(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("vellum_bench_latest_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    };
    let store = NoteStore::open(config).unwrap();
    let author = Uuid::new_v4();
    let note = store.create_note(author, "Versioned").unwrap();
    let block = store
        .create_block(note.id, BlockType::Text, json!({"text": "0"}), 0, author)
        .unwrap();
    for i in 1..1000u64 {
        store
            .update_block_content(note.id, block.id, json!({"text": i.to_string()}), author)
            .unwrap();
    }

    c.bench_function("store_latest_version_of_1000", |b| {
        b.iter(|| {
            black_box(store.latest_version_number(black_box(block.id)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_client_frame_decode,
    bench_broadcast_100_members,
    bench_broadcast_1000_frames,
    bench_roster_handle_cursor,
    bench_store_update_block,
    bench_store_list_blocks,
    bench_store_latest_version,
);
criterion_main!(benches);
