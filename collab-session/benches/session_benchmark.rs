use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use collab_session::awareness::{AwarenessTracker, AwarenessUpdate, AwarenessUpdateEntry};
use collab_session::broadcast::{BroadcastGroup, ConnectionHandle};
use collab_session::persistence::PersistenceStats;
use collab_session::protocol::{Frame, SyncMessage};
use collab_session::session::Session;
use collab_session::storage::MemoryStore;
use collab_session::validation::validate;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use uuid::Uuid;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Text, Transact, WriteTxn};

fn small_update() -> Vec<u8> {
    let doc = Doc::new();
    let mut txn = doc.transact_mut();
    txn.get_or_insert_text("content").push(&mut txn, "typing a few characters");
    txn.encode_update_v1()
}

fn bench_validate(c: &mut Criterion) {
    let payload = json!({
        "objectId": "shape-42",
        "type": "resize",
        "properties": {"width": 320, "height": 200, "rotation": 15, "fill": "#336699"}
    });

    c.bench_function("validate_property_update", |b| {
        b.iter(|| black_box(validate(black_box(&payload)).is_ok()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = Frame::Sync(SyncMessage::Update(small_update())).encode();

    c.bench_function("frame_decode_update", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let update = AwarenessUpdate {
        entries: (0..50)
            .map(|client_id| AwarenessUpdateEntry {
                client_id,
                clock: 1,
                state: Some(format!(r#"{{"cursor":[{client_id},0]}}"#)),
            })
            .collect(),
    };

    c.bench_function("awareness_apply_50_clients", |b| {
        b.iter(|| {
            let mut tracker = AwarenessTracker::new();
            black_box(tracker.apply(black_box(&update), origin));
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let group = BroadcastGroup::new();
    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..100 {
        let (handle, rx) = ConnectionHandle::channel(1024);
        group.add_member(&handle);
        handles.push(handle);
        receivers.push(rx);
    }
    let frame = Arc::new(vec![0u8; 64]);
    let origin = handles[0].id();

    c.bench_function("broadcast_64B_to_100_members", |b| {
        b.iter(|| {
            black_box(group.send(frame.clone(), Some(origin)));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_session_apply(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let (session, _) = Session::open(
        "bench",
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(PersistenceStats::default()),
        None,
    );
    let (alice, _rx) = ConnectionHandle::channel(16);
    session.join(&alice);

    c.bench_function("session_apply_update", |b| {
        b.iter(|| {
            let update = small_update();
            black_box(session.apply_sync(alice.id(), SyncMessage::Update(update)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_validate,
    bench_frame_decode,
    bench_awareness_apply,
    bench_broadcast_fanout,
    bench_session_apply,
);
criterion_main!(benches);
