use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use deck_collab::protocol::attach_sender;
use deck_collab::{BroadcastGroup, Envelope, PeerInfo, PresenceTracker, RemoteReconciler, Sender};
use deck_core::{
    CanvasSettings, DocumentStore, Element, ElementChanges, ElementId, ElementKind, Frame, FrameId,
    ParticipantId, Permission, Position, Presentation, PresentationId, PresentationInfo,
};
use std::hint::black_box;
use uuid::Uuid;

fn build_store(elements: i64) -> DocumentStore {
    let mut frame = Frame::new(FrameId(1), "Bench", 0);
    for e in 0..elements {
        frame.elements.push(Element::new(
            ElementId(e),
            frame.id,
            ElementKind::Shape,
            Position::new(e as f64, 0.0, 100.0, 100.0),
        ));
    }
    DocumentStore::from_presentation(Presentation {
        info: PresentationInfo {
            id: PresentationId(1),
            title: "Bench".to_string(),
            description: String::new(),
            canvas: CanvasSettings::default(),
            permission: Permission::Editor,
        },
        frames: vec![frame],
    })
}

fn move_envelope(id: i64, x: f64) -> String {
    let envelope = Envelope::ElementUpdate {
        element_id: ElementId(id),
        changes: ElementChanges::position(&Position::new(x, 20.0, 100.0, 100.0)),
    };
    attach_sender(&envelope.encode().unwrap(), &Sender::new(ParticipantId(2), "Bo")).unwrap()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = Envelope::ElementUpdate {
        element_id: ElementId(7),
        changes: ElementChanges::position(&Position::new(150.0, 130.0, 400.0, 100.0)),
    };
    c.bench_function("envelope_encode_element_update", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let raw = move_envelope(7, 150.0);
    c.bench_function("envelope_decode_element_update", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&raw)).unwrap()))
    });
}

fn bench_reconcile_moves(c: &mut Criterion) {
    let frames: Vec<String> = (0..1000).map(|n| move_envelope(n % 500, n as f64)).collect();
    let mut group = c.benchmark_group("reconcile");
    group.throughput(Throughput::Elements(frames.len() as u64));
    group.bench_function("element_update_x1000", |b| {
        let mut store = build_store(500);
        let mut presence = PresenceTracker::new(ParticipantId(1));
        let mut reconciler = RemoteReconciler::new();
        b.iter(|| {
            for raw in &frames {
                black_box(reconciler.apply(&mut store, &mut presence, raw));
            }
        })
    });
    group.finish();
}

fn bench_presence_selection(c: &mut Criterion) {
    c.bench_function("presence_selection_100_participants", |b| {
        let mut presence = PresenceTracker::new(ParticipantId(0));
        for id in 1..=100 {
            presence.join(ParticipantId(id), &format!("User {id}"));
        }
        b.iter(|| {
            for id in 1..=100 {
                presence.update_selection(
                    ParticipantId(id),
                    None,
                    Some(FrameId(1)),
                    Some(ElementId(id % 10)),
                );
            }
            black_box(presence.participants_on_element(ElementId(3)).len())
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let text = move_envelope(7, 150.0);

    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("fan_out_1000_to_10_peers", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let room = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for id in 0..10 {
                    let peer = PeerInfo::new(ParticipantId(id), "peer", Permission::Editor);
                    receivers.push(room.add_peer(peer).await);
                }
                for _ in 0..1000 {
                    room.broadcast(Uuid::nil(), text.clone());
                }
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                black_box(room.stats().await)
            })
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_reconcile_moves,
    bench_presence_selection,
    bench_broadcast_fan_out,
);
criterion_main!(benches);
