use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use vista_collab::{
    Correlator, Envelope, EventDispatcher, ForwardedMessage, KeyedReplica, ObjectGrab,
    ObjectGrabResponse, Pose, PresenceDirectory, RemoteUser, RespondableHandlers,
    RespondableRequest, ResponseGuard, RestoreRegistry, Rgb,
};

fn grab_request() -> RespondableRequest {
    RespondableRequest::new(
        "object_grab",
        &ObjectGrab {
            object_id: "node-1".into(),
        },
        ResponseGuard::<ObjectGrabResponse>::shape(),
        RespondableHandlers::new(|r: ObjectGrabResponse| r.is_success, || false),
    )
    .unwrap()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let pose = ForwardedMessage {
        user_id: "3f1c2a".to_string(),
        original_message: Envelope::new("user_positions", Pose::default()),
    };
    let envelope = Envelope::new("user_positions", pose);

    c.bench_function("envelope_encode_pose", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let frame = Envelope::new(
        "user_positions",
        json!({"userId": "3f1c2a", "originalMessage": {"event": "user_positions",
            "payload": {"position": [1.0, 2.0, 3.0], "quaternion": [0.0, 0.0, 0.0, 1.0]}}}),
    )
    .encode()
    .unwrap();

    c.bench_function("envelope_decode_pose", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_dispatcher_trigger(c: &mut Criterion) {
    let dispatcher: EventDispatcher = EventDispatcher::new();
    let owner = dispatcher.owner();
    for _ in 0..10 {
        dispatcher.on("chat", owner, |payload| {
            black_box(payload);
            Ok(())
        });
    }
    let payload = json!({"text": "hello"});

    c.bench_function("dispatcher_trigger_10_handlers", |b| {
        b.iter(|| black_box(dispatcher.trigger("chat", black_box(&payload))))
    });
}

fn bench_correlator_roundtrip(c: &mut Criterion) {
    let mut correlator = Correlator::new();
    let response = json!({"isSuccess": true});

    c.bench_function("correlator_register_resolve", |b| {
        b.iter(|| {
            let (nonce, envelope) = correlator.register(grab_request());
            black_box(envelope);
            black_box(correlator.resolve(nonce, &response));
        })
    });
}

fn bench_correlator_go_offline_1000(c: &mut Criterion) {
    c.bench_function("correlator_go_offline_1000", |b| {
        b.iter(|| {
            let mut correlator = Correlator::new();
            for _ in 0..1000 {
                correlator.register(grab_request());
            }
            black_box(correlator.go_offline());
        })
    });
}

fn bench_presence_churn(c: &mut Criterion) {
    let mut directory = PresenceDirectory::new(16);
    let users: Vec<RemoteUser> = (0..100)
        .map(|i| RemoteUser::new(format!("user-{i}"), format!("User {i}"), Rgb::default()))
        .collect();

    c.bench_function("presence_add_remove_100", |b| {
        b.iter(|| {
            for user in &users {
                directory.add(user.clone());
            }
            black_box(directory.remove_all());
        })
    });
}

fn bench_restore_apply(c: &mut Criterion) {
    let source: Arc<KeyedReplica<String>> = Arc::new(KeyedReplica::new("annotations"));
    for i in 0..500 {
        source.insert(format!("a{i}"), format!("annotation body {i}"));
    }
    let mut host = RestoreRegistry::new();
    host.register(source).unwrap();
    let snapshot = host.capture().unwrap();

    let mut joiner = RestoreRegistry::new();
    joiner
        .register(Arc::new(KeyedReplica::<String>::new("annotations")))
        .unwrap();

    c.bench_function("restore_apply_500_entries", |b| {
        b.iter(|| black_box(joiner.apply(black_box(&snapshot))))
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_dispatcher_trigger,
    bench_correlator_roundtrip,
    bench_correlator_go_offline_1000,
    bench_presence_churn,
    bench_restore_apply,
);

criterion_main!(benches);
