//! Benchmarks for the hot paths: wire encode/decode and interpolation
//! sampling under a full buffer.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fabrik_collab::interp::{InterpolationBuffer, MotionSample};
use fabrik_collab::protocol::{PlayerState, WireMessage};
use uuid::Uuid;

fn bench_wire_roundtrip(c: &mut Criterion) {
    let msg = WireMessage::PlayerUpdate {
        id: Uuid::new_v4(),
        state: PlayerState {
            position: [12.5, 0.0, -3.25],
            yaw: 1.57,
            velocity: [0.4, 0.0, 1.1],
            selected_machine: Some("press-1".to_string()),
            timestamp_ms: 123_456,
        },
    };
    let frame = msg.encode().unwrap();

    c.bench_function("player_update_encode", |b| {
        b.iter(|| black_box(&msg).encode().unwrap())
    });
    c.bench_function("player_update_decode", |b| {
        b.iter(|| WireMessage::decode(black_box(&frame)).unwrap())
    });
}

fn bench_interpolation(c: &mut Criterion) {
    let mut buf = InterpolationBuffer::new();
    for i in 0..20u64 {
        buf.add_sample(MotionSample {
            position: [i as f32, 0.0, (i * 2) as f32],
            yaw: 0.1 * i as f32,
            velocity: [1.0, 0.0, 2.0],
            timestamp_ms: 1_000 + i * 50,
        });
    }

    c.bench_function("interpolate_full_buffer", |b| {
        b.iter(|| buf.interpolated_state(black_box(1_600)))
    });

    c.bench_function("add_sample_at_cap", |b| {
        let mut t = 2_000u64;
        b.iter(|| {
            t += 50;
            buf.add_sample(MotionSample {
                position: [0.0; 3],
                yaw: 0.0,
                velocity: [0.0; 3],
                timestamp_ms: t,
            });
        })
    });
}

criterion_group!(benches, bench_wire_roundtrip, bench_interpolation);
criterion_main!(benches);
