//! Codec benchmarks for murmur-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use murmur_protocol::{codec, ServerFrame};

fn bench_decode_message(c: &mut Criterion) {
    let raw = format!(
        r#"{{"type":"message","receiver_id":42,"content":"{}"}}"#,
        "x".repeat(64)
    );

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::decode(black_box(&raw), codec::DEFAULT_MAX_FRAME_SIZE))
    });
    group.finish();
}

fn bench_decode_ice(c: &mut Criterion) {
    let raw = r#"{"type":"ice_candidate","call_id":9,"target_user_id":2,"candidate":{"candidate":"candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 10.0.0.4 rport 46154","sdpMid":"0","sdpMLineIndex":0}}"#;

    c.bench_function("decode_ice_candidate", |b| {
        b.iter(|| codec::decode(black_box(raw), codec::DEFAULT_MAX_FRAME_SIZE))
    });
}

fn bench_encode_message(c: &mut Criterion) {
    let frame = ServerFrame::Message {
        message_id: 1001,
        sender_id: 7,
        content: "y".repeat(256),
        created_at: 1_700_000_000_000,
        is_group: false,
        group_id: None,
        offline: false,
    };

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("message_256B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

criterion_group!(
    benches,
    bench_decode_message,
    bench_decode_ice,
    bench_encode_message
);
criterion_main!(benches);
