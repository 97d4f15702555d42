//! Packet framing throughput (spec.md §4.9): encode/decode of a
//! moderately sized reply, the shape most event/command traffic takes.

use criterion::{black_box, Criterion};
use dalvikheap::jdwp::packet::Packet;

fn sample() -> Packet {
    Packet::reply_ok(42, vec![0xAB; 256])
}

pub fn bench(c: &mut Criterion) {
    c.bench_function("packet_encode", |b| {
        let packet = sample();
        b.iter(|| black_box(packet.encode()))
    });

    c.bench_function("packet_decode", |b| {
        let bytes = sample().encode();
        b.iter(|| black_box(Packet::decode(black_box(&bytes)).unwrap()))
    });
}
