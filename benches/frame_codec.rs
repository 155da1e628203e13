//! Benchmarks for the frame codec.
//!
//! Tests: header peek, typed decode, encode into a reused buffer, Begin hint
//! extension encode/decode.

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use r0n_dataplane::frame::{
    BeginFrame, DataFrame, Frame, FrameHeader, ProxyBeginEx, BEGIN, DATA,
};
use std::hint::black_box;

fn header() -> FrameHeader {
    FrameHeader::new(1, 2, 7).with_flow(0, 0, 65536).with_trace(9)
}

fn encoded_data(size: usize) -> (Vec<u8>, Vec<u8>) {
    let payload = vec![0x5a; size];
    let mut out = BytesMut::new();
    Frame::Data(DataFrame {
        header: header(),
        flags: 0,
        budget_id: 0,
        reserved: size as u32,
        payload: &payload,
        extension: &[],
    })
    .encode_to(&mut out)
    .unwrap();
    (out.to_vec(), payload)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/decode");

    let (small, _) = encoded_data(64);
    group.bench_function("peek_header", |b| {
        b.iter(|| black_box(FrameHeader::peek(black_box(&small), 0, small.len()).unwrap()));
    });

    for size in [64, 1024, 16384] {
        let (buffer, _) = encoded_data(size);
        group.throughput(Throughput::Bytes(buffer.len() as u64));
        group.bench_with_input(BenchmarkId::new("data", size), &buffer, |b, buffer| {
            b.iter(|| black_box(Frame::decode(DATA, black_box(buffer)).unwrap()));
        });
    }

    let extension = ProxyBeginEx::new()
        .with_authority("api.example.com")
        .with_alpn("h2")
        .with_port(443)
        .encode()
        .unwrap();
    let mut begin = BytesMut::new();
    Frame::Begin(BeginFrame {
        header: header(),
        authorization: 0,
        affinity: 0,
        extension: &extension,
    })
    .encode_to(&mut begin)
    .unwrap();
    group.bench_function("begin_with_hints", |b| {
        b.iter(|| {
            let Frame::Begin(frame) = Frame::decode(BEGIN, black_box(&begin)).unwrap() else {
                unreachable!();
            };
            black_box(ProxyBeginEx::decode(frame.extension).unwrap());
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/encode");

    for size in [64, 1024, 16384] {
        let (_, payload) = encoded_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_into_slice", size), &payload, |b, payload| {
            let frame = Frame::Data(DataFrame {
                header: header(),
                flags: 0,
                budget_id: 0,
                reserved: payload.len() as u32,
                payload,
                extension: &[],
            });
            let mut buffer = vec![0u8; frame.sizeof()];
            b.iter(|| black_box(frame.encode(&mut buffer, 0).unwrap()));
        });
    }

    group.bench_function("begin_hints", |b| {
        let hints = ProxyBeginEx::new()
            .with_authority("api.example.com")
            .with_alpn("h2")
            .with_port(443);
        b.iter(|| black_box(hints.encode().unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
