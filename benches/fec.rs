//! Reed-Solomon 코덱 벤치마크
//!
//! 블록 크기 / 패리티 수별 인코딩, 소거 복구 처리량 측정

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use norm_engine::fec::RsCodec;

const SEGMENT_SIZE: usize = 1400;

fn source_block(k: usize) -> Vec<Vec<u8>> {
    (0..k)
        .map(|i| (0..SEGMENT_SIZE).map(|j| (i * 31 + j * 7) as u8).collect())
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("rs_encode");

    for (k, p) in [(16, 4), (64, 8), (64, 16), (128, 32)] {
        let codec = RsCodec::new(k, p).unwrap();
        let source = source_block(k);
        group.throughput(Throughput::Bytes((k * SEGMENT_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}+{}", k, p)), &source, |b, source| {
            b.iter(|| black_box(codec.encode(source).unwrap()))
        });
    }

    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("rs_reconstruct");

    for (k, p) in [(16, 4), (64, 8), (64, 16)] {
        let codec = RsCodec::new(k, p).unwrap();
        let source = source_block(k);
        let parity = codec.encode(&source).unwrap();

        // 패리티 수만큼 소스 유실 (최악의 경우)
        let mut received: Vec<Option<Vec<u8>>> = source.into_iter().map(Some).collect();
        for slot in received.iter_mut().take(p) {
            *slot = None;
        }
        received.extend(parity.into_iter().map(Some));

        group.throughput(Throughput::Bytes((k * SEGMENT_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}+{}", k, p)), &received, |b, received| {
            b.iter(|| {
                let mut symbols = received.clone();
                codec.reconstruct(&mut symbols).unwrap();
                black_box(symbols)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_reconstruct);
criterion_main!(benches);
