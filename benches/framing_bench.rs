use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use trafficloop::streaming::protocol::{read_frame, write_frame};
use trafficloop::streaming::{Block, BlockType, Generator, GeneratorConfig, Message};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn bench_block_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_generation");

    for size in [64u32, 1024, 16 * 1024].iter() {
        let config = GeneratorConfig {
            count: u32::MAX,
            payload_min: *size,
            payload_max: *size,
            latency_frequency: 0,
        };
        let mut generator = Generator::seeded(config, 7);
        let mut sequence = 0u32;

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                sequence = sequence.wrapping_add(1);
                black_box(generator.next_block(sequence))
            });
        });
    }

    group.finish();
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_round_trip");
    let rt = runtime();

    for size in [64usize, 1024, 16 * 1024].iter() {
        let block = Block::new(0, BlockType::Plain, vec![0xA5; *size]);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut wire = Vec::with_capacity(*size + 128);
                    write_frame(&mut wire, &block.encode().unwrap())
                        .await
                        .unwrap();
                    let payload = read_frame(&mut Cursor::new(wire)).await.unwrap();
                    let decoded = Block::decode(&payload).unwrap();
                    decoded.verify_hash().unwrap();
                    black_box(decoded)
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_block_generation, bench_frame_round_trip);
criterion_main!(benches);
