#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use bedrock_wire::config::{FrameConfig, IV_LEN, KEY_LEN};
use bedrock_wire::core::checksum;
use bedrock_wire::core::frame::{FrameDecryptor, FrameEncryptor, SecretMaterial};
use bedrock_wire::utils::compression::{compress, decompress};
use bedrock_wire::utils::crypto::{Cfb8, CipherBackend};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 97) as u8).collect()
}

fn bench_deflate(c: &mut Criterion) {
    let mut group = c.benchmark_group("deflate");
    for &size in &[64usize, 4096, 65536, 1024 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("compress_l7_{}b", size), |b| {
            b.iter(|| compress(black_box(&data), 7).unwrap())
        });
        let compressed = compress(&data, 7).unwrap();
        group.bench_function(format!("decompress_{}b", size), |b| {
            b.iter(|| {
                let out = decompress(black_box(&compressed), size).unwrap();
                assert_eq!(out.len(), size);
            })
        });
    }
    group.finish();
}

fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("cfb8");
    let key = [7u8; KEY_LEN];
    let iv = [9u8; IV_LEN];
    for &size in &[64usize, 4096, 65536] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        for backend in [CipherBackend::Software, CipherBackend::Auto] {
            group.bench_function(format!("{:?}_{}b", backend, size), |b| {
                let mut cipher = Cfb8::encryptor(&key, &iv, backend).unwrap();
                b.iter_batched(
                    || data.clone(),
                    |mut d| cipher.apply(&mut d),
                    BatchSize::SmallInput,
                )
            });
        }
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let key = [3u8; KEY_LEN];
    let data = payload(4096);
    c.bench_function("checksum_4096b", |b| {
        b.iter(|| checksum::compute(black_box(42), black_box(&data), &key))
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_pipeline");
    let config = FrameConfig::default();
    for &size in &[256usize, 16384] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("seal_open_{}b", size), |b| {
            let secret = SecretMaterial::new([1; KEY_LEN], [2; IV_LEN]);
            let mut tx = FrameEncryptor::new(secret.clone(), &config).unwrap();
            let mut rx = FrameDecryptor::new(secret, &config).unwrap();
            b.iter(|| {
                let frame = tx.encrypt(black_box(&data)).unwrap();
                let out = rx.decrypt(frame).unwrap();
                assert_eq!(out.len(), size);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_deflate, bench_cipher, bench_checksum, bench_pipeline);
criterion_main!(benches);
