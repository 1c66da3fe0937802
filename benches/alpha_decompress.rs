//! Benchmarks for alpha plane decompression
//!
//! Measures one full-screen-width overlay band through each compression path,
//! reusing pooled output buffers the way the alpha render thread does.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use vcs_client::alpha::{AlphaCompression, AlphaDecompressor, rle};
use vcs_client::media::NativeBufferPool;
use vcs_client::test_utils::{alpha_unit, zlib_compress};

const WIDTH: usize = 1920;
const HEIGHT: usize = 270;

/// Overlay-like plane: long opaque and transparent runs with soft edges.
fn overlay_plane() -> Vec<u8> {
    (0..WIDTH * HEIGHT)
        .map(|i| match i % WIDTH {
            x if x < 400 => 0x00,
            x if x < 404 => 0x80,
            x if x < 1500 => 0xFF,
            _ => 0x00,
        })
        .collect()
}

fn compressed(compression: AlphaCompression, plane: &[u8]) -> Vec<u8> {
    match compression {
        AlphaCompression::None => plane.to_vec(),
        AlphaCompression::Zip => zlib_compress(plane),
        AlphaCompression::Rle => rle::encode(plane),
        AlphaCompression::ZipRle => zlib_compress(&rle::encode(plane)),
        AlphaCompression::Lz4 => lz4_flex::block::compress(plane),
    }
}

fn bench_decompress(c: &mut Criterion) {
    let plane = overlay_plane();
    let placement = (0, 810, WIDTH as i32, HEIGHT as i32);

    let mut group = c.benchmark_group("alpha_decompress");
    group.throughput(Throughput::Bytes(plane.len() as u64));

    for compression in [
        AlphaCompression::None,
        AlphaCompression::Zip,
        AlphaCompression::Rle,
        AlphaCompression::ZipRle,
        AlphaCompression::Lz4,
    ] {
        let unit = alpha_unit(0, compression.tag(), placement, &compressed(compression, &plane));
        let mut decompressor = AlphaDecompressor::new(NativeBufferPool::new(4, WIDTH * 1080));

        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", compression)), &unit, |b, unit| {
            b.iter(|| {
                let frame = decompressor.decompress(black_box(unit)).expect("decompress");
                black_box(frame)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decompress);
criterion_main!(benches);
