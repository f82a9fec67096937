use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vmafbridge::engine::Picture;
use vmafbridge::picture::{bitblt, fill_picture};
use vmafbridge::{Frame, PixelFormat, VideoFormat};

fn bench_bitblt(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitblt");
    for (width, height) in [(1920usize, 1080usize), (3840, 2160)] {
        let src_stride = width + 64;
        let dst_stride = width.div_ceil(32) * 32;
        let src = vec![0x5au8; src_stride * height];
        let mut dst = vec![0u8; dst_stride * height];

        group.throughput(Throughput::Bytes((width * height) as u64));
        group.bench_with_input(
            BenchmarkId::new("strided", format!("{}x{}", width, height)),
            &(width, height),
            |b, &(w, h)| {
                b.iter(|| bitblt(black_box(&mut dst), dst_stride, black_box(&src), src_stride, w, h))
            },
        );
    }
    group.finish();
}

fn bench_fill_picture(c: &mut Criterion) {
    let frame = Frame::filled(VideoFormat::YUV420P10, 1920, 1080, [512, 512, 512]);
    let mut picture = Picture::alloc(PixelFormat::Yuv420p, 10, 1920, 1080).unwrap();

    c.bench_function("fill_picture 1080p10 luma", |b| {
        b.iter(|| fill_picture(black_box(&mut picture), black_box(&frame), false).unwrap())
    });
    c.bench_function("fill_picture 1080p10 chroma", |b| {
        b.iter(|| fill_picture(black_box(&mut picture), black_box(&frame), true).unwrap())
    });
}

criterion_group!(benches, bench_bitblt, bench_fill_picture);
criterion_main!(benches);
