use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use screencast::encode::{h264, AudioCodec, VideoCodec};
use screencast::output::{ContainerWriter, MatroskaWriter};
use screencast::{Buffer, BufferFlags, RecorderConfig, StreamKind};
use std::io::Cursor;

fn write_interleaved(c: &mut Criterion) {
    let mut group = c.benchmark_group("matroska_write");

    for &(width, height) in &[(640u32, 360u32), (1280, 720)] {
        let config = RecorderConfig::default().with_resolution(width, height);
        let video = config.video_format(VideoCodec::Raw);
        let audio = config.audio_format(AudioCodec::Pcm);
        let frame = vec![0x80u8; (width * height * 3 / 2) as usize];
        let block = vec![0u8; config.audio.block_bytes()];
        let frames = 48u64;

        group.throughput(Throughput::Bytes(frame.len() as u64 * frames));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", width, height)),
            &frames,
            |b, &frames| {
                b.iter(|| {
                    let mut writer = MatroskaWriter::new(Cursor::new(Vec::new()));
                    let v = writer.add_track(StreamKind::Video, &video).unwrap();
                    let a = writer.add_track(StreamKind::Audio, &audio).unwrap();
                    writer.begin().unwrap();
                    for i in 0..frames as i64 {
                        let ts = i * 20_833;
                        let flags = if i % 48 == 0 { BufferFlags::KEY_FRAME } else { BufferFlags::NONE };
                        writer.write_sample(v, &Buffer::new(frame.clone(), ts, flags)).unwrap();
                        writer
                            .write_sample(a, &Buffer::new(block.clone(), ts, BufferFlags::NONE))
                            .unwrap();
                    }
                    black_box(writer.finish().unwrap())
                })
            },
        );
    }

    group.finish();
}

fn annex_b(c: &mut Criterion) {
    let mut access_unit = Vec::new();
    for (nal_type, len) in [(7u8, 16usize), (8, 4), (5, 60_000)] {
        access_unit.extend_from_slice(&[0, 0, 0, 1, 0x60 | nal_type]);
        access_unit.extend(std::iter::repeat(0x5a).take(len));
    }

    c.bench_function("annex_b_to_avcc", |b| {
        b.iter(|| black_box(h264::annex_b_to_avcc(black_box(&access_unit))))
    });
}

criterion_group!(benches, write_interleaved, annex_b);
criterion_main!(benches);
