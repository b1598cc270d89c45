//! Benchmarks for frame decoding and encoding.
use std::{
    hint::black_box,
    io::{self, Read},
};

use criterion::{BatchSize, Criterion, Throughput};
use wsreactor::{
    protocol::frame::{apply_mask, Frame, FrameCodec},
    OpCode,
};

const MESSAGES: u64 = 100_000;

/// Yields its data, then blocks.
struct MockRead(io::Cursor<Vec<u8>>);

impl Read for MockRead {
    fn read(&mut self, to: &mut [u8]) -> io::Result<usize> {
        match self.0.read(to)? {
            0 => Err(io::Error::new(io::ErrorKind::WouldBlock, "not ready")),
            n => Ok(n),
        }
    }
}

/// Masked client frames carrying a mix of text and binary messages.
fn client_frames() -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..MESSAGES {
        let (opcode, mut payload) = match i {
            _ if i % 3 == 0 => (0x2, i.to_le_bytes().to_vec()),
            _ => (0x1, format!("{{\"id\":{i}}}").into_bytes()),
        };
        let mask: [u8; 4] = rand::random();
        apply_mask(&mut payload, mask);
        out.push(0x80 | opcode);
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&mask);
        out.extend_from_slice(&payload);
    }
    out
}

fn benchmark(c: &mut Criterion) {
    let input = client_frames();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("read+unmask 100k small frames", |b| {
        b.iter_batched(
            || (FrameCodec::new(), MockRead(io::Cursor::new(input.clone()))),
            |(mut codec, mut stream)| {
                let mut sum = 0;
                while let Some(frame) = codec.read_frame(&mut stream, None).unwrap() {
                    sum += match frame.opcode() {
                        OpCode::Binary => {
                            let a: &[u8; 8] = frame.payload().try_into().unwrap();
                            u64::from_le_bytes(*a)
                        }
                        _ => frame.len() as u64,
                    };
                }
                black_box(sum)
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("write 100k small frames", |b| {
        b.iter_batched(
            || (0..MESSAGES).map(|i| Frame::text(format!("{{\"id\":{i}}}"))).collect::<Vec<_>>(),
            |frames| {
                let mut out = Vec::with_capacity(16 * MESSAGES as usize);
                for frame in frames {
                    frame.format_into_buf(&mut out).unwrap();
                }
                black_box(out)
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();

    let mut payload: Vec<u8> = (0..1024 * 1024).map(|_| rand::random()).collect();
    let mut group = c.benchmark_group("mask");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("apply_mask 1 MiB", |b| {
        b.iter(|| apply_mask(black_box(&mut payload), black_box([1, 2, 3, 4])))
    });
    group.finish();
}

criterion::criterion_group!(codec_benches, benchmark);
criterion::criterion_main!(codec_benches);
