use std::hint::black_box;
use std::io::Cursor;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use es_demux::{ExtractionJob, JobParams, MemorySinkFactory, StreamFilter, StreamKind};

const PACKET_SIZE: usize = 188;

fn benchmark_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Extraction");
    let data = create_ts_data(400);
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("all streams", |b| {
        b.iter(|| {
            let mut job = ExtractionJob::new(
                Cursor::new(data.clone()),
                MemorySinkFactory::new(),
                JobParams::default(),
            );
            black_box(job.run())
        })
    });

    group.bench_function("audio only", |b| {
        b.iter(|| {
            let mut job = ExtractionJob::new(
                Cursor::new(data.clone()),
                MemorySinkFactory::new(),
                JobParams::new(StreamFilter::of_kind(StreamKind::Audio)),
            );
            black_box(job.run())
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_extraction);
criterion_main!(benches);

/// Interleaved video (PID 0x100) and audio (PID 0x101) units
fn create_ts_data(units: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut counters = [0u8; 2];
    for i in 0..units {
        let pts = 3600 * i as u64;
        write_pes(&mut out, 0x100, &mut counters[0], &pes(0xE0, pts, 4000));
        write_pes(&mut out, 0x101, &mut counters[1], &pes(0xC0, pts, 400));
    }
    out
}

fn pes(stream_id: u8, pts: u64, payload: usize) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x80, 0x05];
    data.extend_from_slice(&[
        0x21 | (((pts >> 30) & 0x07) as u8) << 1,
        (pts >> 22) as u8,
        (((pts >> 15) & 0x7F) as u8) << 1 | 1,
        (pts >> 7) as u8,
        ((pts & 0x7F) as u8) << 1 | 1,
    ]);
    data.extend((0..payload).map(|i| 0x80 + (i % 0x40) as u8));
    let length = (data.len() - 6) as u16;
    data[4..6].copy_from_slice(&length.to_be_bytes());
    data
}

fn write_pes(out: &mut Vec<u8>, pid: u16, counter: &mut u8, pes: &[u8]) {
    for (i, chunk) in pes.chunks(PACKET_SIZE - 4).enumerate() {
        let pusi = if i == 0 { 0x40 } else { 0x00 };
        out.extend_from_slice(&[0x47, pusi | (pid >> 8) as u8, pid as u8]);
        if chunk.len() == PACKET_SIZE - 4 {
            out.push(0x10 | *counter);
        } else {
            // Adaptation field stuffing
            let stuffing = PACKET_SIZE - 5 - chunk.len();
            out.push(0x30 | *counter);
            out.push(stuffing as u8);
            if stuffing > 0 {
                out.push(0x00);
                out.extend(std::iter::repeat_n(0xFF, stuffing - 1));
            }
        }
        out.extend_from_slice(chunk);
        *counter = (*counter + 1) & 0x0F;
    }
}
