extern crate vbi_teletext;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use vbi_teletext::config::Config;
use vbi_teletext::decoder::LineDecoder;
use vbi_teletext::pipeline::decode_lines;
use vbi_teletext::signal::{self, PACKET_LEN};
use vbi_teletext::synth::render_line;

fn sample_payload() -> [u8; PACKET_LEN] {
    let mut payload = [0x41u8; PACKET_LEN];
    payload[0] = *signal::hamm_bytes().first().unwrap();
    payload[1] = *signal::hamm_bytes().last().unwrap();
    for b in payload.iter_mut().skip(2) {
        *b = *signal::parity_bytes()
            .iter()
            .min_by_key(|&&p| (p as i16 - 0x41).abs())
            .unwrap();
    }
    payload
}

fn decode_one_line(decoder: &mut LineDecoder, samples: &[f64]) {
    let (packet, _diagnostics) = decoder.decode(samples);
    black_box(packet);
}

fn bench_decoder(c: &mut Criterion) {
    let payload = sample_payload();
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);

    let mut group = c.benchmark_group("decoder");
    group.sample_size(50).measurement_time(Duration::new(10, 0));
    group.bench_function("decode_single_line", |b| {
        let mut decoder = LineDecoder::new(Config::bt8x8(), Vec::new());
        b.iter(|| decode_one_line(&mut decoder, black_box(&samples)))
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let payload = sample_payload();
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20).measurement_time(Duration::new(15, 0));
    for &workers in &[1usize, 2, 4, 8] {
        group.bench_function(format!("decode_1000_lines_{workers}_workers"), |b| {
            b.iter(|| {
                let lines: Vec<Vec<f64>> = std::iter::repeat(samples.clone()).take(1000).collect();
                let pipeline =
                    decode_lines(Config::bt8x8().with_workers(workers), Vec::new, lines).unwrap();
                let mut count = 0usize;
                for result in pipeline {
                    black_box(result.unwrap());
                    count += 1;
                }
                debug_assert_eq!(count, 1000);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decoder, bench_pipeline);
criterion_main!(benches);
