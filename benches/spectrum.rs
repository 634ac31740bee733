//! Benchmarks for the capture analysis

use audiobat::audio::analyzer::HarmonicAnalyzer;
use audiobat::audio::noise::NoiseAnalyzer;
use audiobat::audio::signal::SineGenerator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const RATE: u32 = 44100;

fn tone(len: usize) -> Vec<f64> {
    let mut gen = SineGenerator::new(0.5, 997.0, RATE).unwrap();
    let mut buf = vec![0.0; len];
    gen.fill_buffer(&mut buf);
    buf
}

fn bench_harmonic(c: &mut Criterion) {
    let samples = tone(RATE as usize);
    let mut analyzer = HarmonicAnalyzer::new(3.0);
    c.bench_function("harmonic_analyze_1s", |b| {
        b.iter(|| analyzer.analyze(0, black_box(&samples), RATE, 997.0).unwrap())
    });
}

fn bench_noise(c: &mut Criterion) {
    let samples = tone(RATE as usize);
    let analyzer = NoiseAnalyzer::new(997.0, RATE, 30.0).unwrap();
    c.bench_function("noise_analyze_1s", |b| {
        b.iter(|| analyzer.analyze(0, black_box(&samples)).unwrap())
    });
}

criterion_group!(benches, bench_harmonic, bench_noise);
criterion_main!(benches);
