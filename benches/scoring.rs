//! Scoring throughput of the trained detectors.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use sops_anomaly::{
    AutoEncoder, AutoEncoderConfig, BaseDetector, ComputeMode, Donut, DonutConfig, ErrorDistribution,
    LstmAd, LstmAdConfig, TimeSeries, TrainOptions,
};

fn seasonal(rows: usize, cols: usize) -> TimeSeries {
    TimeSeries::from_values(Array2::from_shape_fn((rows, cols), |(t, c)| {
        (t as f64 * 0.2 + c as f64).sin()
    }))
}

fn benchmark_autoencoder_predict(c: &mut Criterion) {
    let data = seasonal(2_000, 4);
    for (name, compute) in [
        ("autoencoder_predict_serial", ComputeMode::Serial),
        ("autoencoder_predict_parallel", ComputeMode::Parallel { threads: None }),
    ] {
        let mut detector = AutoEncoder::new(AutoEncoderConfig {
            window_size: 8,
            latent_size: 8,
            layers: vec![32, 16],
            seed: Some(0),
            compute,
            ..AutoEncoderConfig::default()
        })
        .unwrap();
        detector.train(&data, &TrainOptions::new(1, 1e-3)).unwrap();

        c.bench_function(name, |b| {
            b.iter(|| black_box(detector.predict(black_box(&data)).unwrap()));
        });
    }
}

fn benchmark_lstm_ad_predict(c: &mut Criterion) {
    let data = seasonal(500, 2);
    let mut detector = LstmAd::new(LstmAdConfig {
        l_predictions: 5,
        hidden_size: 32,
        seed: Some(0),
        ..LstmAdConfig::default()
    })
    .unwrap();
    detector.train(&data, &TrainOptions::new(1, 1e-3)).unwrap();

    c.bench_function("lstm_ad_predict", |b| {
        b.iter(|| black_box(detector.predict(black_box(&data)).unwrap()));
    });
}

fn benchmark_donut_predict(c: &mut Criterion) {
    let data = seasonal(400, 2);
    let mut detector = Donut::new(DonutConfig {
        x_dims: 30,
        hidden_layers: vec![32, 32],
        n_z: 64,
        seed: Some(0),
        compute: ComputeMode::Parallel { threads: None },
        ..DonutConfig::default()
    })
    .unwrap();
    detector.train(&data, &TrainOptions::new(1, 1e-3)).unwrap();

    c.bench_function("donut_predict", |b| {
        b.iter(|| black_box(detector.predict(black_box(&data)).unwrap()));
    });
}

fn benchmark_error_distribution_fit(c: &mut Criterion) {
    let residuals = Array2::from_shape_fn((1_000, 40), |(r, k)| ((r * 13 + k * 7) % 17) as f64 * 0.01);

    c.bench_function("error_distribution_fit", |b| {
        b.iter(|| black_box(ErrorDistribution::fit(black_box(residuals.view()), 1e-6).unwrap()));
    });
}

criterion_group!(
    benches,
    benchmark_autoencoder_predict,
    benchmark_lstm_ad_predict,
    benchmark_donut_predict,
    benchmark_error_distribution_fit
);
criterion_main!(benches);
