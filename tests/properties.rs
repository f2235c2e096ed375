use ndarray::Array2;
use proptest::prelude::*;
use sops_anomaly::{
    window_array, window_data, AutoEncoder, AutoEncoderConfig, BaseDetector, LstmAd, LstmAdConfig,
    TimeSeries, TrainOptions,
};

fn matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        ((r as u64 * 31 + c as u64 * 7 + seed) % 97) as f64 / 10.0
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_window_shape(rows in 1usize..40, cols in 1usize..5, window in 1usize..8, seed in 0u64..100) {
        prop_assume!(window <= rows);
        let values = matrix(rows, cols, seed);
        let windowed = window_array(values.view(), window).unwrap();
        prop_assert_eq!(windowed.dim(), (rows - window + 1, cols * window));
        for r in 0..windowed.nrows() {
            for k in 0..window {
                for c in 0..cols {
                    prop_assert_eq!(windowed[[r, k * cols + c]], values[[r + k, c]]);
                }
            }
        }
    }

    #[test]
    fn prop_window_rejects_oversized(rows in 1usize..10, extra in 1usize..5) {
        let values = matrix(rows, 2, 0);
        prop_assert!(window_array(values.view(), rows + extra).is_err());
    }

    #[test]
    fn prop_window_data_index(rows in 2usize..30, window in 1usize..5) {
        prop_assume!(window <= rows);
        let table = TimeSeries::from_values(matrix(rows, 2, 3));
        let windowed = window_data(&table, window).unwrap();
        prop_assert_eq!(windowed.len(), rows - window + 1);
        prop_assert_eq!(windowed.index()[0], (window - 1) as i64);
        prop_assert_eq!(windowed.columns().len(), 2 * window);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_autoencoder_output_aligned(rows in 6usize..30, cols in 1usize..4, window in 1usize..5) {
        let mut detector = AutoEncoder::new(AutoEncoderConfig {
            window_size: window,
            latent_size: 2,
            layers: vec![6],
            seed: Some(1),
            ..AutoEncoderConfig::default()
        })
        .unwrap();
        let data = TimeSeries::from_values(matrix(rows, cols, 5));
        detector.train(&data, &TrainOptions::new(1, 1e-3)).unwrap();

        let scores = detector.predict(&data).unwrap();
        prop_assert_eq!(scores.len(), rows);
        prop_assert!(scores.iter().take(window - 1).all(|&s| s == 0.0));
        prop_assert!(scores.iter().all(|&s| s <= detector.max_error()));

        let mask = detector.detect(&data).unwrap();
        prop_assert_eq!(mask.len(), rows);
        prop_assert!(mask.iter().take(window - 1).all(|&m| m == 0));
    }

    #[test]
    fn prop_lstm_ad_padding(l in 1usize..4, extra in 1usize..20) {
        let rows = 2 * l + extra;
        let mut detector = LstmAd::new(LstmAdConfig {
            l_predictions: l,
            hidden_size: 4,
            num_layers: 1,
            dropout: 0.0,
            seed: Some(2),
            ..LstmAdConfig::default()
        })
        .unwrap();
        let data = TimeSeries::from_values(matrix(rows, 2, 9));
        detector.train(&data, &TrainOptions::new(1, 1e-3)).unwrap();

        let scores = detector.predict(&data).unwrap();
        prop_assert_eq!(scores.len(), rows);
        prop_assert!(scores.iter().take(l).all(|&s| s == 0.0));
        prop_assert!(scores.iter().skip(rows - l).all(|&s| s == 0.0));
    }
}
