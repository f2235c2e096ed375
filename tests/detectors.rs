use ndarray::{Array1, Array2};
use sops_anomaly::{
    BaseDetector, ComputeMode, DetectorConfig, Error, Evaluator, PipelineConfig, TimeSeries,
    TrainOptions,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn seasonal(rows: usize, cols: usize) -> TimeSeries {
    TimeSeries::from_values(Array2::from_shape_fn((rows, cols), |(t, c)| {
        (t as f64 * 0.35 + c as f64).sin() + 0.1 * c as f64
    }))
}

fn pipeline(source: &str) -> PipelineConfig {
    PipelineConfig::from_toml_str(source).unwrap()
}

const AUTOENCODER: &str = r#"
    [detector]
    kind = "autoencoder"
    window_size = 3
    latent_size = 2
    layers = [8]
    seed = 3

    [train]
    epochs = 2
    learning_rate = 0.001
"#;

const LSTM_AD: &str = r#"
    [detector]
    kind = "lstm_ad"
    l_predictions = 2
    hidden_size = 6
    num_layers = 2
    dropout = 0.2
    seed = 3

    [train]
    epochs = 3
    learning_rate = 0.01
"#;

const DONUT: &str = r#"
    [detector]
    kind = "donut"
    x_dims = 6
    z_dims = 2
    hidden_layers = [8]
    batch_size = 16
    n_z = 8
    seed = 3

    [train]
    epochs = 2
    learning_rate = 0.001
"#;

const VAE: &str = r#"
    [detector]
    kind = "vae"
    window_size = 2
    latent_size = 2
    layers = [8, 4]
    seed = 3

    [train]
    epochs = 2
    learning_rate = 0.001
"#;

#[test]
fn test_every_detector_scores_every_row() {
    init_tracing();
    let data = seasonal(48, 2);
    for source in [AUTOENCODER, LSTM_AD, DONUT, VAE] {
        let config = pipeline(source);
        let mut detector = config.build_detector().unwrap();
        assert!(!detector.is_trained());

        let scores = detector.train_predict(&data, &config.train).unwrap();
        assert!(detector.is_trained());
        assert_eq!(scores.len(), data.len(), "{:?}", config.detector);
        assert!(scores.iter().all(|s| s.is_finite()));
    }
}

#[test]
fn test_untrained_detectors_refuse_to_predict() {
    let data = seasonal(30, 1);
    for source in [AUTOENCODER, LSTM_AD, DONUT, VAE] {
        let detector = pipeline(source).build_detector().unwrap();
        assert!(matches!(detector.predict(&data), Err(Error::NotTrained)));
    }
}

#[test]
fn test_column_mismatch_is_reported() {
    let train = seasonal(40, 2);
    let other = seasonal(40, 3);
    for source in [AUTOENCODER, LSTM_AD, DONUT, VAE] {
        let config = pipeline(source);
        let mut detector = config.build_detector().unwrap();
        detector.train(&train, &config.train).unwrap();
        assert!(matches!(
            detector.predict(&other),
            Err(Error::ColumnMismatch { expected: 2, found: 3 })
        ));
    }
}

#[test]
fn test_retraining_replaces_the_model() {
    let config = pipeline(AUTOENCODER);
    let mut detector = config.build_detector().unwrap();
    detector.train(&seasonal(30, 2), &config.train).unwrap();
    detector.train(&seasonal(30, 4), &config.train).unwrap();
    assert_eq!(detector.predict(&seasonal(30, 4)).unwrap().len(), 30);
}

#[test]
fn test_donut_detect_is_unsupported() {
    let config = pipeline(DONUT);
    let mut detector = config.build_detector().unwrap();
    let data = seasonal(40, 1);
    detector.train(&data, &config.train).unwrap();
    assert!(matches!(detector.detect(&data), Err(Error::Unsupported(_))));
}

#[test]
fn test_autoencoder_detects_injected_spike() {
    init_tracing();
    let config = PipelineConfig::from_toml_str(
        r#"
        [detector]
        kind = "autoencoder"
        latent_size = 3
        layers = [12]
        seed = 9

        [train]
        epochs = 40
        learning_rate = 0.01
    "#,
    )
    .unwrap();
    let mut detector = config.build_detector().unwrap();
    let data = seasonal(80, 2);
    detector.train(&data, &config.train).unwrap();

    let mut values = data.values().to_owned();
    values[[50, 1]] = 30.0;
    let mask = detector.detect(&TimeSeries::from_values(values)).unwrap();

    let mut labels = Array1::<i32>::zeros(80);
    labels[50] = 1;
    let report = Evaluator::new().evaluate_mask(labels.view(), mask.view()).unwrap();
    assert_eq!(report.true_positives, 1);
    assert_eq!(report.recall, 1.0);
}

#[test]
fn test_parallel_mode_is_deterministic() {
    let data = seasonal(40, 3);
    let options = TrainOptions::new(2, 1e-3).verbose(true);
    for source in [AUTOENCODER, DONUT, VAE] {
        let config = pipeline(source);
        let parallel = match config.detector.clone() {
            DetectorConfig::AutoEncoder(c) => DetectorConfig::AutoEncoder(sops_anomaly::AutoEncoderConfig {
                compute: ComputeMode::Parallel { threads: Some(2) },
                ..c
            }),
            DetectorConfig::Donut(c) => DetectorConfig::Donut(sops_anomaly::DonutConfig {
                compute: ComputeMode::Parallel { threads: Some(2) },
                ..c
            }),
            DetectorConfig::Vae(c) => DetectorConfig::Vae(sops_anomaly::VaeConfig {
                compute: ComputeMode::Parallel { threads: Some(2) },
                ..c
            }),
            DetectorConfig::LstmAd(c) => DetectorConfig::LstmAd(c),
        };

        let mut a = config.detector.build().unwrap();
        let mut b = parallel.build().unwrap();
        a.train(&data, &options).unwrap();
        b.train(&data, &options).unwrap();
        assert_eq!(a.predict(&data).unwrap(), b.predict(&data).unwrap());
    }
}

#[test]
fn test_invalid_config_rejected_at_build() {
    let config = pipeline(
        r#"
        [detector]
        kind = "lstm_ad"
        l_predictions = 0
    "#,
    );
    assert!(matches!(config.build_detector(), Err(Error::InvalidConfig(_))));
}
