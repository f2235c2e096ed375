pub mod autoencoder;
pub mod base_model;
pub mod donut;
pub mod error_distribution;
pub mod lstm_ad;
pub mod vae;
