pub mod config;
pub mod spectrum;
pub mod streaming;

pub use config::{AcquisitionConfig, AppConfig, TransformConfig};
