//! Test-time driver for Fast R-CNN / FPN detectors: checkpoint adaptation and
//! validation, max-shape binding and dataset evaluation.

pub mod adapt;
pub mod coco;
pub mod coco_labels;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod imdb;
pub mod loader;
pub mod network;
pub mod params;
pub mod postprocess;
pub mod session;
pub mod shapes;
pub mod stats;
pub mod tester;
pub mod validate;
pub mod vis;

pub use error::{Error, Result};
