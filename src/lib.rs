//! Image captioning demo: a BLIP model behind a web form, with every
//! invocation tracked as an experiment run.
//!
//! The [`engine`] owns the model on a background thread, [`captioner`] wraps
//! each inference in a [`tracking`] run, and [`server`] exposes it over HTTP.

pub mod blip;
pub mod captioner;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod messages;
pub mod server;
pub mod tracking;

pub use captioner::{Caption, CaptionBackend, CaptionRequest, Captioner, log_model_snapshot};
pub use engine::{EngineState, InferenceEngine, InferenceModel, InferenceResponse, RequestMetadata};
pub use error::{CaptionError, EngineError, TrackingError};
pub use input::{ImageInput, RgbImage, decode_image};
pub use tracking::{ActiveRun, RunStatus, Tracker, TrackingStore};

/// Prefix of every failure message shown to a user.
pub const ERROR_MARKER: &str = "Error occurred: ";
