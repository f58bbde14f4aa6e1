//! vigil-core — Perception pipeline core.
//!
//! Drives a three-stage controller over a video stream: find a subject,
//! identify their face against a registry, then follow it with cheap
//! correlation trackers while a feature window is periodically handed to
//! an out-of-process analysis job through the filesystem.

pub mod config;
pub mod dispatch;
pub mod embedder;
pub mod frame;
pub mod pipeline;
pub mod preprocess;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod vision;
pub mod window;

pub use config::VigilConfig;
pub use frame::{Frame, FrameSource};
pub use pipeline::{Pipeline, Stage};
pub use registry::{IdentityRegistry, MatchResult};
pub use types::{BoundingBox, Embedding, FaceMeasurements, FeatureSample};
