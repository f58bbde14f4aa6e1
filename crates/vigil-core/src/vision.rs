//! Contracts for the detectors and estimators the pipeline calls into.
//!
//! The models behind these traits live outside the core; the pipeline only
//! sees frames in and boxes, measurements, embeddings and confidences out.

use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding, FaceMeasurements};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("no landmarks found in face region")]
    NoLandmarks,
    #[error("face region is empty or outside the frame")]
    EmptyRegion,
    #[error("estimator returned a non-finite measurement")]
    NonFinite,
}

/// Upper-body / person presence detector.
pub trait BodyDetector {
    fn detect(&mut self, frame: &Frame) -> Result<bool, VisionError>;
}

/// Face box detector.
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError>;
}

/// Landmark and head-pose estimator for a single face.
pub trait LandmarkEstimator {
    fn analyze(&mut self, frame: &Frame, face: &BoundingBox) -> Result<FaceMeasurements, VisionError>;
}

/// Identity embedding extractor for a single face.
pub trait EmbeddingExtractor {
    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, VisionError>;
}

/// Frame-to-frame visual tracker following one box.
pub trait CorrelationTracker {
    fn start(&mut self, frame: &Frame, bbox: &BoundingBox);
    /// Advance against `frame`, returning the tracker's native confidence score.
    fn update(&mut self, frame: &Frame) -> f32;
    fn position(&self) -> BoundingBox;
}

/// Creates fresh correlation trackers.
pub trait TrackerFactory {
    fn create(&self) -> Box<dyn CorrelationTracker>;
}

impl<F> TrackerFactory for F
where
    F: Fn() -> Box<dyn CorrelationTracker>,
{
    fn create(&self) -> Box<dyn CorrelationTracker> {
        self()
    }
}

/// The detector set driven by the stage controller.
pub struct Vision {
    pub body: Box<dyn BodyDetector>,
    pub faces: Box<dyn FaceDetector>,
    pub landmarks: Box<dyn LandmarkEstimator>,
    pub embedder: Box<dyn EmbeddingExtractor>,
}
