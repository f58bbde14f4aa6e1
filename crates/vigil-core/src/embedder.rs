//! ArcFace embedding extractor via ONNX Runtime.

use crate::frame::Frame;
use crate::preprocess::resize_bilinear;
use crate::types::{BoundingBox, Embedding};
use crate::vision::{EmbeddingExtractor, VisionError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding extractor.
///
/// The face box is cropped and resized straight to the model input; callers
/// that want lighting and eye alignment run [`FacePreprocessor`] first and
/// pass the whole prepared crop.
///
/// [`FacePreprocessor`]: crate::preprocess::FacePreprocessor
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize a grayscale face crop into a replicated-channel NCHW tensor.
    fn to_tensor(face: &[u8], width: u32, height: u32) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let pixels = resize_bilinear(face, width, height, size as u32, size as u32);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let v = (pixels[y * size + x] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = v;
                }
            }
        }
        tensor
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.into_iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, VisionError> {
        let crop = frame.crop(face, 0).ok_or(VisionError::EmptyRegion)?;
        let input = Self::to_tensor(&crop.data, crop.width, crop.height);

        let view = TensorRef::from_array_view(input.view())
            .map_err(|e| VisionError::Inference(format!("input tensor: {e}")))?;
        let outputs = self
            .session
            .run(ort::inputs![view])
            .map_err(|e| VisionError::Inference(e.to_string()))?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(VisionError::Inference(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_and_channels() {
        let face = vec![200u8; 30 * 40];
        let t = OnnxEmbedder::to_tensor(&face, 30, 40);
        assert_eq!(t.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
        let expected = (200.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((t[[0, 0, 5, 5]] - expected).abs() < 1e-6);
        assert_eq!(t[[0, 0, 9, 9]], t[[0, 2, 9, 9]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/w600k_r50.onnx"));
        assert!(matches!(err, Err(EmbedderError::ModelNotFound(_))));
    }
}
