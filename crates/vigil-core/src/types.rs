use serde::{Deserialize, Serialize};

/// Axis-aligned face or body box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Box covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Integer pixel rectangle `(x0, y0, x1, y1)` grown by `padding` on every
    /// side and clipped to the frame. Empty when the box lies outside it.
    pub fn padded_pixels(&self, padding: u32, frame_w: u32, frame_h: u32) -> (u32, u32, u32, u32) {
        let pad = padding as f32;
        let clip = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let x0 = clip(self.x - pad, frame_w);
        let y0 = clip(self.y - pad, frame_h);
        let x1 = clip(self.x + self.width + pad, frame_w);
        let y1 = clip(self.y + self.height + pad, frame_h);
        (x0, y0, x1.max(x0), y1.max(y0))
    }
}

/// Face embedding vector. Compared by Euclidean distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance. Embeddings of different dimension are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise mean. `None` for an empty slice or mixed dimensions.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let dim = first.dim();
        if embeddings.iter().any(|e| e.dim() != dim) {
            return None;
        }

        let mut sum = vec![0.0f32; dim];
        for e in embeddings {
            for (acc, v) in sum.iter_mut().zip(&e.values) {
                *acc += v;
            }
        }
        let n = embeddings.len() as f32;
        Some(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
    }
}

/// Output of the landmark/pose estimator for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMeasurements {
    /// Eye aspect ratio, averaged over both eyes.
    pub ear: f32,
    /// Mouth aspect ratio.
    pub mar: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
    /// Landmarks in the 68-point iBUG layout, frame coordinates. May be empty.
    #[serde(default)]
    pub landmarks: Vec<(f32, f32)>,
}

const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;

impl FaceMeasurements {
    /// True when EAR, MAR and all pose angles are finite numbers.
    pub fn is_finite(&self) -> bool {
        [self.ear, self.mar, self.pitch, self.yaw, self.roll]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Centers of the left and right eye, if the 68-point landmarks are present.
    pub fn eye_centers(&self) -> Option<((f32, f32), (f32, f32))> {
        if self.landmarks.len() < RIGHT_EYE.end {
            return None;
        }
        let center = |range: std::ops::Range<usize>| {
            let pts = &self.landmarks[range];
            let n = pts.len() as f32;
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        Some((center(LEFT_EYE), center(RIGHT_EYE)))
    }
}

/// One analyzed frame of the tracked subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSample {
    /// Seconds since the Unix epoch at capture time.
    pub timestamp: f64,
    pub ear: f32,
    pub mar: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl FeatureSample {
    pub fn from_measurements(timestamp: f64, m: &FaceMeasurements) -> Self {
        Self {
            timestamp,
            ear: m.ear,
            mar: m.mar,
            pitch: m.pitch,
            yaw: m.yaw,
            roll: m.roll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), f32::INFINITY);
    }

    #[test]
    fn test_mean_embedding() {
        let m = Embedding::mean(&[
            Embedding::new(vec![1.0, 0.0]),
            Embedding::new(vec![3.0, 2.0]),
        ])
        .unwrap();
        assert_eq!(m.values, vec![2.0, 1.0]);
    }

    #[test]
    fn test_mean_rejects_empty_and_mixed() {
        assert!(Embedding::mean(&[]).is_none());
        assert!(Embedding::mean(&[Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])]).is_none());
    }

    #[test]
    fn test_padded_pixels_clips_to_frame() {
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(b.padded_pixels(20, 100, 100), (0, 0, 35, 35));
        let outside = BoundingBox::new(200.0, 200.0, 10.0, 10.0);
        let (x0, y0, x1, y1) = outside.padded_pixels(0, 100, 100);
        assert_eq!((x1 - x0) * (y1 - y0), 0);
    }

    #[test]
    fn test_eye_centers() {
        let mut landmarks = vec![(0.0, 0.0); 68];
        for p in &mut landmarks[36..42] {
            *p = (10.0, 20.0);
        }
        for p in &mut landmarks[42..48] {
            *p = (30.0, 20.0);
        }
        let m = FaceMeasurements { ear: 0.3, mar: 0.1, pitch: 0.0, yaw: 0.0, roll: 0.0, landmarks };
        assert_eq!(m.eye_centers(), Some(((10.0, 20.0), (30.0, 20.0))));

        let sparse = FaceMeasurements { landmarks: vec![(1.0, 1.0); 5], ..m };
        assert!(sparse.eye_centers().is_none());
    }

    #[test]
    fn test_measurements_finite() {
        let m = FaceMeasurements { ear: 0.3, mar: 0.1, pitch: 0.0, yaw: 0.0, roll: 0.0, landmarks: Vec::new() };
        assert!(m.is_finite());
        assert!(!FaceMeasurements { ear: f32::NAN, ..m.clone() }.is_finite());
        assert!(!FaceMeasurements { yaw: f32::INFINITY, ..m }.is_finite());
    }
}
