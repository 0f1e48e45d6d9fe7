use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the embeddings produced by the OpenFace embedder.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// A captured color camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            sequence: 0,
            timestamp: std::time::Instant::now(),
        }
    }

    /// Wrap a decoded RGB image (e.g. a registration photo) as a frame.
    pub fn from_rgb_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// True when the frame carries no usable pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.data.len() < self.width as usize * self.height as usize * 3
    }

    /// Flip the frame horizontally in place (selfie-style preview).
    pub fn mirror(&mut self) {
        if self.is_empty() {
            return;
        }
        let w = self.width as usize;
        for row in self.data.chunks_exact_mut(w * 3).take(self.height as usize) {
            for x in 0..w / 2 {
                let (a, b) = (x * 3, (w - 1 - x) * 3);
                for c in 0..3 {
                    row.swap(a + c, b + c);
                }
            }
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// A face crop resized to the embedder input size.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    /// 8-bit RGB crop, kept for saving companion images.
    pub image: image::RgbImage,
    /// HWC RGB intensities scaled to [0, 1].
    pub values: Vec<f32>,
}

impl FaceCrop {
    pub fn from_image(image: image::RgbImage) -> Self {
        let values = image.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        Self { image, values }
    }

    /// Crop edge length in pixels (crops are square).
    pub fn size(&self) -> usize {
        self.image.width() as usize
    }
}

/// Face embedding vector (128-dimensional for OpenFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "nn4.small2.v1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Euclidean distance over the raw embedding space.
    ///
    /// Embeddings of different lengths are never comparable and report
    /// an infinite distance.
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

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Unit-length copy of this embedding (zero vectors are returned unchanged).
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values, model_version: self.model_version.clone() }
    }

    /// Empty vectors and NaN/infinite components cannot be stored.
    pub fn is_valid(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }
}

/// Stable reference to a gallery identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRef {
    pub id: Uuid,
    pub name: String,
}

/// Outcome of matching one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Index of the face within its frame.
    pub face_index: usize,
    /// Nearest identity, whether or not it was accepted.
    pub candidate: Option<IdentityRef>,
    /// Best-of-N Euclidean distance to the candidate (infinite for an empty gallery).
    pub distance: f32,
    pub accepted: bool,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            face_index: 0,
            candidate: None,
            distance: f32::INFINITY,
            accepted: false,
        }
    }

    pub fn with_face_index(mut self, face_index: usize) -> Self {
        self.face_index = face_index;
        self
    }

    /// The matched identity, only when accepted.
    pub fn identity(&self) -> Option<&IdentityRef> {
        if self.accepted {
            self.candidate.as_ref()
        } else {
            None
        }
    }
}

/// One recognized (or unknown) face, dispatched to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionEvent {
    /// `None` means "unknown".
    pub identity: Option<IdentityRef>,
    pub face: FaceBox,
    /// Distance to the nearest identity, when one was computed.
    pub distance: Option<f32>,
    pub timestamp: DateTime<Utc>,
    /// Whether this event advanced the identity's sighting counter.
    pub state_updated: bool,
    pub frame_sequence: u32,
}

impl RecognitionEvent {
    pub fn unknown(face: FaceBox, timestamp: DateTime<Utc>, frame_sequence: u32) -> Self {
        Self {
            identity: None,
            face,
            distance: None,
            timestamp,
            state_updated: false,
            frame_sequence,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.identity.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_self_is_zero() {
        let a = Embedding::new(vec![0.3, -1.2, 4.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_length_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!(a.euclidean_distance(&b).is_infinite());
    }

    #[test]
    fn test_normalized_unit_length() {
        let a = Embedding::new(vec![3.0, 4.0]);
        assert!((a.normalized().norm() - 1.0).abs() < 1e-6);
        let zero = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(zero.normalized().values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_embedding_validity() {
        assert!(Embedding::new(vec![0.1]).is_valid());
        assert!(!Embedding::new(vec![]).is_valid());
        assert!(!Embedding::new(vec![f32::NAN]).is_valid());
    }

    #[test]
    fn test_frame_empty() {
        assert!(Frame::new(vec![], 0, 0).is_empty());
        assert!(Frame::new(vec![0; 5], 2, 1).is_empty());
        assert!(!Frame::new(vec![0; 6], 2, 1).is_empty());
    }

    #[test]
    fn test_frame_mirror() {
        // 3x1 frame: red, green, blue
        let mut frame = Frame::new(vec![255, 0, 0, 0, 255, 0, 0, 0, 255], 3, 1);
        frame.mirror();
        assert_eq!(frame.data, vec![0, 0, 255, 0, 255, 0, 255, 0, 0]);
    }

    #[test]
    fn test_face_crop_scaling() {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 51]));
        let crop = FaceCrop::from_image(image);
        assert_eq!(crop.size(), 2);
        assert_eq!(crop.values.len(), 12);
        assert!((crop.values[0] - 1.0).abs() < 1e-6);
        assert_eq!(crop.values[1], 0.0);
        assert!((crop.values[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_match_result_identity_only_when_accepted() {
        let candidate = IdentityRef { id: Uuid::new_v4(), name: "alice".into() };
        let rejected = MatchResult {
            face_index: 0,
            candidate: Some(candidate.clone()),
            distance: 0.9,
            accepted: false,
        };
        assert!(rejected.identity().is_none());
        let accepted = MatchResult { accepted: true, ..rejected };
        assert_eq!(accepted.identity(), Some(&candidate));
    }
}
