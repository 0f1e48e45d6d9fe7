//! Embedding model adapter: the detector and embedder pair the pipeline runs on.

use crate::detector::{Detector, DetectorError, SsdFaceDetector};
use crate::recognizer::{Embedder, OpenFaceEmbedder, RecognizerError};
use crate::types::{Embedding, FaceBox, FaceCrop, Frame};
use std::path::Path;
use thiserror::Error;

/// File name of the res10 SSD detector inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "res10_300x300_ssd_iter_140000.onnx";
/// File name of the OpenFace embedder inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "openface_nn4.small2.v1.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    /// Fatal at startup: the recognition loop must not run without both models.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

impl From<DetectorError> for ModelError {
    fn from(e: DetectorError) -> Self {
        ModelError::ModelUnavailable(format!("detector: {e}"))
    }
}

impl From<RecognizerError> for ModelError {
    fn from(e: RecognizerError) -> Self {
        ModelError::ModelUnavailable(format!("embedder: {e}"))
    }
}

/// A loaded detector + embedder, behind capability traits.
pub struct FaceModels {
    detector: Box<dyn Detector + Send>,
    embedder: Box<dyn Embedder + Send>,
}

impl FaceModels {
    /// Wrap arbitrary backends (used by tests to inject synthetic models).
    pub fn new(detector: Box<dyn Detector + Send>, embedder: Box<dyn Embedder + Send>) -> Self {
        Self { detector, embedder }
    }

    /// Load the ONNX detector and embedder from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let detector_path = model_dir.join(DETECTOR_MODEL_FILE);
        let embedder_path = model_dir.join(EMBEDDER_MODEL_FILE);

        let detector = SsdFaceDetector::load(&detector_path.to_string_lossy())?;
        let embedder = OpenFaceEmbedder::load(&embedder_path.to_string_lossy())?;

        Ok(Self::new(Box::new(detector), Box::new(embedder)))
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        self.detector.detect(frame)
    }

    pub fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, RecognizerError> {
        self.embedder.embed(crop)
    }
}
