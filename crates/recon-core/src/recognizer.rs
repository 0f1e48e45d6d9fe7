//! OpenFace face embedder via ONNX Runtime.
//!
//! Extracts 128-dimensional embeddings from 96x96 face crops using the
//! nn4.small2.v1 OpenFace model.

use crate::types::{Embedding, FaceCrop, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Crop edge length expected by the embedder.
pub const OPENFACE_INPUT_SIZE: usize = 96;
const OPENFACE_MODEL_VERSION: &str = "nn4.small2.v1";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; place the OpenFace ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is {actual}x{actual}, embedder expects {expected}x{expected}")]
    BadCropSize { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: normalized face crop in, embedding out.
///
/// Implementations must be deterministic: the same crop always yields
/// the same vector.
pub trait Embedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, RecognizerError>;
}

/// OpenFace-based face embedder.
pub struct OpenFaceEmbedder {
    session: Session,
}

impl OpenFaceEmbedder {
    /// Load the OpenFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded OpenFace embedder"
        );

        Ok(Self { session })
    }

    /// Convert a HWC RGB crop in [0, 1] into a NCHW float tensor.
    fn preprocess(crop: &FaceCrop) -> Result<Array4<f32>, RecognizerError> {
        let size = OPENFACE_INPUT_SIZE;
        if crop.size() != size || crop.values.len() != size * size * 3 {
            return Err(RecognizerError::BadCropSize {
                expected: size,
                actual: crop.size(),
            });
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * 3;
                tensor[[0, 0, y, x]] = crop.values[base];
                tensor[[0, 1, y, x]] = crop.values[base + 1];
                tensor[[0, 2, y, x]] = crop.values[base + 2];
            }
        }

        Ok(tensor)
    }
}

impl Embedder for OpenFaceEmbedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, RecognizerError> {
        let input = Self::preprocess(crop)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        // Distances are calibrated on the raw output; do not re-normalize.
        Ok(Embedding {
            values: raw_data.to_vec(),
            model_version: Some(OPENFACE_MODEL_VERSION.to_string()),
        })
    }
}
