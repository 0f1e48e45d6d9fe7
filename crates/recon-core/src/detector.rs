//! Res10 SSD face detector via ONNX Runtime.
//!
//! The detector consumes a 300x300 BGR blob with per-channel mean
//! subtraction and emits `[1, 1, N, 7]` rows of
//! `(image_id, label, confidence, x1, y1, x2, y2)` with coordinates
//! normalized to [0, 1].

use crate::types::{FaceBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SSD_INPUT_SIZE: usize = 300;
/// Channel means in BGR order, matching the Caffe training blob.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
const SSD_ROW_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the res10 SSD ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: frame in, raw face boxes with confidences out.
///
/// Boxes are returned in detector output order, unfiltered; thresholding
/// and clipping belong to the face extractor.
pub trait Detector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError>;
}

/// SSD (ResNet-10 backbone) face detector.
pub struct SsdFaceDetector {
    session: Session,
}

impl SsdFaceDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SSD face detector"
        );

        Ok(Self { session })
    }
}

impl Detector for SsdFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let input = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;

        if raw.len() % SSD_ROW_LEN != 0 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection tensor length {} is not a multiple of {SSD_ROW_LEN}",
                raw.len()
            )));
        }

        Ok(decode_detections(raw, frame.width, frame.height))
    }
}

/// Resize an RGB frame to the SSD input with bilinear interpolation and
/// build a BGR NCHW tensor with mean subtraction (scale 1.0).
fn preprocess(frame: &Frame) -> Array4<f32> {
    let size = SSD_INPUT_SIZE;
    let width = frame.width as usize;
    let height = frame.height as usize;
    let scale_x = width as f32 / size as f32;
    let scale_y = height as f32 / size as f32;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..size {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for rgb in 0..3 {
                let px = |xx: usize, yy: usize| frame.data[(yy * width + xx) * 3 + rgb] as f32;
                let val = px(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + px(x1, y0) * fx * (1.0 - fy)
                    + px(x0, y1) * (1.0 - fx) * fy
                    + px(x1, y1) * fx * fy;

                // RGB → BGR channel slot
                let bgr = 2 - rgb;
                tensor[[0, bgr, y, x]] = val - SSD_MEAN_BGR[bgr];
            }
        }
    }

    tensor
}

/// Decode SSD output rows into frame-space boxes.
///
/// Rows with non-positive confidence or degenerate geometry are dropped.
fn decode_detections(raw: &[f32], width: u32, height: u32) -> Vec<FaceBox> {
    let (w, h) = (width as f32, height as f32);

    raw.chunks_exact(SSD_ROW_LEN)
        .filter_map(|row| {
            let confidence = row[2];
            if !(confidence > 0.0) {
                return None;
            }
            let x1 = row[3] * w;
            let y1 = row[4] * h;
            let x2 = row[5] * w;
            let y2 = row[6] * h;
            if !(x2 > x1 && y2 > y1) {
                return None;
            }
            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: confidence.min(1.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let frame = Frame::new(vec![128u8; 64 * 48 * 3], 64, 48);
        let tensor = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, SSD_INPUT_SIZE, SSD_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_mean_subtraction_bgr() {
        // Uniform RGB (10, 20, 30) → B=30-104, G=20-177, R=10-123
        let frame = Frame::new([10u8, 20, 30].repeat(32 * 32), 32, 32);
        let tensor = preprocess(&frame);
        assert!((tensor[[0, 0, 5, 5]] - (30.0 - 104.0)).abs() < 1e-3);
        assert!((tensor[[0, 1, 5, 5]] - (20.0 - 177.0)).abs() < 1e-3);
        assert!((tensor[[0, 2, 5, 5]] - (10.0 - 123.0)).abs() < 1e-3);
    }

    #[test]
    fn test_decode_scales_to_frame() {
        let raw = [0.0, 1.0, 0.9, 0.25, 0.5, 0.75, 1.0];
        let boxes = decode_detections(&raw, 400, 200);
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert!((b.x - 100.0).abs() < 1e-4);
        assert!((b.y - 100.0).abs() < 1e-4);
        assert!((b.width - 200.0).abs() < 1e-4);
        assert!((b.height - 100.0).abs() < 1e-4);
        assert!((b.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_keeps_output_order_and_drops_empty_rows() {
        let raw = [
            0.0, 1.0, 0.3, 0.6, 0.1, 0.9, 0.4, // low-confidence face on the right
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, // padding row
            0.0, 1.0, 0.8, 0.1, 0.1, 0.3, 0.4, // face on the left
            0.0, 1.0, 0.7, 0.5, 0.5, 0.5, 0.6, // zero width
        ];
        let boxes = decode_detections(&raw, 100, 100);
        assert_eq!(boxes.len(), 2);
        assert!((boxes[0].confidence - 0.3).abs() < 1e-6);
        assert!((boxes[1].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = SsdFaceDetector::load("/nonexistent/res10.onnx").err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
