//! Face extractor: frame → confident, clipped face boxes with embedder-ready crops.

use crate::detector::DetectorError;
use crate::models::FaceModels;
use crate::recognizer::OPENFACE_INPUT_SIZE;
use crate::types::{FaceBox, FaceCrop, Frame};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};

pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

/// Turns raw frames into face crops using the injected detector.
#[derive(Debug, Clone, Copy)]
pub struct FaceExtractor {
    min_confidence: f32,
    crop_size: u32,
}

impl Default for FaceExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_DETECTION_CONFIDENCE)
    }
}

impl FaceExtractor {
    pub fn new(min_confidence: f32) -> Self {
        Self {
            min_confidence,
            crop_size: OPENFACE_INPUT_SIZE as u32,
        }
    }

    /// Detect faces in `frame` and return a lazy sequence of `(FaceBox, FaceCrop)`.
    ///
    /// Boxes below the confidence threshold or empty after clipping are
    /// dropped. Order follows detector output, not frame geometry. An empty
    /// frame yields an empty sequence without invoking the detector.
    pub fn extract<'a>(
        &self,
        models: &mut FaceModels,
        frame: &'a Frame,
    ) -> Result<Extraction<'a>, DetectorError> {
        if frame.is_empty() {
            return Ok(Extraction::empty(frame, self.crop_size));
        }

        let boxes: Vec<FaceBox> = models
            .detect(frame)?
            .into_iter()
            .filter(|b| b.confidence >= self.min_confidence)
            .filter_map(|b| clip_to_frame(&b, frame.width, frame.height))
            .collect();

        tracing::trace!(faces = boxes.len(), seq = frame.sequence, "extracted faces");

        Ok(Extraction {
            frame,
            boxes: boxes.into_iter(),
            crop_size: self.crop_size,
        })
    }

    /// The single most confident face, as used when enrolling from a photo.
    pub fn extract_best(
        &self,
        models: &mut FaceModels,
        frame: &Frame,
    ) -> Result<Option<(FaceBox, FaceCrop)>, DetectorError> {
        let mut best: Option<(FaceBox, FaceCrop)> = None;
        for (face, crop) in self.extract(models, frame)? {
            if best.as_ref().map_or(true, |(b, _)| face.confidence > b.confidence) {
                best = Some((face, crop));
            }
        }
        Ok(best)
    }
}

/// Lazy, finite, non-restartable sequence of extracted faces.
///
/// Detection has already run; cropping and resizing happen as items are pulled.
pub struct Extraction<'a> {
    frame: &'a Frame,
    boxes: std::vec::IntoIter<FaceBox>,
    crop_size: u32,
}

impl<'a> Extraction<'a> {
    fn empty(frame: &'a Frame, crop_size: u32) -> Self {
        Self {
            frame,
            boxes: Vec::new().into_iter(),
            crop_size,
        }
    }
}

impl Iterator for Extraction<'_> {
    type Item = (FaceBox, FaceCrop);

    fn next(&mut self) -> Option<Self::Item> {
        let face = self.boxes.next()?;
        let crop = crop_face(self.frame, &face, self.crop_size);
        Some((face, crop))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.boxes.size_hint()
    }
}

impl ExactSizeIterator for Extraction<'_> {}

/// Clip a box to integer pixel bounds within the frame; `None` if nothing remains.
fn clip_to_frame(face: &FaceBox, width: u32, height: u32) -> Option<FaceBox> {
    let x1 = face.x.max(0.0).floor();
    let y1 = face.y.max(0.0).floor();
    let x2 = (face.x + face.width).min(width as f32).ceil().min(width as f32);
    let y2 = (face.y + face.height).min(height as f32).ceil().min(height as f32);

    if !(x2 > x1 && y2 > y1) {
        return None;
    }

    Some(FaceBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        confidence: face.confidence,
    })
}

/// Crop a clipped box out of the frame and resize it to `size`x`size`.
fn crop_face(frame: &Frame, face: &FaceBox, size: u32) -> FaceCrop {
    let resized = match ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(
        frame.width,
        frame.height,
        &frame.data[..frame.width as usize * frame.height as usize * 3],
    ) {
        Some(view) => {
            let region = imageops::crop_imm(
                &view,
                face.x as u32,
                face.y as u32,
                face.width as u32,
                face.height as u32,
            );
            imageops::resize(&*region, size, size, FilterType::Triangle)
        }
        // Unreachable for non-empty frames; keep the face with a blank crop.
        None => image::RgbImage::new(size, size),
    };

    FaceCrop::from_image(resized)
}
