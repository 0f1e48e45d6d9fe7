//! Recognition loop: extractor → embedder → matcher → tracker, one event per face.

use crate::detector::DetectorError;
use crate::extractor::{FaceExtractor, DEFAULT_DETECTION_CONFIDENCE};
use crate::mailbox::FrameSlot;
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::models::FaceModels;
use crate::recognizer::RecognizerError;
use crate::tracker::IdentityTracker;
use crate::types::{Embedding, FaceBox, FaceCrop, Frame, RecognitionEvent};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunables read by the loop on every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    pub detection_confidence: f32,
    pub match_threshold: f32,
    /// Process every Nth consumed frame; 0 and 1 both mean every frame.
    pub frame_stride: u32,
    /// Minimum time between sighting-counter updates per identity.
    pub debounce: Duration,
    /// Time without a match before an identity is no longer visible.
    pub inactivity: Duration,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            frame_stride: 1,
            debounce: Duration::ZERO,
            inactivity: Duration::from_secs(3),
        }
    }
}

/// Configuration snapshot shared between the settings layer and the loop.
pub type SharedConfig = Arc<ArcSwap<RecognitionConfig>>;

pub fn shared_config(config: RecognitionConfig) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Health of the pipeline as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum LoopStatus {
    Starting,
    Running,
    CameraUnavailable(String),
    ModelUnavailable(String),
    Stopped,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Starting => write!(f, "starting"),
            LoopStatus::Running => write!(f, "running"),
            LoopStatus::CameraUnavailable(reason) => write!(f, "camera unavailable: {reason}"),
            LoopStatus::ModelUnavailable(reason) => write!(f, "model unavailable: {reason}"),
            LoopStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] RecognizerError),
    #[error("no face detected")]
    NoFaceDetected,
}

/// A face picked out of a registration image, ready to be stored.
#[derive(Debug, Clone)]
pub struct RegistrationSample {
    pub face: FaceBox,
    pub crop: FaceCrop,
    pub embedding: Embedding,
}

/// Owns the models and drives frames through the recognition stages.
pub struct RecognitionLoop<M: Matcher = EuclideanMatcher> {
    models: FaceModels,
    matcher: M,
    tracker: Arc<IdentityTracker>,
    frames_seen: u64,
}

impl RecognitionLoop<EuclideanMatcher> {
    pub fn new(models: FaceModels, tracker: Arc<IdentityTracker>) -> Self {
        Self::with_matcher(models, EuclideanMatcher, tracker)
    }
}

impl<M: Matcher> RecognitionLoop<M> {
    pub fn with_matcher(models: FaceModels, matcher: M, tracker: Arc<IdentityTracker>) -> Self {
        Self {
            models,
            matcher,
            tracker,
            frames_seen: 0,
        }
    }

    pub fn tracker(&self) -> &Arc<IdentityTracker> {
        &self.tracker
    }

    /// Frames handed to [`consume`](Self::consume) so far, processed or skipped.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Wait up to `timeout` for the latest frame and consume it.
    ///
    /// `None` when no frame arrived or the frame was skipped by the stride.
    pub fn poll(&mut self, slot: &FrameSlot, timeout: Duration) -> Option<Vec<RecognitionEvent>> {
        let frame = slot.wait_take(timeout)?;
        self.consume(&frame)
    }

    /// Count a frame against the stride and process it if it is due.
    ///
    /// The first frame is always processed, then every Nth after it.
    pub fn consume(&mut self, frame: &Frame) -> Option<Vec<RecognitionEvent>> {
        let stride = u64::from(self.tracker.config().load().frame_stride.max(1));
        let due = self.frames_seen % stride == 0;
        self.frames_seen += 1;
        if !due {
            return None;
        }
        Some(self.process_frame(frame))
    }

    pub fn process_frame(&mut self, frame: &Frame) -> Vec<RecognitionEvent> {
        self.process_frame_at(frame, Utc::now())
    }

    /// Run one frame through every stage, stamping events with `now`.
    ///
    /// A detector failure drops the frame; an embedder failure turns that
    /// face into an unknown event and the remaining faces still run.
    pub fn process_frame_at(&mut self, frame: &Frame, now: DateTime<Utc>) -> Vec<RecognitionEvent> {
        let config = self.tracker.config().load_full();
        let extractor = FaceExtractor::new(config.detection_confidence);

        let faces = match extractor.extract(&mut self.models, frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detection failed; dropping frame");
                return Vec::new();
            }
        };

        let gallery = self.tracker.store().snapshot();
        let mut events = Vec::with_capacity(faces.len());

        for (index, (face, crop)) in faces.enumerate() {
            let embedding = match self.models.embed(&crop) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(seq = frame.sequence, face = index, error = %e, "embedding failed");
                    events.push(RecognitionEvent::unknown(face, now, frame.sequence));
                    continue;
                }
            };

            let result = self
                .matcher
                .compare(&embedding, &gallery, config.match_threshold)
                .with_face_index(index);
            let distance = result.distance.is_finite().then_some(result.distance);

            let Some(identity) = result.identity().cloned() else {
                events.push(RecognitionEvent {
                    distance,
                    ..RecognitionEvent::unknown(face, now, frame.sequence)
                });
                continue;
            };

            let state_updated = match self.tracker.on_accepted_match(&identity.name, now) {
                Ok(updated) => updated,
                Err(e) => {
                    tracing::warn!(name = %identity.name, error = %e, "failed to record sighting");
                    false
                }
            };
            if state_updated {
                tracing::info!(
                    name = %identity.name,
                    distance = result.distance,
                    face = index,
                    "identity recognized"
                );
            }

            events.push(RecognitionEvent {
                identity: Some(identity),
                face,
                distance,
                timestamp: now,
                state_updated,
                frame_sequence: frame.sequence,
            });
        }

        events
    }

    /// Detect the most confident face in a registration image and embed it.
    pub fn embed_best_face(&mut self, frame: &Frame) -> Result<RegistrationSample, PipelineError> {
        let confidence = self.tracker.config().load().detection_confidence;
        let (face, crop) = FaceExtractor::new(confidence)
            .extract_best(&mut self.models, frame)?
            .ok_or(PipelineError::NoFaceDetected)?;
        let embedding = self.models.embed(&crop)?;
        tracing::debug!(confidence = face.confidence, "registration face embedded");
        Ok(RegistrationSample { face, crop, embedding })
    }
}
