//! recon-core: Face recognition core.
//!
//! Detects faces with a res10 SSD model and embeds them with OpenFace, both
//! through ONNX Runtime, then matches embeddings against an on-disk gallery
//! of registered identities and tracks per-identity sightings.

pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod mailbox;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod profile;
pub mod recognizer;
pub mod tracker;
pub mod types;

pub use extractor::FaceExtractor;
pub use gallery::{Gallery, GalleryError, GalleryStore, Identity};
pub use mailbox::{FrameSlot, LatestSlot};
pub use matcher::{EuclideanMatcher, Matcher};
pub use models::{FaceModels, ModelError};
pub use pipeline::{
    shared_config, LoopStatus, PipelineError, RecognitionConfig, RecognitionLoop, SharedConfig,
};
pub use profile::{Profile, Tag, TagCatalog};
pub use tracker::{IdentityTracker, Presence};
pub use types::{Embedding, FaceBox, FaceCrop, Frame, IdentityRef, MatchResult, RecognitionEvent};
