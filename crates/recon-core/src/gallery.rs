//! Gallery store: flat per-identity records on disk, published as immutable snapshots.
//!
//! Layout under the data root:
//!
//! ```text
//! <root>/<name>/profile.json      profile record
//! <root>/<name>/embeddings.json   reference embeddings
//! <root>/<name>/<name>_<n>.png    companion face crops (optional)
//! ```
//!
//! Readers take a [`Gallery`] snapshot and keep it for the duration of a
//! query; writers build a new gallery and swap it in whole.

use crate::profile::{Profile, TagCatalog};
use crate::types::{Embedding, IdentityRef, EMBEDDING_DIM};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const PROFILE_FILE: &str = "profile.json";
const EMBEDDINGS_FILE: &str = "embeddings.json";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("corrupt record {name}: {reason}")]
    CorruptRecord { name: String, reason: String },
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GalleryError + '_ {
    move |source| GalleryError::Io { path: path.to_path_buf(), source }
}

/// One reference embedding, optionally tied to its companion image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub embedding: Embedding,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddingsFile {
    references: Vec<ReferenceEmbedding>,
}

/// A registered person: profile plus reference embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub profile: Profile,
    pub references: Vec<ReferenceEmbedding>,
}

impl Identity {
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn identity_ref(&self) -> IdentityRef {
        IdentityRef {
            id: self.profile.id,
            name: self.profile.name.clone(),
        }
    }

    /// Best-of-N distance from `query` to this identity's references.
    ///
    /// `None` when the identity has no references.
    pub fn best_distance(&self, query: &Embedding) -> Option<f32> {
        self.references
            .iter()
            .map(|r| query.euclidean_distance(&r.embedding))
            .fold(None, |best: Option<f32>, d| match best {
                Some(b) if b <= d => Some(b),
                _ => Some(d),
            })
    }
}

/// Immutable set of identities consulted by the matcher.
///
/// Iteration order is stable: load order (sorted by name), then additions.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<Arc<Identity>>,
}

impl Gallery {
    /// Build a gallery; later entries with a duplicate name are dropped.
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        let mut gallery = Gallery::default();
        for identity in identities {
            if gallery.get(identity.name()).is_some() {
                tracing::warn!(name = identity.name(), "duplicate identity name; keeping first");
                continue;
            }
            gallery.identities.push(Arc::new(identity));
        }
        gallery
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter().map(|i| i.as_ref())
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.iter().find(|i| i.name() == name)
    }

    /// Copy of this gallery with `identity` replacing the same-named entry
    /// (in place, keeping order) or appended.
    fn with_identity(&self, identity: Identity) -> Gallery {
        let mut identities = self.identities.clone();
        match identities.iter().position(|i| i.name() == identity.name()) {
            Some(pos) => identities[pos] = Arc::new(identity),
            None => identities.push(Arc::new(identity)),
        }
        Gallery { identities }
    }
}

/// Owner of the persisted identity records and the published gallery snapshot.
pub struct GalleryStore {
    root: PathBuf,
    current: ArcSwap<Gallery>,
    catalog: ArcSwap<TagCatalog>,
    /// Required length of every stored reference embedding.
    dimension: usize,
    /// Serializes snapshot replacement (clone → modify → store).
    swap_lock: Mutex<()>,
    /// Per-identity locks serializing record writes for the same name.
    record_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GalleryStore {
    /// Open the store at `root` and load every readable record.
    pub fn open(root: impl Into<PathBuf>, catalog: TagCatalog) -> Result<Self, GalleryError> {
        let root = root.into();
        let gallery = Self::load(&root, &catalog)?;
        Ok(Self {
            root,
            current: ArcSwap::from_pointee(gallery),
            catalog: ArcSwap::from_pointee(catalog),
            dimension: EMBEDDING_DIM,
            swap_lock: Mutex::new(()),
            record_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Require references of `dimension` values instead of the embedder's default.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Read all identity records under `root` into a fresh gallery.
    ///
    /// Corrupt records are skipped with a warning. A missing root is an
    /// empty gallery; only an unreadable root is an error.
    pub fn load(root: &Path, catalog: &TagCatalog) -> Result<Gallery, GalleryError> {
        if !root.exists() {
            tracing::info!(root = %root.display(), "gallery root does not exist; starting empty");
            return Ok(Gallery::default());
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .map_err(io_err(root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut identities = Vec::with_capacity(dirs.len());
        let mut skipped = 0usize;

        for dir in &dirs {
            match load_record(dir) {
                Ok(identity) => {
                    for (field, value) in catalog.stale_tags(&identity.profile) {
                        tracing::warn!(
                            name = identity.name(),
                            field,
                            value,
                            "profile tag not in current settings; displaying with fallback color"
                        );
                    }
                    identities.push(identity);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping gallery record");
                }
            }
        }

        let gallery = Gallery::new(identities);
        tracing::info!(
            root = %root.display(),
            identities = gallery.len(),
            references = gallery.iter().map(|i| i.references.len()).sum::<usize>(),
            skipped,
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The currently published gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current.load_full()
    }

    pub fn catalog(&self) -> Arc<TagCatalog> {
        self.catalog.load_full()
    }

    /// Rebuild the gallery from disk with `catalog` and publish it wholesale.
    pub fn reload(&self, catalog: TagCatalog) -> Result<usize, GalleryError> {
        let _swap = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let gallery = Self::load(&self.root, &catalog)?;
        let count = gallery.len();
        self.catalog.store(Arc::new(catalog));
        self.current.store(Arc::new(gallery));
        Ok(count)
    }

    /// Append a reference embedding to `name`, creating the identity if needed.
    pub fn add_reference(
        &self,
        name: &str,
        embedding: Embedding,
    ) -> Result<IdentityRef, GalleryError> {
        self.add_reference_with_image(name, embedding, None)
    }

    /// Append a reference embedding and optionally store its face crop beside it.
    pub fn add_reference_with_image(
        &self,
        name: &str,
        embedding: Embedding,
        crop: Option<&image::RgbImage>,
    ) -> Result<IdentityRef, GalleryError> {
        validate_name(name)?;
        if !embedding.is_valid() {
            return Err(GalleryError::InvalidEmbedding(
                "embedding must be non-empty and finite".into(),
            ));
        }
        if embedding.values.len() != self.dimension {
            return Err(GalleryError::InvalidEmbedding(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                embedding.values.len()
            )));
        }

        let lock = self.record_lock(name);
        let _record = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut identity = self.current_or_disk(name)?;

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let source = match crop {
            Some(image) => {
                let file = next_image_name(&dir, name);
                image.save(dir.join(&file))?;
                Some(file)
            }
            None => None,
        };

        identity.references.push(ReferenceEmbedding { source, embedding });
        write_record(&dir, &identity)?;

        let identity_ref = identity.identity_ref();
        tracing::info!(
            name,
            references = identity.references.len(),
            "reference embedding added"
        );
        self.publish(identity);
        Ok(identity_ref)
    }

    /// Write (or replace) the profile for `profile.name`, keeping existing
    /// references and sighting history.
    pub fn save_profile(&self, mut profile: Profile) -> Result<IdentityRef, GalleryError> {
        let name = profile.name.clone();
        validate_name(&name)?;

        let lock = self.record_lock(&name);
        let _record = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut identity = self.current_or_disk(&name)?;
        if !identity.profile.id.is_nil() {
            profile.id = identity.profile.id;
        } else if profile.id.is_nil() {
            profile.id = uuid::Uuid::new_v4();
        }
        profile.sightings = profile.sightings.max(identity.profile.sightings);
        profile.last_seen = profile.last_seen.max(identity.profile.last_seen);
        identity.profile = profile;

        let dir = self.root.join(&name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        write_json_atomic(&dir.join(PROFILE_FILE), &identity.profile)?;

        let identity_ref = identity.identity_ref();
        // Identities without references stay out of the matcher's gallery.
        if !identity.references.is_empty() {
            self.publish(identity);
        }
        Ok(identity_ref)
    }

    /// Identity-update path: one more sighting at `at`, persisted immediately.
    pub fn record_sighting(&self, name: &str, at: DateTime<Utc>) -> Result<Profile, GalleryError> {
        let lock = self.record_lock(name);
        let _record = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut identity = self
            .snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| GalleryError::UnknownIdentity(name.to_string()))?;

        identity.profile.record_sighting(at);
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        write_json_atomic(&dir.join(PROFILE_FILE), &identity.profile)?;

        let profile = identity.profile.clone();
        self.publish(identity);
        Ok(profile)
    }

    fn publish(&self, identity: Identity) {
        let _swap = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.current.load().with_identity(identity);
        self.current.store(Arc::new(next));
    }

    fn record_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.record_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }

    /// The identity as currently published, else as found on disk (a
    /// profile written by the registration flow), else a fresh one.
    ///
    /// An unreadable record on disk is an error: overwriting it would lose
    /// its sighting history.
    fn current_or_disk(&self, name: &str) -> Result<Identity, GalleryError> {
        if let Some(identity) = self.snapshot().get(name) {
            return Ok(identity.clone());
        }

        let dir = self.root.join(name);
        let corrupt = |what: &str, e: GalleryError| {
            tracing::warn!(name, what, error = %e, "unreadable record file; leaving it untouched");
            GalleryError::CorruptRecord { name: name.to_string(), reason: format!("{what}: {e}") }
        };
        let profile = match read_json::<Profile>(&dir.join(PROFILE_FILE)) {
            Ok(Some(mut profile)) => {
                profile.name = name.to_string();
                if profile.id.is_nil() {
                    profile.id = uuid::Uuid::new_v4();
                }
                profile
            }
            Ok(None) => Profile::new(name),
            Err(e) => return Err(corrupt("profile", e)),
        };
        let references = match read_json::<EmbeddingsFile>(&dir.join(EMBEDDINGS_FILE)) {
            Ok(file) => file.map(|f| f.references).unwrap_or_default(),
            Err(e) => return Err(corrupt("embeddings", e)),
        };
        Ok(Identity { profile, references })
    }
}

/// Names become directory names: reject empty, path-like and hidden names.
fn validate_name(name: &str) -> Result<(), GalleryError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
    {
        return Err(GalleryError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn load_record(dir: &Path) -> Result<Identity, GalleryError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GalleryError::InvalidName(dir.display().to_string()))?
        .to_string();
    let corrupt = |reason: String| GalleryError::CorruptRecord { name: name.clone(), reason };

    let mut profile: Profile = read_json(&dir.join(PROFILE_FILE))
        .map_err(|e| corrupt(format!("profile: {e}")))?
        .ok_or_else(|| corrupt("missing profile.json".into()))?;
    let embeddings: EmbeddingsFile = read_json(&dir.join(EMBEDDINGS_FILE))
        .map_err(|e| corrupt(format!("embeddings: {e}")))?
        .ok_or_else(|| corrupt("missing embeddings.json".into()))?;

    if embeddings.references.is_empty() {
        return Err(corrupt("no reference embeddings".into()));
    }
    let dim = embeddings.references[0].embedding.values.len();
    if embeddings
        .references
        .iter()
        .any(|r| !r.embedding.is_valid() || r.embedding.values.len() != dim)
    {
        return Err(corrupt("reference embeddings are empty, non-finite or of mixed length".into()));
    }

    if profile.name != name {
        tracing::warn!(dir = %dir.display(), profile_name = %profile.name, "profile name differs from directory; using directory name");
        profile.name = name.clone();
    }

    if profile.id.is_nil() {
        profile.id = uuid::Uuid::new_v4();
        if let Err(e) = write_json_atomic(&dir.join(PROFILE_FILE), &profile) {
            tracing::warn!(name = %name, error = %e, "could not persist newly assigned identity id");
        }
    }

    Ok(Identity { profile, references: embeddings.references })
}

fn write_record(dir: &Path, identity: &Identity) -> Result<(), GalleryError> {
    write_json_atomic(&dir.join(PROFILE_FILE), &identity.profile)?;
    let file = EmbeddingsFile { references: identity.references.clone() };
    write_json_atomic(&dir.join(EMBEDDINGS_FILE), &file)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, GalleryError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), GalleryError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

fn next_image_name(dir: &Path, name: &str) -> String {
    (1..)
        .map(|n| format!("{name}_{n}.png"))
        .find(|file| !dir.join(file).exists())
        .unwrap_or_else(|| format!("{name}.png"))
}
