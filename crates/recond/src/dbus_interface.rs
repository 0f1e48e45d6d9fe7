use crate::config::Settings;
use crate::engine::{AcquisitionSettings, EngineHandle, SharedAcquisition};
use chrono::Utc;
use recon_core::{
    Embedding, Frame, GalleryError, GalleryStore, IdentityTracker, LoopStatus, SharedConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "io.lightrecon.Recon1";
pub const OBJECT_PATH: &str = "/io/lightrecon/Recon1";

/// State shared by the D-Bus methods.
pub struct ServiceState {
    pub store: Arc<GalleryStore>,
    pub tracker: Arc<IdentityTracker>,
    pub recognition: SharedConfig,
    pub acquisition: SharedAcquisition,
    pub settings_path: PathBuf,
    /// Absent when the models failed to load; `status` then says why.
    pub engine: Option<EngineHandle>,
    pub status: watch::Receiver<LoopStatus>,
}

/// D-Bus interface for the recognition daemon.
///
/// Bus name: io.lightrecon.Recon1
/// Object path: /io/lightrecon/Recon1
pub struct ReconService {
    state: Arc<ServiceState>,
}

impl ReconService {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn gallery_error(e: GalleryError) -> zbus::fdo::Error {
    match e {
        GalleryError::InvalidName(_) | GalleryError::InvalidEmbedding(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => failed(other),
    }
}

/// Run blocking gallery I/O off the async executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> Result<T, GalleryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(failed)?
        .map_err(gallery_error)
}

impl ServiceState {
    /// Decode an image file, embed its best face and append it as a reference.
    pub async fn add_reference(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        let path = PathBuf::from(image_path);
        let image = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(failed)?
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{image_path}: {e}")))?;

        let engine = self.engine.as_ref().ok_or_else(|| failed(&*self.status.borrow()))?;
        let sample = engine
            .embed_image(Frame::from_rgb_image(image.into_rgb8()))
            .await
            .map_err(failed)?;
        tracing::debug!(name, confidence = sample.face.confidence, "reference face selected");

        let store = self.store.clone();
        let owned = name.to_string();
        let identity = blocking(move || {
            store.add_reference_with_image(&owned, sample.embedding, Some(&sample.crop.image))
        })
        .await?;
        Ok(identity.id.to_string())
    }

    pub async fn add_embedding(&self, name: &str, values: Vec<f64>) -> zbus::fdo::Result<String> {
        let dimension = self.store.dimension();
        if values.len() != dimension {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "expected {dimension} embedding values, got {}",
                values.len()
            )));
        }
        let embedding = Embedding::new(values.into_iter().map(|v| v as f32).collect());
        let store = self.store.clone();
        let owned = name.to_string();
        let identity = blocking(move || store.add_reference(&owned, embedding)).await?;
        Ok(identity.id.to_string())
    }

    pub async fn save_profile(&self, profile_json: &str) -> zbus::fdo::Result<String> {
        let settings = self.load_settings()?;
        let profile = settings
            .profile_from_json(profile_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("profile: {e}")))?;

        for (field, value) in self.store.catalog().stale_tags(&profile) {
            tracing::warn!(name = %profile.name, field, value, "profile tag not in current settings");
        }

        let store = self.store.clone();
        let identity = blocking(move || store.save_profile(profile)).await?;
        tracing::info!(name = %identity.name, id = %identity.id, "profile saved");
        Ok(identity.id.to_string())
    }

    /// Re-read settings, publish them to the running loop and reload the gallery.
    pub async fn reload(&self) -> zbus::fdo::Result<u32> {
        let settings = self.load_settings()?;
        let catalog = settings.tag_catalog().map_err(failed)?;

        self.recognition.store(Arc::new(settings.recognition_config()));
        self.acquisition.store(Arc::new(AcquisitionSettings {
            capture: settings.capture_config(),
            mirror: settings.mirror_mode,
        }));
        if settings.data_dir != self.store.root() {
            tracing::warn!(
                configured = %settings.data_dir.display(),
                active = %self.store.root().display(),
                "data_dir changes take effect after restart"
            );
        }

        let store = self.store.clone();
        let count = blocking(move || store.reload(catalog)).await?;
        tracing::info!(identities = count, "gallery reloaded");
        Ok(count as u32)
    }

    fn load_settings(&self) -> zbus::fdo::Result<Settings> {
        Settings::load_from(&self.settings_path, |k| std::env::var(k).ok()).map_err(failed)
    }

    pub fn status_json(&self) -> String {
        let status = self.status.borrow().clone();
        let gallery = self.store.snapshot();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "loop": status,
            "identities": gallery.len(),
            "references": gallery.iter().map(|i| i.references.len()).sum::<usize>(),
            "data_dir": self.store.root().display().to_string(),
        })
        .to_string()
    }

    pub fn identities_json(&self) -> String {
        let catalog = self.store.catalog();
        let list: Vec<_> = self
            .store
            .snapshot()
            .iter()
            .map(|identity| {
                let p = &identity.profile;
                serde_json::json!({
                    "id": p.id,
                    "name": p.name,
                    "age": p.age,
                    "gender": p.gender,
                    "occupation": p.occupation,
                    "nationality": p.nationality,
                    "status": p.status,
                    "status_color": catalog.status_color(&p.status),
                    "threat_level": p.threat_level,
                    "threat_color": catalog.threat_color(&p.threat_level),
                    "notes": p.notes,
                    "sightings": p.sightings,
                    "last_seen": p.last_seen.map(|t| t.to_rfc3339()),
                    "references": identity.references.len(),
                })
            })
            .collect();
        serde_json::Value::Array(list).to_string()
    }

    pub fn visible_json(&self) -> String {
        serde_json::json!(self.tracker.visible(Utc::now())).to_string()
    }
}

#[interface(name = "io.lightrecon.Recon1")]
impl ReconService {
    /// Register a reference image for `name`; returns the identity id.
    async fn add_reference(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "add_reference requested");
        self.state.add_reference(name, image_path).await
    }

    /// Register a precomputed embedding for `name`; returns the identity id.
    async fn add_embedding(&self, name: &str, values: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(name, dims = values.len(), "add_embedding requested");
        self.state.add_embedding(name, values).await
    }

    /// Create or replace a profile record from JSON; returns the identity id.
    async fn save_profile(&self, profile_json: &str) -> zbus::fdo::Result<String> {
        self.state.save_profile(profile_json).await
    }

    /// Re-read settings and the gallery from disk; returns the identity count.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        self.state.reload().await
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.status_json())
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.identities_json())
    }

    async fn visible(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.visible_json())
    }

    /// One recognized or unknown face, as JSON.
    #[zbus(signal)]
    pub async fn recognized(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}
