use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use recon_core::{shared_config, GalleryStore, IdentityTracker, LoopStatus, RecognitionLoop};
use recon_hw::{Camera, CaptureConfig, FrameSource};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Settings;
use dbus_interface::{ReconService, ServiceState, BUS_NAME, OBJECT_PATH};
use engine::{AcquisitionSettings, EngineTiming, SourceOpener};

/// Pending recognition events before the capture side starts dropping them.
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("recond starting");

    let settings_path = Settings::default_path();
    let settings = match Settings::load_from(&settings_path, |k| std::env::var(k).ok()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "falling back to default settings");
            Settings::default()
        }
    };
    tracing::info!(
        path = %settings_path.display(),
        data_dir = %settings.data_dir.display(),
        model_dir = %settings.model_dir.display(),
        camera = %settings.camera_device,
        "settings loaded"
    );

    let catalog = settings.tag_catalog().context("invalid tag catalog")?;
    let store = Arc::new(
        GalleryStore::open(&settings.data_dir, catalog).context("failed to open gallery")?,
    );

    let recognition = shared_config(settings.recognition_config());
    let tracker = Arc::new(IdentityTracker::new(store.clone(), recognition.clone()));
    let acquisition = Arc::new(ArcSwap::from_pointee(AcquisitionSettings {
        capture: settings.capture_config(),
        mirror: settings.mirror_mode,
    }));

    let (status_tx, status_rx) = watch::channel(LoopStatus::Starting);
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);

    // Both models are required. Without them the loop never starts, but the
    // service still registers so `Status` reports ModelUnavailable.
    let (engine, model_error) = match engine::load_models(&settings.model_dir, &status_tx) {
        Ok(models) => {
            let opener: SourceOpener = Box::new(|config: &CaptureConfig| {
                Camera::open(config).map(|camera| Box::new(camera) as Box<dyn FrameSource>)
            });
            let engine = engine::spawn_engine(
                opener,
                RecognitionLoop::new(models, tracker.clone()),
                acquisition.clone(),
                events_tx,
                Arc::new(status_tx),
                EngineTiming::default(),
            )?;
            (Some(engine), None)
        }
        Err(e) => (None, Some(e)),
    };

    let state = Arc::new(ServiceState {
        store,
        tracker,
        recognition,
        acquisition,
        settings_path,
        engine: engine.as_ref().map(|engine| engine.handle()),
        status: status_rx,
    });

    let bus = if std::env::var("RECON_SYSTEM_BUS").is_ok_and(|v| v != "0") {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = bus
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, ReconService::new(state))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus service registered");

    let forwarder = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let emitter = match zbus::object_server::SignalEmitter::new(&conn, OBJECT_PATH) {
                Ok(emitter) => emitter,
                Err(e) => {
                    tracing::error!(error = %e, "cannot emit signals; events will be logged only");
                    while let Some(event) = events_rx.recv().await {
                        tracing::debug!(unknown = event.is_unknown(), "recognition event");
                    }
                    return;
                }
            };
            while let Some(event) = events_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize event");
                        continue;
                    }
                };
                if let Err(e) = ReconService::recognized(&emitter, &json).await {
                    tracing::warn!(error = %e, "failed to emit Recognized signal");
                }
            }
        })
    };

    if model_error.is_some() {
        tracing::error!("recognition disabled; serving status only");
    } else {
        tracing::info!("recond ready");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("recond shutting down");

    if let Some(engine) = engine {
        tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    }
    forwarder.abort();

    match model_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
