use arc_swap::ArcSwap;
use recon_core::pipeline::RegistrationSample;
use recon_core::{
    FaceModels, Frame, FrameSlot, LoopStatus, ModelError, PipelineError, RecognitionEvent,
    RecognitionLoop,
};
use recon_hw::{CameraError, CaptureConfig, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("registration failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Capture parameters the acquisition thread re-reads on every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub capture: CaptureConfig,
    pub mirror: bool,
}

pub type SharedAcquisition = Arc<ArcSwap<AcquisitionSettings>>;

/// Opens a frame source for a capture configuration.
pub type SourceOpener =
    Box<dyn Fn(&CaptureConfig) -> Result<Box<dyn FrameSource>, CameraError> + Send>;

/// Engine timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    /// Pause between camera recovery attempts.
    pub retry_delay: Duration,
    /// How long the recognition thread waits for a frame before serving requests.
    pub poll_interval: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Messages sent from D-Bus handlers to the recognition thread.
enum EngineRequest {
    EmbedImage {
        image: Frame,
        reply: oneshot::Sender<Result<RegistrationSample, PipelineError>>,
    },
}

/// Clone-safe handle to the recognition thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect and embed the best face in a registration image.
    ///
    /// Served between frames by the thread that owns the models.
    pub async fn embed_image(&self, image: Frame) -> Result<RegistrationSample, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::EmbedImage {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Running acquisition + recognition threads.
pub struct Engine {
    handle: EngineHandle,
    stop: Arc<AtomicBool>,
    slot: Arc<FrameSlot>,
    status: Arc<watch::Sender<LoopStatus>>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Signal both threads to stop and wait for them.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.slot.close();
        for thread in self.threads {
            if thread.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
        set_status(&self.status, LoopStatus::Stopped);
        tracing::info!(dropped_frames = self.slot.dropped(), "engine stopped");
    }
}

/// Spawn the acquisition and recognition threads.
///
/// The camera is opened lazily by the acquisition thread so a missing
/// device surfaces as `CameraUnavailable` and is retried, never fatal.
pub fn spawn_engine(
    opener: SourceOpener,
    looper: RecognitionLoop,
    acquisition: SharedAcquisition,
    events: mpsc::Sender<RecognitionEvent>,
    status: Arc<watch::Sender<LoopStatus>>,
    timing: EngineTiming,
) -> Result<Engine, EngineError> {
    let stop = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(FrameSlot::new());
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);

    let acquire = {
        let (stop, slot, status) = (stop.clone(), slot.clone(), status.clone());
        std::thread::Builder::new()
            .name("recon-capture".into())
            .spawn(move || run_acquisition(opener, acquisition, &slot, &stop, &status, timing))?
    };

    let recognize = {
        let (stop, slot) = (stop.clone(), slot.clone());
        std::thread::Builder::new()
            .name("recon-recognize".into())
            .spawn(move || run_recognition(looper, rx, &slot, &stop, &events, timing))?
    };

    Ok(Engine {
        handle: EngineHandle { tx },
        stop,
        slot,
        status,
        threads: vec![acquire, recognize],
    })
}

/// Load the detector and embedder from `model_dir`.
///
/// A failure is published as `ModelUnavailable` before it is returned, so
/// clients see why the loop never started.
pub fn load_models(
    model_dir: &Path,
    status: &watch::Sender<LoopStatus>,
) -> Result<FaceModels, ModelError> {
    match FaceModels::load(model_dir) {
        Ok(models) => {
            tracing::info!(model_dir = %model_dir.display(), "models loaded");
            Ok(models)
        }
        Err(e) => {
            let ModelError::ModelUnavailable(reason) = &e;
            tracing::error!(model_dir = %model_dir.display(), %reason, "cannot load models");
            set_status(status, LoopStatus::ModelUnavailable(reason.clone()));
            Err(e)
        }
    }
}

fn set_status(status: &watch::Sender<LoopStatus>, next: LoopStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        tracing::info!(from = %current, to = %next, "loop status changed");
        *current = next;
        true
    });
}

/// Sleep for `delay` in short steps, returning early once `stop` is set.
fn pause(stop: &AtomicBool, delay: Duration) {
    let step = Duration::from_millis(50);
    let mut left = delay;
    while !left.is_zero() && !stop.load(Ordering::SeqCst) {
        let nap = left.min(step);
        std::thread::sleep(nap);
        left -= nap;
    }
}

fn run_acquisition(
    opener: SourceOpener,
    acquisition: SharedAcquisition,
    slot: &FrameSlot,
    stop: &AtomicBool,
    status: &watch::Sender<LoopStatus>,
    timing: EngineTiming,
) {
    tracing::info!("acquisition thread started");
    let mut source: Option<Box<dyn FrameSource>> = None;
    let mut active: Option<CaptureConfig> = None;

    while !stop.load(Ordering::SeqCst) {
        let wanted = acquisition.load_full();

        // A different device needs a fresh open; a new size only renegotiation.
        if active.as_ref().is_some_and(|a| a.device != wanted.capture.device) {
            source = None;
        }

        if source.is_none() {
            match opener(&wanted.capture) {
                Ok(opened) => {
                    source = Some(opened);
                    active = Some(wanted.capture.clone());
                }
                Err(e) => {
                    tracing::warn!(device = %wanted.capture.device, error = %e, "camera open failed");
                    set_status(status, LoopStatus::CameraUnavailable(e.to_string()));
                    pause(stop, timing.retry_delay);
                    continue;
                }
            }
        }
        let Some(src) = source.as_mut() else {
            continue;
        };

        if let Some(current) = active.as_mut() {
            if (current.width, current.height) != (wanted.capture.width, wanted.capture.height) {
                let (width, height) = (wanted.capture.width, wanted.capture.height);
                match src.reconfigure(width, height) {
                    Ok(()) => *current = wanted.capture.clone(),
                    Err(e) => {
                        tracing::warn!(width, height, error = %e, "camera reconfigure failed");
                        set_status(status, LoopStatus::CameraUnavailable(e.to_string()));
                        source = None;
                        pause(stop, timing.retry_delay);
                        continue;
                    }
                }
            }
        }

        match src.next_frame() {
            Ok(mut frame) => {
                set_status(status, LoopStatus::Running);
                if wanted.mirror {
                    frame.mirror();
                }
                if slot.publish(frame) {
                    tracing::trace!(dropped = slot.dropped(), "recognition behind; frame replaced");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                set_status(status, LoopStatus::CameraUnavailable(e.to_string()));
                pause(stop, timing.retry_delay);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match src.reopen() {
                    Ok(()) => tracing::info!("camera reopened"),
                    Err(e) => {
                        tracing::warn!(error = %e, "camera reopen failed");
                        source = None;
                    }
                }
            }
        }
    }

    slot.close();
    tracing::info!("acquisition thread exiting");
}

fn run_recognition(
    mut looper: RecognitionLoop,
    mut requests: mpsc::Receiver<EngineRequest>,
    slot: &FrameSlot,
    stop: &AtomicBool,
    events: &mpsc::Sender<RecognitionEvent>,
    timing: EngineTiming,
) {
    tracing::info!("recognition thread started");
    let mut undelivered = 0u64;

    while !stop.load(Ordering::SeqCst) {
        while let Ok(request) = requests.try_recv() {
            match request {
                EngineRequest::EmbedImage { image, reply } => {
                    let _ = reply.send(looper.embed_best_face(&image));
                }
            }
        }

        if let Some(batch) = looper.poll(slot, timing.poll_interval) {
            for event in batch {
                if events.try_send(event).is_err() {
                    undelivered += 1;
                    tracing::debug!(undelivered, "event consumer behind; event dropped");
                }
            }
        } else if slot.is_closed() {
            break;
        }
    }

    tracing::info!(frames = looper.frames_seen(), "recognition thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::detector::{Detector, DetectorError};
    use recon_core::recognizer::{Embedder, RecognizerError};
    use recon_core::{
        shared_config, Embedding, FaceBox, FaceCrop, FaceModels, GalleryStore, IdentityTracker,
        RecognitionConfig, TagCatalog,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct WholeFrameDetector;

    impl Detector for WholeFrameDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
            Ok(vec![FaceBox {
                x: 0.0,
                y: 0.0,
                width: frame.width as f32,
                height: frame.height as f32,
                confidence: 0.99,
            }])
        }
    }

    struct BrightnessEmbedder;

    impl Embedder for BrightnessEmbedder {
        fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, RecognizerError> {
            let mean = crop.values.iter().sum::<f32>() / crop.values.len() as f32;
            Ok(Embedding::new(vec![mean, 0.0]))
        }
    }

    /// Scripted camera: each call pops the next outcome; once the script is
    /// empty it yields blank (zero-sized) frames, which carry no faces.
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Result<Frame, CameraError>>>>,
        reopens: Arc<Mutex<u32>>,
        sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome,
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(Frame::new(Vec::new(), 0, 0))
                }
            }
        }

        fn reopen(&mut self) -> Result<(), CameraError> {
            *self.reopens.lock().unwrap() += 1;
            Ok(())
        }

        fn reconfigure(&mut self, width: u32, height: u32) -> Result<(), CameraError> {
            self.sizes.lock().unwrap().push((width, height));
            Ok(())
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        store: Arc<GalleryStore>,
        script: Arc<Mutex<VecDeque<Result<Frame, CameraError>>>>,
        reopens: Arc<Mutex<u32>>,
        sizes: Arc<Mutex<Vec<(u32, u32)>>>,
        open_failures_left: Arc<Mutex<usize>>,
        acquisition: SharedAcquisition,
        status: watch::Receiver<LoopStatus>,
        events: mpsc::Receiver<RecognitionEvent>,
        engine: Engine,
    }

    fn timing() -> EngineTiming {
        EngineTiming {
            retry_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn rig(open_failures: usize) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            GalleryStore::open(dir.path(), TagCatalog::default()).unwrap().with_dimension(2),
        );
        store.add_reference("bright", Embedding::new(vec![1.0, 0.0])).unwrap();
        let tracker = Arc::new(IdentityTracker::new(
            store.clone(),
            shared_config(RecognitionConfig::default()),
        ));
        let models = FaceModels::new(Box::new(WholeFrameDetector), Box::new(BrightnessEmbedder));
        let looper = RecognitionLoop::new(models, tracker);

        let script = Arc::new(Mutex::new(VecDeque::new()));
        let reopens = Arc::new(Mutex::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let open_failures_left = Arc::new(Mutex::new(open_failures));
        let opener: SourceOpener = {
            let (script, reopens, sizes) = (script.clone(), reopens.clone(), sizes.clone());
            let remaining_failures = open_failures_left.clone();
            Box::new(move |_config: &CaptureConfig| {
                let mut left = remaining_failures.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(CameraError::DeviceNotFound("/dev/video9".into()));
                }
                Ok(Box::new(ScriptedSource {
                    script: script.clone(),
                    reopens: reopens.clone(),
                    sizes: sizes.clone(),
                }) as Box<dyn FrameSource>)
            })
        };

        let acquisition = Arc::new(ArcSwap::from_pointee(AcquisitionSettings {
            capture: CaptureConfig::default(),
            mirror: true,
        }));
        let (status_tx, status) = watch::channel(LoopStatus::Starting);
        let (events_tx, events) = mpsc::channel(16);
        let engine = spawn_engine(
            opener,
            looper,
            acquisition.clone(),
            events_tx,
            Arc::new(status_tx),
            timing(),
        )
        .unwrap();

        Rig {
            _dir: dir,
            store,
            script,
            reopens,
            sizes,
            open_failures_left,
            acquisition,
            status,
            events,
            engine,
        }
    }

    fn white(w: u32, h: u32) -> Frame {
        Frame::new(vec![255; (w * h * 3) as usize], w, h)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frames_flow_to_events() {
        let mut rig = rig(0);
        rig.script.lock().unwrap().push_back(Ok(white(16, 16)));

        let mut event = None;
        assert!(wait_for(|| {
            event = rig.events.try_recv().ok();
            event.is_some()
        }));
        let event = event.unwrap();
        assert_eq!(event.identity.map(|i| i.name), Some("bright".to_string()));
        assert!(event.state_updated);
        assert_eq!(*rig.status.borrow(), LoopStatus::Running);

        rig.engine.shutdown();
        assert_eq!(*rig.status.borrow(), LoopStatus::Stopped);
        assert_eq!(rig.store.snapshot().get("bright").unwrap().profile.sightings, 1);
    }

    #[test]
    fn test_open_failure_retried_until_camera_appears() {
        let rig = rig(3);
        assert!(wait_for(|| *rig.status.borrow() == LoopStatus::Running));
        assert_eq!(*rig.open_failures_left.lock().unwrap(), 0);
        rig.engine.shutdown();
    }

    #[test]
    fn test_missing_models_publish_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(LoopStatus::Starting);

        assert!(load_models(&dir.path().join("models"), &tx).is_err());
        match &*rx.borrow() {
            LoopStatus::ModelUnavailable(reason) => assert!(reason.contains("detector")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_set_status_only_notifies_on_change() {
        let (tx, mut rx) = watch::channel(LoopStatus::Starting);
        rx.mark_unchanged();
        set_status(&tx, LoopStatus::Starting);
        assert!(!rx.has_changed().unwrap());
        set_status(&tx, LoopStatus::CameraUnavailable("timeout".into()));
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            LoopStatus::CameraUnavailable("timeout".into())
        );
    }

    #[test]
    fn test_capture_error_triggers_reopen() {
        let rig = rig(0);
        rig.script
            .lock()
            .unwrap()
            .push_back(Err(CameraError::CaptureFailed("unplugged".into())));
        assert!(wait_for(|| *rig.reopens.lock().unwrap() >= 1));
        rig.engine.shutdown();
    }

    #[test]
    fn test_resolution_change_reconfigures() {
        let rig = rig(0);
        rig.acquisition.store(Arc::new(AcquisitionSettings {
            capture: CaptureConfig {
                width: 640,
                height: 480,
                ..CaptureConfig::default()
            },
            mirror: false,
        }));
        assert!(wait_for(|| rig.sizes.lock().unwrap().contains(&(640, 480))));
        rig.engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_embed_image_served_between_frames() {
        let rig = rig(0);
        let handle = rig.engine.handle();
        let sample = handle.embed_image(white(24, 24)).await.unwrap();
        assert!((sample.embedding.values[0] - 1.0).abs() < 1e-5);

        let err = handle.embed_image(Frame::new(vec![], 0, 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::NoFaceDetected)));

        tokio::task::spawn_blocking(move || rig.engine.shutdown()).await.unwrap();
        assert!(matches!(
            handle.embed_image(white(4, 4)).await,
            Err(EngineError::ChannelClosed)
        ));
    }
}
