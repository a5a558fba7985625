//! Live recognition worker.
//!
//! The worker moves an open camera into a dedicated thread that runs
//! detect → embed → match → emit until asked to stop. Lifecycle is an
//! explicit state machine:
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              └──────(open failed)──────────┘
//! ```
//!
//! The gallery is the only state shared with the loop; each iteration takes
//! one snapshot `Arc` and matches every face of that frame against it.

use crate::detector::FaceLocalizer;
use crate::embedder::{crop_face, Embedder, EmbedderError};
use crate::events::{EventSender, WorkerEvent};
use crate::gallery::{Gallery, GalleryError, GalleryStore, LoadSummary};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_THRESHOLD};
use crate::overlay::{AnnotationKind, Overlay};
use crate::source::{CameraProvider, FrameSource, SourceError};
use crate::types::{BoundingBox, Identity, MatchResult};
use image::imageops::{self, FilterType};
use image::RgbImage;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    /// Whether `self → next` is one of the legal lifecycle transitions.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker is not stopped (state: {0:?})")]
    AlreadyRunning(WorkerState),
    #[error("no camera available: device {primary}: {primary_error}; fallback device {fallback}: {fallback_error}")]
    DeviceUnavailable {
        primary: u32,
        primary_error: SourceError,
        fallback: u32,
        fallback_error: SourceError,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failure while processing a single face. The face is skipped.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("embedder failed: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("embedding has dimension {actual}, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedder panicked: {0}")]
    EmbedderPanicked(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Camera index opened first.
    pub primary_device: u32,
    /// Camera index tried once when the primary cannot be opened.
    pub fallback_device: u32,
    /// Maximum Euclidean distance (exclusive) for a positive match.
    pub threshold: f32,
    /// Minimum spacing between two identical outcome events.
    pub debounce: Duration,
    /// Pause after every processed frame.
    pub frame_interval: Duration,
    /// Pause after a failed frame read.
    pub read_backoff: Duration,
    /// Consecutive read failures before an error event is emitted (once per streak).
    pub read_failure_report_after: u32,
    /// Events buffered for the subscriber before new ones are dropped.
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            primary_device: 0,
            fallback_device: 1,
            threshold: DEFAULT_THRESHOLD,
            debounce: Duration::from_secs(1),
            frame_interval: Duration::from_millis(10),
            read_backoff: Duration::from_millis(50),
            read_failure_report_after: 20,
            event_capacity: 256,
        }
    }
}

/// The face localizer and embedder driven by the loop.
pub struct Pipeline {
    localizer: Box<dyn FaceLocalizer>,
    embedder: Box<dyn Embedder>,
}

impl Pipeline {
    pub fn new(localizer: impl FaceLocalizer + 'static, embedder: impl Embedder + 'static) -> Self {
        Self {
            localizer: Box::new(localizer),
            embedder: Box::new(embedder),
        }
    }
}

/// Suppresses repeats of an outcome within a time window.
///
/// Outcomes are keyed by matched identity id, `None` meaning "no match".
/// Each key keeps its own last emission time, so outcomes that alternate
/// frame to frame are each emitted at most once per interval.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last_sent: HashMap<Option<String>, Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
        }
    }

    /// Returns true if the outcome should be emitted, and records it as sent.
    pub fn admit(&mut self, key: Option<&str>, now: Instant) -> bool {
        // Expired keys would pass anyway; dropping them keeps the map bounded.
        let interval = self.interval;
        self.last_sent
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < interval);

        let key = key.map(str::to_owned);
        if self.last_sent.contains_key(&key) {
            return false;
        }
        self.last_sent.insert(key, now);
        true
    }
}

struct LoopHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owns the camera lifecycle and the recognition loop thread.
pub struct RecognitionWorker {
    config: WorkerConfig,
    cameras: Arc<dyn CameraProvider>,
    pipeline: Arc<Mutex<Pipeline>>,
    gallery: Arc<GalleryStore>,
    events: EventSender,
    subscriber: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    state: Mutex<WorkerState>,
    /// Held across a whole start/stop so lifecycle calls never interleave.
    lifecycle: Mutex<Option<LoopHandle>>,
}

impl RecognitionWorker {
    pub fn new(
        config: WorkerConfig,
        cameras: Arc<dyn CameraProvider>,
        pipeline: Pipeline,
        gallery: Arc<GalleryStore>,
    ) -> Self {
        let (events, rx) = EventSender::channel(config.event_capacity);
        Self {
            config,
            cameras,
            pipeline: Arc::new(Mutex::new(pipeline)),
            gallery,
            events,
            subscriber: Mutex::new(Some(rx)),
            state: Mutex::new(WorkerState::Stopped),
            lifecycle: Mutex::new(None),
        }
    }

    /// Take the event stream. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.subscriber.lock().take()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn gallery(&self) -> &Arc<GalleryStore> {
        &self.gallery
    }

    /// Open the camera (primary, then fallback) and start the loop thread.
    ///
    /// On `DeviceUnavailable` the worker stays Stopped and exactly one error
    /// event is emitted.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut lifecycle = self.lifecycle.lock();
        let current = self.state();
        if current != WorkerState::Stopped {
            return Err(WorkerError::AlreadyRunning(current));
        }
        self.transition(WorkerState::Starting);

        let source = match self.open_camera() {
            Ok(source) => source,
            Err(e) => return Err(self.abort_start(e)),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let recognition_loop = RecognitionLoop {
            config: self.config.clone(),
            gallery: Arc::clone(&self.gallery),
            events: self.events.clone(),
            cancel: Arc::clone(&cancel),
            debouncer: Debouncer::new(self.config.debounce),
        };
        let pipeline = Arc::clone(&self.pipeline);
        let identities = self.gallery.snapshot().len();
        // Queued ahead of anything the loop emits.
        self.events.emit(WorkerEvent::GalleryLoaded(identities));

        let thread = std::thread::Builder::new()
            .name("facewatch-worker".into())
            .spawn(move || recognition_loop.run(source, pipeline))
            .map_err(|e| self.abort_start(WorkerError::Spawn(e)))?;

        *lifecycle = Some(LoopHandle { cancel, thread });
        self.transition(WorkerState::Running);
        tracing::info!(identities, threshold = self.config.threshold, "recognition worker running");
        Ok(())
    }

    /// Ask the loop to exit and wait until it has released the camera.
    ///
    /// Does nothing when already stopped.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let Some(handle) = lifecycle.take() else {
            return;
        };
        self.transition(WorkerState::Stopping);
        handle.cancel.store(true, Ordering::Release);
        if handle.thread.join().is_err() {
            tracing::error!("recognition loop panicked");
        }
        self.transition(WorkerState::Stopped);
        tracing::info!("recognition worker stopped");
    }

    /// Reload the gallery file and publish it to the running loop.
    ///
    /// Safe to call from any thread at any time; the loop picks the new
    /// snapshot up on its next iteration.
    pub fn reload_gallery(&self) -> Result<LoadSummary, GalleryError> {
        match self.gallery.reload() {
            Ok(summary) => {
                if !summary.rejected.is_empty() {
                    self.events.emit(WorkerEvent::Error(format!(
                        "dropped {} malformed gallery record(s)",
                        summary.rejected.len()
                    )));
                }
                self.events.emit(WorkerEvent::GalleryLoaded(summary.loaded));
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "gallery reload failed");
                self.events.emit(WorkerEvent::Error(format!("gallery reload failed: {e}")));
                self.events.emit(WorkerEvent::GalleryLoaded(0));
                Err(e)
            }
        }
    }

    fn open_camera(&self) -> Result<Box<dyn FrameSource>, WorkerError> {
        let primary = self.config.primary_device;
        let primary_error = match self.cameras.open(primary) {
            Ok(source) => {
                tracing::info!(device = primary, "camera opened");
                return Ok(source);
            }
            Err(e) => e,
        };

        let fallback = self.config.fallback_device;
        tracing::warn!(device = primary, fallback, error = %primary_error, "camera unavailable, trying fallback");
        match self.cameras.open(fallback) {
            Ok(source) => {
                tracing::info!(device = fallback, "fallback camera opened");
                Ok(source)
            }
            Err(fallback_error) => Err(WorkerError::DeviceUnavailable {
                primary,
                primary_error,
                fallback,
                fallback_error,
            }),
        }
    }

    fn abort_start(&self, error: WorkerError) -> WorkerError {
        tracing::error!(error = %error, "recognition worker failed to start");
        self.events.emit(WorkerEvent::Error(error.to_string()));
        self.transition(WorkerState::Stopped);
        error
    }

    fn transition(&self, next: WorkerState) {
        let mut state = self.state.lock();
        debug_assert!(state.can_transition_to(next), "illegal transition {:?} -> {next:?}", *state);
        tracing::debug!(from = ?*state, to = ?next, "worker state");
        *state = next;
    }
}

impl Drop for RecognitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State private to the loop thread.
struct RecognitionLoop {
    config: WorkerConfig,
    gallery: Arc<GalleryStore>,
    events: EventSender,
    cancel: Arc<AtomicBool>,
    debouncer: Debouncer,
}

impl RecognitionLoop {
    fn run(mut self, mut source: Box<dyn FrameSource>, pipeline: Arc<Mutex<Pipeline>>) {
        let mut pipeline = pipeline.lock();
        let mut read_failures = 0u32;
        let mut frames = 0u64;

        while !self.cancel.load(Ordering::Acquire) {
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    read_failures += 1;
                    tracing::debug!(error = %e, consecutive = read_failures, "frame read failed");
                    if read_failures == self.config.read_failure_report_after {
                        self.events.emit(WorkerEvent::Error(format!(
                            "camera read failed {read_failures} times in a row: {e}"
                        )));
                    }
                    std::thread::sleep(self.config.read_backoff);
                    continue;
                }
            };
            if read_failures >= self.config.read_failure_report_after {
                tracing::info!(failures = read_failures, "camera reads recovered");
            }
            read_failures = 0;

            self.process_frame(&mut pipeline, &frame, Instant::now());
            frames += 1;
            std::thread::sleep(self.config.frame_interval);
        }

        source.release();
        drop(source);
        tracing::info!(frames, dropped_events = self.events.dropped(), "recognition loop exited, camera released");
    }

    fn process_frame(&mut self, pipeline: &mut Pipeline, frame: &RgbImage, now: Instant) {
        let gallery = self.gallery.snapshot();
        let mut overlay = Overlay::new(frame);
        let mut faces = Vec::new();

        // A panicking model must not take the loop thread down with it.
        let located = match panic::catch_unwind(AssertUnwindSafe(|| pipeline.localizer.locate(frame))) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(payload) => Err(format!("localizer panicked: {}", panic_message(payload.as_ref()))),
        };

        match located {
            Ok(boxes) => {
                for bbox in boxes {
                    match recognize_face(pipeline.embedder.as_mut(), frame, &bbox, &gallery, self.config.threshold) {
                        Ok(Some(face)) => {
                            match &face.result.identity {
                                Some(identity) => overlay.annotate(
                                    bbox,
                                    AnnotationKind::Matched,
                                    identity.display_label(),
                                    Some(face.result.distance),
                                ),
                                None => overlay.annotate(
                                    bbox,
                                    AnnotationKind::Unknown,
                                    "Unknown".into(),
                                    Some(face.result.distance),
                                ),
                            }
                            faces.push(face);
                        }
                        Ok(None) => tracing::trace!(?bbox, "degenerate face crop skipped"),
                        Err(e) => {
                            tracing::warn!(error = %e, "face skipped");
                            self.events.emit(WorkerEvent::Error(format!("face processing failed: {e}")));
                            overlay.annotate(bbox, AnnotationKind::Failed, "error".into(), None);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "face localization failed");
                self.events.emit(WorkerEvent::Error(format!("face localization failed: {e}")));
            }
        }

        let best = select_best(faces);
        self.emit_outcome(best, now);
        self.events.emit(WorkerEvent::Frame(overlay.finish()));
    }

    fn emit_outcome(&mut self, best: Option<BestMatch>, now: Instant) {
        match best {
            Some(best) => {
                if self.debouncer.admit(Some(best.identity.id.as_str()), now) {
                    tracing::debug!(id = %best.identity.id, name = %best.identity.name, distance = best.distance, "identity matched");
                    self.events.emit(WorkerEvent::Matched {
                        id: best.identity.id,
                        name: best.identity.name,
                        crop: best.crop,
                        distance: best.distance,
                    });
                }
            }
            None => {
                if self.debouncer.admit(None, now) {
                    self.events.emit(WorkerEvent::Unmatched);
                }
            }
        }
    }
}

struct RecognizedFace {
    crop: RgbImage,
    result: MatchResult,
}

struct BestMatch {
    identity: Identity,
    crop: RgbImage,
    distance: f32,
}

/// Crop, embed and classify one detected face.
///
/// `Ok(None)` means the box has no usable pixels inside the frame.
fn recognize_face(
    embedder: &mut dyn Embedder,
    frame: &RgbImage,
    bbox: &BoundingBox,
    gallery: &Gallery,
    threshold: f32,
) -> Result<Option<RecognizedFace>, FaceError> {
    let Some(crop) = crop_face(frame, bbox) else {
        return Ok(None);
    };
    let size = embedder.input_size();
    let input = imageops::resize(&crop, size, size, FilterType::Triangle);

    let embedding = panic::catch_unwind(AssertUnwindSafe(|| embedder.embed(&input)))
        .map_err(|payload| FaceError::EmbedderPanicked(panic_message(payload.as_ref())))??;
    if let Some(expected) = gallery.dimension() {
        if expected != embedding.dimension() {
            return Err(FaceError::DimensionMismatch {
                expected,
                actual: embedding.dimension(),
            });
        }
    }

    let result = EuclideanMatcher.classify(&embedding, gallery, threshold);
    Ok(Some(RecognizedFace { crop, result }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Best face wins: among matched faces, the lowest distance; the earlier
/// face on a tie. Unmatched faces never win.
fn select_best(faces: Vec<RecognizedFace>) -> Option<BestMatch> {
    faces
        .into_iter()
        .filter_map(|face| {
            let distance = face.result.distance;
            face.result.identity.map(|identity| BestMatch {
                identity,
                crop: face.crop,
                distance,
            })
        })
        .fold(None, |best: Option<BestMatch>, candidate| match best {
            Some(best) if best.distance <= candidate.distance => Some(best),
            _ => Some(candidate),
        })
}
