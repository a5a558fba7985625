//! Worker → subscriber notifications.

use crate::overlay::PresentationFrame;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Notification emitted by the recognition worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Annotated preview, one per loop iteration.
    Frame(PresentationFrame),
    /// Best face of a frame matched a known identity.
    Matched {
        id: String,
        name: String,
        /// Unscaled crop of the matched face.
        crop: RgbImage,
        distance: f32,
    },
    /// No face in the frame matched.
    Unmatched,
    /// Non-fatal problem, or a failed `start()`.
    Error(String),
    /// A gallery (re)load finished with this many identities.
    GalleryLoaded(usize),
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Frame(_) => "frame",
            WorkerEvent::Matched { .. } => "matched",
            WorkerEvent::Unmatched => "unmatched",
            WorkerEvent::Error(_) => "error",
            WorkerEvent::GalleryLoaded(_) => "gallery_loaded",
        }
    }
}

/// Non-blocking sending half shared by the worker and its loop thread.
///
/// A full channel drops the event instead of stalling the camera loop.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<WorkerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Frames are expected to back up under a slow subscriber.
                if matches!(event, WorkerEvent::Frame(_)) {
                    tracing::trace!(dropped, "subscriber lagging, frame dropped");
                } else {
                    tracing::warn!(kind = event.kind(), dropped, "subscriber lagging, event dropped");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
