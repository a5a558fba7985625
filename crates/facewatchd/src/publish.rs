//! Worker events → JSON lines on stdout.

use facewatch_core::WorkerEvent;
use serde_json::{json, Value};
use std::io::Write;
use tokio::sync::mpsc;

/// JSON form of an event. Preview frames are not published.
pub fn to_json(event: &WorkerEvent) -> Option<Value> {
    let value = match event {
        WorkerEvent::Frame(_) => return None,
        WorkerEvent::Matched {
            id,
            name,
            crop,
            distance,
        } => json!({
            "event": event.kind(),
            "id": id,
            "name": name,
            "distance": distance,
            "crop": { "width": crop.width(), "height": crop.height() },
        }),
        WorkerEvent::Unmatched => json!({ "event": event.kind() }),
        WorkerEvent::Error(message) => json!({ "event": event.kind(), "message": message }),
        WorkerEvent::GalleryLoaded(count) => json!({ "event": event.kind(), "identities": count }),
    };
    Some(value)
}

/// Print events until the worker drops its sender or stdout goes away.
pub async fn run(mut events: mpsc::Receiver<WorkerEvent>) {
    let mut frames = 0u64;
    while let Some(event) = events.recv().await {
        let Some(line) = to_json(&event) else {
            frames += 1;
            continue;
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
            tracing::warn!(error = %e, "stdout closed, no longer publishing events");
            break;
        }
    }
    tracing::debug!(frames, "event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::PresentationFrame;
    use image::RgbImage;

    #[test]
    fn test_matched_event_json() {
        let event = WorkerEvent::Matched {
            id: "001".into(),
            name: "Alice".into(),
            crop: RgbImage::new(40, 50),
            distance: 0.5,
        };
        let value = to_json(&event).unwrap();
        assert_eq!(value["event"], "matched");
        assert_eq!(value["name"], "Alice");
        assert_eq!(value["distance"], 0.5);
        assert_eq!(value["crop"]["height"], 50);
    }

    #[test]
    fn test_status_events_json() {
        assert_eq!(to_json(&WorkerEvent::Unmatched).unwrap(), json!({ "event": "unmatched" }));
        assert_eq!(
            to_json(&WorkerEvent::GalleryLoaded(3)).unwrap(),
            json!({ "event": "gallery_loaded", "identities": 3 })
        );
        assert_eq!(to_json(&WorkerEvent::Error("x".into())).unwrap()["message"], "x");
    }

    #[test]
    fn test_frames_are_not_published() {
        let frame = PresentationFrame {
            image: RgbImage::new(2, 2),
            annotations: vec![],
        };
        assert!(to_json(&WorkerEvent::Frame(frame)).is_none());
    }
}
