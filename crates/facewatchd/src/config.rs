use facewatch_core::{WorkerConfig, DEFAULT_THRESHOLD, DETECTOR_MODEL, EMBEDDER_MODEL};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON gallery file.
    pub gallery_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Camera index opened first (`/dev/video{N}`).
    pub camera_index: u32,
    /// Camera index tried when the primary cannot be opened.
    pub fallback_camera_index: u32,
    /// Euclidean distance threshold (exclusive) for a positive match.
    pub threshold: f32,
    pub debounce_ms: u64,
    pub frame_interval_ms: u64,
    /// Backoff after a failed frame read.
    pub read_backoff_ms: u64,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = WorkerConfig::default();
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            gallery_path: var("FACEWATCH_GALLERY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(facewatch_core::default_gallery_path),
            model_dir: var("FACEWATCH_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(facewatch_core::default_model_dir),
            camera_index: var("FACEWATCH_CAMERA_INDEX")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.primary_device),
            fallback_camera_index: var("FACEWATCH_FALLBACK_CAMERA_INDEX")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.fallback_device),
            threshold: var("FACEWATCH_THRESHOLD")
                .and_then(|v| v.trim().parse::<f32>().ok())
                .filter(|t| t.is_finite() && *t > 0.0)
                .unwrap_or(DEFAULT_THRESHOLD),
            debounce_ms: parsed("FACEWATCH_DEBOUNCE_MS").unwrap_or(defaults.debounce.as_millis() as u64),
            frame_interval_ms: parsed("FACEWATCH_FRAME_INTERVAL_MS")
                .unwrap_or(defaults.frame_interval.as_millis() as u64),
            read_backoff_ms: parsed("FACEWATCH_READ_BACKOFF_MS").unwrap_or(defaults.read_backoff.as_millis() as u64),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            primary_device: self.camera_index,
            fallback_device: self.fallback_camera_index,
            threshold: self.threshold,
            debounce: Duration::from_millis(self.debounce_ms),
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            read_backoff: Duration::from_millis(self.read_backoff_ms),
            ..WorkerConfig::default()
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir.join(DETECTOR_MODEL).to_string_lossy().into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join(EMBEDDER_MODEL).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.fallback_camera_index, 1);
        assert_eq!(config.threshold, 1.05);
        assert!(config.gallery_path.ends_with("facewatch/gallery.json"));

        let worker = config.worker_config();
        assert_eq!(worker.debounce, Duration::from_secs(1));
        assert_eq!(worker.frame_interval, Duration::from_millis(10));
        assert_eq!(worker.read_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("FACEWATCH_GALLERY_PATH", "/tmp/g.json"),
            ("FACEWATCH_MODEL_DIR", "/opt/models"),
            ("FACEWATCH_CAMERA_INDEX", "2"),
            ("FACEWATCH_FALLBACK_CAMERA_INDEX", " 4 "),
            ("FACEWATCH_THRESHOLD", "0.9"),
            ("FACEWATCH_DEBOUNCE_MS", "250"),
        ]);
        assert_eq!(config.gallery_path, PathBuf::from("/tmp/g.json"));
        assert_eq!(config.detector_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(config.embedder_model_path(), "/opt/models/facenet512.onnx");
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.fallback_camera_index, 4);
        assert_eq!(config.worker_config().threshold, 0.9);
        assert_eq!(config.worker_config().debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("FACEWATCH_CAMERA_INDEX", "front"),
            ("FACEWATCH_THRESHOLD", "-1"),
            ("FACEWATCH_FRAME_INTERVAL_MS", "fast"),
        ]);
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert_eq!(config.frame_interval_ms, 10);
    }
}
