//! Frame source seam: how the worker opens and reads a camera.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera device {index} unavailable: {reason}")]
    Unavailable { index: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum FrameError {
    /// A read hiccup; the next read may succeed.
    #[error("transient frame read failure: {0}")]
    Transient(String),
}

/// An open camera. Owned by exactly one worker thread while running.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RgbImage, FrameError>;

    /// Give the device back. Called once, before the worker thread exits;
    /// dropping the source must release it as well.
    fn release(&mut self) {}
}

/// Opens camera devices by index.
pub trait CameraProvider: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn FrameSource>, SourceError>;
}
