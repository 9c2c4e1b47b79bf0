//! Pipeline stage seams: frame acquisition and the two inference models.
//!
//! Implementations wrap external collaborators (a camera, a face-landmark
//! model, an object detector). Each stage is driven from a single thread,
//! one frame at a time.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::observation::{FaceLandmarks, Frame, ObjectDetection};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{model}: frame {frame} carries no input this model can read")]
    MissingInput { model: &'static str, frame: u64 },
    #[error("{model}: inference failed: {message}")]
    Inference { model: &'static str, message: String },
}

/// Cloneable hook that releases a pipeline resource from another thread.
///
/// The owning thread may be blocked inside the resource (a frame read, a
/// reconnect backoff); firing the handle unblocks it. Firing twice, or after
/// the owner released the resource itself, does nothing.
#[derive(Clone)]
pub struct ReleaseHandle(Arc<dyn Fn() + Send + Sync>);

impl ReleaseHandle {
    pub fn new(release: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(release))
    }

    pub fn release(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReleaseHandle")
    }
}

/// Supplies frames until the stream ends.
pub trait FrameSource {
    /// Next frame, or `None` at end of stream. Read failures also end the
    /// stream; sources log them rather than surface them.
    fn next_frame(&mut self) -> Option<Frame>;

    /// Release the underlying device. Must be idempotent.
    fn release(&mut self);

    /// Handle that makes a blocked or future `next_frame` return `None`.
    /// Sources that never block may return `None`.
    fn release_handle(&self) -> Option<ReleaseHandle> {
        None
    }
}

/// Face landmark model: zero, one or many faces per frame.
pub trait FaceLandmarker {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, ModelError>;
}

/// Object detection model.
pub trait ObjectDetector {
    fn detect_objects(&mut self, frame: &Frame) -> Result<Vec<ObjectDetection>, ModelError>;
}
