//! Per-frame observation types shared by the pipeline stages.

use serde::{Deserialize, Serialize};

/// A 2-D point in normalized image coordinates (`0.0..=1.0` on both axes).
pub type Point = (f32, f32);

/// Face mesh index of the nose tip (468-point MediaPipe topology).
pub const MESH_NOSE_TIP: usize = 1;
/// Face mesh index of the left eye outer corner.
pub const MESH_LEFT_EYE_OUTER: usize = 33;
/// Face mesh index of the right eye outer corner.
pub const MESH_RIGHT_EYE_OUTER: usize = 263;

/// Key landmarks of one detected face.
///
/// Only the points the head pose estimate needs are kept; the full mesh a
/// landmark model produces is reduced with [`FaceLandmarks::from_mesh`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
}

impl FaceLandmarks {
    /// Extract the key points from a full face mesh.
    ///
    /// Returns `None` when the mesh is too short to contain the right eye
    /// corner, i.e. it does not follow the 468-point topology.
    pub fn from_mesh(mesh: &[Point]) -> Option<Self> {
        Some(Self {
            left_eye: *mesh.get(MESH_LEFT_EYE_OUTER)?,
            right_eye: *mesh.get(MESH_RIGHT_EYE_OUTER)?,
            nose: *mesh.get(MESH_NOSE_TIP)?,
        })
    }
}

/// Axis-aligned detection box, serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One object reported by the object detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub label: String,
    /// Detector confidence in `0.0..=1.0`.
    pub confidence: f32,
    #[serde(default)]
    pub bbox: BoundingBox,
}

impl ObjectDetection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox: BoundingBox::default(),
        }
    }
}

/// Everything the stages observed in a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameObservations {
    pub faces: Vec<FaceLandmarks>,
    pub objects: Vec<ObjectDetection>,
}

/// A single frame pulled from a [`crate::FrameSource`].
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Zero-based position in the stream.
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// Raw pixel buffer; layout is defined by the source.
    pub data: Vec<u8>,
    /// Observations recorded alongside the frame by an upstream tool.
    /// Replay stages read these instead of running inference.
    pub prerecorded: Option<FrameObservations>,
}
