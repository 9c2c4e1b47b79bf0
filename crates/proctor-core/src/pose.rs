//! Head pose estimation from face landmarks.
//!
//! The estimate is deliberately coarse: the angle of the line through both
//! outer eye corners relative to the image horizontal. A candidate facing
//! the screen keeps that line close to level; turning or tilting the head
//! away rotates it. No camera intrinsics and no 3-D model are involved, so
//! the estimate is cheap enough to run on every frame with any landmarker.

use crate::observation::FaceLandmarks;

/// Turns one face's landmarks into a yaw angle.
pub trait HeadPoseEstimator {
    /// Signed yaw in degrees. Positive rotates toward the image right.
    fn yaw_degrees(&self, landmarks: &FaceLandmarks) -> f32;
}

/// Yaw from the eye-corner line: `atan2(dy, dx)` of right eye minus left eye.
#[derive(Debug, Clone, Copy, Default)]
pub struct EyeLineEstimator;

impl HeadPoseEstimator for EyeLineEstimator {
    fn yaw_degrees(&self, landmarks: &FaceLandmarks) -> f32 {
        let (lx, ly) = landmarks.left_eye;
        let (rx, ry) = landmarks.right_eye;
        (ry - ly).atan2(rx - lx).to_degrees()
    }
}
