//! Core of the proctoring pipeline: per-frame observations, head pose,
//! the scoring policy and the events it produces.
//!
//! Nothing in this crate touches the network or a camera; those live behind
//! the [`FrameSource`], [`FaceLandmarker`], [`ObjectDetector`] and
//! [`EventSink`] traits.

pub mod cooldown;
pub mod event;
pub mod observation;
pub mod policy;
pub mod pose;
pub mod stage;

pub use event::{EventSink, ProctorEvent, ScoreSummary, Signal, PROCTOR_EVENT};
pub use observation::{BoundingBox, FaceLandmarks, Frame, FrameObservations, ObjectDetection, Point};
pub use policy::{
    PolicyConfig, PolicyConfigError, ScoringPolicy, SessionState, Verdict, WarningCounts,
};
pub use pose::{EyeLineEstimator, HeadPoseEstimator};
pub use stage::{FaceLandmarker, FrameSource, ModelError, ObjectDetector, ReleaseHandle};
