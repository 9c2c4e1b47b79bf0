//! Replay backend: feeds recorded observations through the pipeline stages.
//!
//! Input is JSON lines, one frame per line:
//!
//! ```text
//! {"width":640,"height":480,
//!  "faces":[{"left_eye":[0.41,0.40],"right_eye":[0.59,0.41],"nose":[0.5,0.5]}],
//!  "objects":[{"label":"book","confidence":0.62,"bbox":[10,20,110,220]}]}
//! ```
//!
//! A face may instead be given as a full mesh: `{"mesh":[[x,y], ...]}`.
//! Blank lines are skipped. The first unreadable line ends the stream.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proctor_core::{
    FaceLandmarker, FaceLandmarks, Frame, FrameObservations, FrameSource, ModelError,
    ObjectDetection, ObjectDetector, Point, ReleaseHandle,
};
use serde::Deserialize;
use thiserror::Error;

use crate::config::FrameInput;

/// Lines read ahead of the session loop.
const READ_AHEAD: usize = 4;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to open frames: {0}")]
    Open(#[source] io::Error),
    #[error("failed to start frame reader: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to read line {line}: {source}")]
    Read {
        line: u64,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: {source}")]
    Parse {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: face mesh has {points} points, too few for the 468-point layout")]
    ShortMesh { line: u64, points: usize },
}

#[derive(Deserialize)]
struct RecordedFrame {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    faces: Vec<RecordedFace>,
    #[serde(default)]
    objects: Vec<ObjectDetection>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordedFace {
    Keypoints(FaceLandmarks),
    Mesh { mesh: Vec<Point> },
}

/// What the reader thread hands to the session loop.
enum Feed {
    Line { line: u64, text: String },
    Failed(ReplayError),
    End,
    Released,
}

/// [`FrameSource`] over a JSON-lines recording.
///
/// Lines are read on a `proctor-replay` thread, so a blocked read (an idle
/// stdin pipe) never holds up a stop request: the release handle wakes
/// `next_frame` and the reader is left to exit on its own.
pub struct ReplaySource {
    feed: Option<Receiver<Feed>>,
    wake: SyncSender<Feed>,
    released: Arc<AtomicBool>,
    next_index: u64,
    interval: Duration,
    last_frame: Option<Instant>,
}

impl ReplaySource {
    pub fn open(input: &FrameInput, interval: Duration) -> Result<Self, ReplayError> {
        let reader: Box<dyn BufRead + Send> = match input {
            FrameInput::Stdin => Box::new(BufReader::new(io::stdin())),
            FrameInput::File(path) => {
                Box::new(BufReader::new(File::open(path).map_err(ReplayError::Open)?))
            }
        };
        tracing::info!(input = ?input, interval_ms = interval.as_millis() as u64, "replay source opened");
        Self::from_reader(reader, interval)
    }

    pub fn from_reader(
        reader: Box<dyn BufRead + Send>,
        interval: Duration,
    ) -> Result<Self, ReplayError> {
        let (tx, rx) = mpsc::sync_channel(READ_AHEAD);
        let wake = tx.clone();
        std::thread::Builder::new()
            .name("proctor-replay".into())
            .spawn(move || read_lines(reader, tx))
            .map_err(ReplayError::Spawn)?;

        Ok(Self {
            feed: Some(rx),
            wake,
            released: Arc::new(AtomicBool::new(false)),
            next_index: 0,
            interval,
            last_frame: None,
        })
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stop reading; the reader thread exits on its next send.
    fn finish(&mut self) {
        self.feed = None;
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.is_released() {
            return None;
        }
        let feed = self.feed.as_ref()?.recv().ok()?;
        if self.is_released() {
            return None;
        }

        match feed {
            Feed::Line { line, text } => match parse_line(line, &text) {
                Ok(mut frame) => {
                    frame.index = self.next_index;
                    self.next_index += 1;
                    self.pace();
                    Some(frame)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame read failed — ending stream");
                    self.finish();
                    None
                }
            },
            Feed::Failed(e) => {
                tracing::warn!(error = %e, "frame read failed — ending stream");
                self.finish();
                None
            }
            Feed::End | Feed::Released => {
                self.finish();
                None
            }
        }
    }

    fn release(&mut self) {
        self.finish();
        if !self.released.swap(true, Ordering::AcqRel) {
            tracing::info!(frames = self.next_index, "replay source released");
        }
    }

    fn release_handle(&self) -> Option<ReleaseHandle> {
        let released = Arc::clone(&self.released);
        let wake = self.wake.clone();
        Some(ReleaseHandle::new(move || {
            if !released.swap(true, Ordering::AcqRel) {
                // A full queue means the loop is not blocked; it sees the flag.
                let _ = wake.try_send(Feed::Released);
                tracing::info!("replay source released by stop request");
            }
        }))
    }
}

fn read_lines(mut reader: Box<dyn BufRead + Send>, tx: SyncSender<Feed>) {
    let mut line = 0;
    loop {
        let mut text = String::new();
        line += 1;
        let feed = match reader.read_line(&mut text) {
            Ok(0) => Feed::End,
            Ok(_) if text.trim().is_empty() => continue,
            Ok(_) => Feed::Line { line, text },
            Err(source) => Feed::Failed(ReplayError::Read { line, source }),
        };
        let last = !matches!(feed, Feed::Line { .. });
        if tx.send(feed).is_err() || last {
            return;
        }
    }
}

/// Decode one recorded line. The frame index is left for the caller.
fn parse_line(line: u64, text: &str) -> Result<Frame, ReplayError> {
    let recorded: RecordedFrame = serde_json::from_str(text.trim())
        .map_err(|source| ReplayError::Parse { line, source })?;

    let faces = recorded
        .faces
        .into_iter()
        .map(|face| match face {
            RecordedFace::Keypoints(lm) => Ok(lm),
            RecordedFace::Mesh { mesh } => {
                FaceLandmarks::from_mesh(&mesh).ok_or(ReplayError::ShortMesh {
                    line,
                    points: mesh.len(),
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Frame {
        index: 0,
        width: recorded.width,
        height: recorded.height,
        data: Vec::new(),
        prerecorded: Some(FrameObservations {
            faces,
            objects: recorded.objects,
        }),
    })
}

/// Face stage that reports the faces recorded with each frame.
pub struct ReplayFaces;

impl FaceLandmarker for ReplayFaces {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, ModelError> {
        frame
            .prerecorded
            .as_ref()
            .map(|obs| obs.faces.clone())
            .ok_or(ModelError::MissingInput {
                model: "replay-faces",
                frame: frame.index,
            })
    }
}

/// Object stage that reports the objects recorded with each frame.
pub struct ReplayObjects;

impl ObjectDetector for ReplayObjects {
    fn detect_objects(&mut self, frame: &Frame) -> Result<Vec<ObjectDetection>, ModelError> {
        frame
            .prerecorded
            .as_ref()
            .map(|obs| obs.objects.clone())
            .ok_or(ModelError::MissingInput {
                model: "replay-objects",
                frame: frame.index,
            })
    }
}
