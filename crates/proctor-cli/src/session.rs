use std::time::Instant;

use proctor_core::{
    EventSink, FaceLandmarker, FrameSource, ModelError, ObjectDetector, ProctorEvent,
    ReleaseHandle, ScoreSummary, ScoringPolicy,
};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("model failure on frame {frame}: {source}")]
    Model {
        frame: u64,
        #[source]
        source: ModelError,
    },
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session thread exited without reporting")]
    ThreadExited,
}

/// Why the frame loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Threshold,
    Quit,
    Interrupt,
}

/// How a completed session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub reason: StopReason,
    pub summary: ScoreSummary,
    /// Frames pulled from the source and scored.
    pub frames: u64,
}

/// One proctoring run: the scoring state plus every resource it owns.
///
/// [`Session::shutdown`] is the single release path for the event sink and
/// the frame source. It runs once, whether the loop ended normally, was
/// asked to stop, failed, or the session was dropped.
pub struct Session {
    id: String,
    policy: ScoringPolicy,
    source: Box<dyn FrameSource + Send>,
    faces: Box<dyn FaceLandmarker + Send>,
    objects: Box<dyn ObjectDetector + Send>,
    sink: Box<dyn EventSink + Send>,
    frames: u64,
    shut_down: bool,
}

impl Session {
    pub fn new(
        id: String,
        policy: ScoringPolicy,
        source: Box<dyn FrameSource + Send>,
        faces: Box<dyn FaceLandmarker + Send>,
        objects: Box<dyn ObjectDetector + Send>,
        sink: Box<dyn EventSink + Send>,
    ) -> Self {
        Self {
            id,
            policy,
            source,
            faces,
            objects,
            sink,
            frames: 0,
            shut_down: false,
        }
    }

    /// Drive the frame loop to completion, then shut down.
    ///
    /// `stop` is checked before every frame; a frame already in progress is
    /// scored and reported before the request takes effect.
    pub fn run(
        &mut self,
        stop: &watch::Receiver<Option<StopReason>>,
    ) -> Result<SessionOutcome, SessionError> {
        let result = self.run_frames(stop);
        self.shutdown();
        result
    }

    fn run_frames(
        &mut self,
        stop: &watch::Receiver<Option<StopReason>>,
    ) -> Result<SessionOutcome, SessionError> {
        tracing::info!(
            session_id = %self.id,
            threshold = self.policy.config().threshold,
            "proctoring started"
        );

        loop {
            if let Some(reason) = stop_requested(stop) {
                return Ok(self.outcome(reason));
            }

            let Some(frame) = self.source.next_frame() else {
                // A stop request releases the source, which ends the stream.
                if let Some(reason) = stop_requested(stop) {
                    return Ok(self.outcome(reason));
                }
                tracing::info!(frames = self.frames, "frame stream ended");
                return Ok(self.outcome(StopReason::EndOfStream));
            };
            self.frames += 1;

            let faces = self
                .faces
                .detect_faces(&frame)
                .map_err(|source| SessionError::Model {
                    frame: frame.index,
                    source,
                })?;
            let objects = self
                .objects
                .detect_objects(&frame)
                .map_err(|source| SessionError::Model {
                    frame: frame.index,
                    source,
                })?;

            let verdict = self.policy.evaluate(&faces, &objects, Instant::now());
            for signal in &verdict.signals {
                self.sink.emit(ProctorEvent::new(&self.id, signal));
            }

            if verdict.score_delta > 0 {
                tracing::debug!(
                    frame = frame.index,
                    delta = verdict.score_delta,
                    score = self.policy.state().cheating_score,
                    "score updated"
                );
            }

            if verdict.terminated {
                return Ok(self.outcome(StopReason::Threshold));
            }
        }
    }

    /// Hooks that release the source and close the sink from another thread.
    fn release_handles(&self) -> Vec<ReleaseHandle> {
        self.source
            .release_handle()
            .into_iter()
            .chain(self.sink.close_handle())
            .collect()
    }

    fn outcome(&self, reason: StopReason) -> SessionOutcome {
        SessionOutcome {
            reason,
            summary: self.policy.summary(),
            frames: self.frames,
        }
    }

    /// Close the event sink and release the frame source, once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.sink.close();
        self.source.release();
        tracing::info!(session_id = %self.id, "session resources released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_requested(stop: &watch::Receiver<Option<StopReason>>) -> Option<StopReason> {
    let reason = (*stop.borrow())?;
    tracing::info!(reason = ?reason, "stop requested");
    Some(reason)
}

/// Handle to a session running on its own thread.
pub struct SessionHandle {
    stop: watch::Sender<Option<StopReason>>,
    done: oneshot::Receiver<Result<SessionOutcome, SessionError>>,
    releases: Vec<ReleaseHandle>,
}

impl SessionHandle {
    /// Stop the session. Later requests are ignored.
    ///
    /// The loop stops before its next frame. The frame source and the event
    /// sink are released right away, so a loop blocked in a frame read or a
    /// reconnect backoff wakes up; the session's own shutdown then finds
    /// them already released.
    pub fn request_stop(&self, reason: StopReason) {
        let first = self.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            for handle in &self.releases {
                handle.release();
            }
        }
    }

    /// Wait for the session to finish. Cancel-safe.
    pub async fn wait(&mut self) -> Result<SessionOutcome, SessionError> {
        (&mut self.done)
            .await
            .map_err(|_| SessionError::ThreadExited)?
    }
}

/// Run the session on a dedicated OS thread.
///
/// The frame loop is blocking (model calls, reconnect backoff), so it stays
/// off the async runtime; the handle bridges back with channels.
pub fn spawn_session(mut session: Session) -> Result<SessionHandle, SessionError> {
    let (stop_tx, stop_rx) = watch::channel(None);
    let (done_tx, done_rx) = oneshot::channel();
    let releases = session.release_handles();

    std::thread::Builder::new()
        .name("proctor-session".into())
        .spawn(move || {
            tracing::debug!("session thread started");
            let result = session.run(&stop_rx);
            drop(session);
            let _ = done_tx.send(result);
            tracing::debug!("session thread exiting");
        })
        .map_err(SessionError::Spawn)?;

    Ok(SessionHandle {
        stop: stop_tx,
        done: done_rx,
        releases,
    })
}
