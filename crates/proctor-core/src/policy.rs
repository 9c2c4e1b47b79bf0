//! Per-frame scoring and session termination.
//!
//! Each frame's observations are checked against fixed rules in order:
//! face count (none, one, many), head pose for a single face, then every
//! detected object against the forbidden set. Every rule that fires adds
//! its points to the cumulative cheating score and bumps a warning counter.
//! Once the score reaches the threshold the session is flagged and
//! terminated; that transition is one-shot and later frames are ignored.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cooldown::AlertCooldown;
use crate::event::{ScoreSummary, Signal};
use crate::observation::{FaceLandmarks, ObjectDetection};
use crate::pose::{EyeLineEstimator, HeadPoseEstimator};

/// Default termination threshold.
pub const DEFAULT_THRESHOLD: u32 = 10;
/// Termination threshold in strict mode.
pub const STRICT_THRESHOLD: u32 = 5;

/// Labels that count as forbidden objects unless configured otherwise.
pub const DEFAULT_FORBIDDEN_OBJECTS: &[&str] = &[
    "phone",
    "cell phone",
    "book",
    "laptop",
    "tablet",
    "earphone",
    "headphones",
    "notes",
];

#[derive(Error, Debug, PartialEq)]
pub enum PolicyConfigError {
    #[error("threshold must be at least 1")]
    ZeroThreshold,
    #[error("object confidence cutoff must be within 0.0..=1.0, got {0}")]
    ConfidenceOutOfRange(f32),
    #[error("yaw limit must be a positive number of degrees, got {0}")]
    InvalidYawLimit(f32),
}

/// Tunable constants of the scoring rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Score at which the session is flagged and terminated.
    pub threshold: u32,
    /// Absolute yaw (degrees) above which a single face is looking away.
    pub yaw_limit_deg: f32,
    /// Detections at or below this confidence are ignored.
    pub object_min_confidence: f32,
    pub no_face_points: u32,
    pub looking_away_points: u32,
    pub multiple_faces_points: u32,
    /// Points added per qualifying object, counted independently.
    pub object_points: u32,
    /// Labels matched case-insensitively against detector output.
    pub forbidden_objects: Vec<String>,
    /// Minimum spacing between face alerts in milliseconds; 0 disables it.
    pub alert_cooldown_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            yaw_limit_deg: 25.0,
            object_min_confidence: 0.5,
            no_face_points: 1,
            looking_away_points: 1,
            multiple_faces_points: 2,
            object_points: 2,
            forbidden_objects: DEFAULT_FORBIDDEN_OBJECTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            alert_cooldown_ms: 0,
        }
    }
}

impl PolicyConfig {
    /// Default rules with the strict threshold.
    pub fn strict() -> Self {
        Self {
            threshold: STRICT_THRESHOLD,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.threshold == 0 {
            return Err(PolicyConfigError::ZeroThreshold);
        }
        if !(0.0..=1.0).contains(&self.object_min_confidence) {
            return Err(PolicyConfigError::ConfidenceOutOfRange(
                self.object_min_confidence,
            ));
        }
        if self.yaw_limit_deg.is_nan() || self.yaw_limit_deg <= 0.0 {
            return Err(PolicyConfigError::InvalidYawLimit(self.yaw_limit_deg));
        }
        Ok(())
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_millis(self.alert_cooldown_ms)
    }

    fn is_forbidden(&self, label: &str) -> bool {
        let label = label.trim();
        self.forbidden_objects
            .iter()
            .any(|f| f.eq_ignore_ascii_case(label))
    }
}

/// Warning counters by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarningCounts {
    pub no_face: u32,
    pub looking_away: u32,
    pub faces: u32,
    pub objects: u32,
}

/// Cumulative state of one proctoring run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Never decreases within a run.
    pub cheating_score: u32,
    pub warnings: WarningCounts,
    /// Set once the threshold is reached; never cleared.
    pub terminated: bool,
}

/// Outcome of evaluating one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    /// Signals to report, in rule order.
    pub signals: Vec<Signal>,
    /// Points added by this frame.
    pub score_delta: u32,
    /// The session is over; no further frames should be processed.
    pub terminated: bool,
}

/// Applies the scoring rules frame by frame and owns the [`SessionState`].
pub struct ScoringPolicy<P = EyeLineEstimator> {
    config: PolicyConfig,
    pose: P,
    state: SessionState,
    cooldown: AlertCooldown,
}

impl ScoringPolicy<EyeLineEstimator> {
    pub fn new(config: PolicyConfig) -> Self {
        Self::with_estimator(config, EyeLineEstimator)
    }
}

impl<P: HeadPoseEstimator> ScoringPolicy<P> {
    pub fn with_estimator(config: PolicyConfig, pose: P) -> Self {
        let cooldown = AlertCooldown::new(config.alert_cooldown());
        Self {
            config,
            pose,
            state: SessionState::default(),
            cooldown,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn summary(&self) -> ScoreSummary {
        ScoreSummary {
            score: self.state.cheating_score,
            threshold: self.config.threshold,
            warnings: self.state.warnings,
        }
    }

    /// Score one frame's observations.
    ///
    /// After termination this is a no-op that returns a terminated verdict
    /// with no signals.
    pub fn evaluate(
        &mut self,
        faces: &[FaceLandmarks],
        objects: &[ObjectDetection],
        now: Instant,
    ) -> Verdict {
        if self.state.terminated {
            return Verdict {
                terminated: true,
                ..Verdict::default()
            };
        }

        let mut verdict = Verdict::default();

        match faces {
            [] => {
                if self.cooldown.ready(now) {
                    self.cooldown.record_alert(now);
                    self.state.warnings.no_face += 1;
                    self.add(&mut verdict, self.config.no_face_points, Signal::FaceNotDetected);
                }
            }
            [face] => {
                let yaw = self.pose.yaw_degrees(face);
                if yaw.abs() > self.config.yaw_limit_deg && self.cooldown.ready(now) {
                    self.cooldown.record_alert(now);
                    self.state.warnings.looking_away += 1;
                    self.add(
                        &mut verdict,
                        self.config.looking_away_points,
                        Signal::LookingAway { yaw_angle: yaw },
                    );
                }
            }
            many => {
                self.state.warnings.faces += 1;
                self.add(
                    &mut verdict,
                    self.config.multiple_faces_points,
                    Signal::MultipleFacesDetected { count: many.len() },
                );
            }
        }

        for det in objects {
            if det.confidence > self.config.object_min_confidence
                && self.config.is_forbidden(&det.label)
            {
                self.state.warnings.objects += 1;
                self.add(
                    &mut verdict,
                    self.config.object_points,
                    Signal::ObjectDetected {
                        label: det.label.clone(),
                        confidence: det.confidence,
                    },
                );
            }
        }

        if self.state.cheating_score >= self.config.threshold {
            self.state.terminated = true;
            verdict.terminated = true;
            let summary = self.summary();
            tracing::warn!(
                score = summary.score,
                threshold = summary.threshold,
                warnings = ?summary.warnings,
                "cheating threshold reached — terminating session"
            );
            verdict.signals.push(Signal::SessionFlagged(summary.clone()));
            verdict.signals.push(Signal::InterviewTerminated(summary));
        }

        verdict
    }

    fn add(&mut self, verdict: &mut Verdict, points: u32, signal: Signal) {
        self.state.cheating_score = self.state.cheating_score.saturating_add(points);
        verdict.score_delta += points;
        tracing::debug!(
            kind = signal.kind(),
            points,
            score = self.state.cheating_score,
            "rule fired"
        );
        verdict.signals.push(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_at(angle_deg: f32) -> FaceLandmarks {
        let rad = angle_deg.to_radians();
        FaceLandmarks {
            left_eye: (0.4, 0.5),
            right_eye: (0.4 + 0.2 * rad.cos(), 0.5 + 0.2 * rad.sin()),
            nose: (0.5, 0.6),
        }
    }

    fn kinds(v: &Verdict) -> Vec<&'static str> {
        v.signals.iter().map(Signal::kind).collect()
    }

    /// High threshold so rule tests never hit termination.
    fn lenient() -> PolicyConfig {
        PolicyConfig {
            threshold: 1000,
            ..PolicyConfig::default()
        }
    }

    #[test]
    fn test_no_face_counts_once_per_frame() {
        let mut policy = ScoringPolicy::new(lenient());
        let now = Instant::now();
        for _ in 0..7 {
            let v = policy.evaluate(&[], &[], now);
            assert_eq!(kinds(&v), ["face_not_detected"]);
            assert_eq!(v.score_delta, 1);
        }
        assert_eq!(policy.state().cheating_score, 7);
        assert_eq!(policy.state().warnings.no_face, 7);
    }

    #[test]
    fn test_looking_away_sustained() {
        let mut policy = ScoringPolicy::new(lenient());
        let now = Instant::now();
        for i in 1..=4 {
            let v = policy.evaluate(&[face_at(30.0)], &[], now);
            assert_eq!(v.score_delta, 1);
            match &v.signals[..] {
                [Signal::LookingAway { yaw_angle }] => assert!((yaw_angle - 30.0).abs() < 1e-3),
                other => panic!("unexpected signals: {other:?}"),
            }
            assert_eq!(policy.state().cheating_score, i);
            assert_eq!(policy.state().warnings.looking_away, i);
        }
    }

    #[test]
    fn test_facing_forward_is_clean() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(&[face_at(10.0)], &[], Instant::now());
        assert!(v.signals.is_empty());
        assert_eq!(v.score_delta, 0);
    }

    struct FixedYaw(f32);

    impl HeadPoseEstimator for FixedYaw {
        fn yaw_degrees(&self, _landmarks: &FaceLandmarks) -> f32 {
            self.0
        }
    }

    #[test]
    fn test_yaw_limit_is_exclusive() {
        let now = Instant::now();
        let mut at_limit = ScoringPolicy::with_estimator(lenient(), FixedYaw(25.0));
        assert!(at_limit.evaluate(&[face_at(0.0)], &[], now).signals.is_empty());

        let mut past_limit = ScoringPolicy::with_estimator(lenient(), FixedYaw(-25.5));
        let v = past_limit.evaluate(&[face_at(0.0)], &[], now);
        assert_eq!(v.signals, vec![Signal::LookingAway { yaw_angle: -25.5 }]);
    }

    #[test]
    fn test_negative_yaw_counts() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(&[face_at(-40.0)], &[], Instant::now());
        assert_eq!(kinds(&v), ["looking_away"]);
    }

    #[test]
    fn test_multiple_faces_adds_two() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(&[face_at(0.0), face_at(0.0)], &[], Instant::now());
        assert_eq!(v.score_delta, 2);
        assert_eq!(
            v.signals,
            vec![Signal::MultipleFacesDetected { count: 2 }]
        );
        assert_eq!(policy.state().warnings.faces, 1);
    }

    #[test]
    fn test_book_detected() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(
            &[face_at(0.0)],
            &[ObjectDetection::new("book", 0.6)],
            Instant::now(),
        );
        assert_eq!(v.signals.len(), 1);
        match &v.signals[0] {
            Signal::ObjectDetected { label, confidence } => {
                assert_eq!(label, "book");
                assert!((confidence - 0.6).abs() < 1e-6);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert_eq!(v.score_delta, 2);
        assert_eq!(policy.state().warnings.objects, 1);
    }

    #[test]
    fn test_objects_filtered_by_label_and_confidence() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(
            &[face_at(0.0)],
            &[
                ObjectDetection::new("cup", 0.99),
                ObjectDetection::new("phone", 0.5),
                ObjectDetection::new("Laptop", 0.8),
            ],
            Instant::now(),
        );
        // cup is not forbidden, phone sits exactly on the cutoff.
        assert_eq!(kinds(&v), ["object_detected"]);
        assert_eq!(policy.state().warnings.objects, 1);
    }

    #[test]
    fn test_each_object_counts_independently() {
        let mut policy = ScoringPolicy::new(lenient());
        let v = policy.evaluate(
            &[],
            &[
                ObjectDetection::new("phone", 0.9),
                ObjectDetection::new("phone", 0.7),
                ObjectDetection::new("notes", 0.6),
            ],
            Instant::now(),
        );
        assert_eq!(
            kinds(&v),
            ["face_not_detected", "object_detected", "object_detected", "object_detected"]
        );
        assert_eq!(v.score_delta, 1 + 3 * 2);
        assert_eq!(policy.state().warnings.objects, 3);
    }

    #[test]
    fn test_threshold_terminates_once() {
        let mut policy = ScoringPolicy::new(PolicyConfig::default());
        let now = Instant::now();
        for _ in 0..9 {
            assert!(!policy.evaluate(&[], &[], now).terminated);
        }
        let v = policy.evaluate(&[], &[], now);
        assert!(v.terminated);
        assert_eq!(
            kinds(&v),
            ["face_not_detected", "session_flagged", "interview_terminated"]
        );
        match &v.signals[2] {
            Signal::InterviewTerminated(s) => {
                assert_eq!(s.score, 10);
                assert_eq!(s.threshold, 10);
                assert_eq!(s.warnings.no_face, 10);
            }
            other => panic!("unexpected signal: {other:?}"),
        }

        // Terminal: nothing else is scored or reported.
        let after = policy.evaluate(&[], &[ObjectDetection::new("phone", 0.9)], now);
        assert!(after.terminated);
        assert!(after.signals.is_empty());
        assert_eq!(policy.state().cheating_score, 10);
    }

    #[test]
    fn test_strict_threshold() {
        let mut policy = ScoringPolicy::new(PolicyConfig::strict());
        let now = Instant::now();
        policy.evaluate(&[face_at(0.0), face_at(0.0)], &[], now);
        policy.evaluate(&[face_at(0.0), face_at(0.0)], &[], now);
        let v = policy.evaluate(&[], &[], now);
        assert!(v.terminated);
        assert_eq!(policy.state().cheating_score, 5);
    }

    #[test]
    fn test_overshoot_still_terminates() {
        let mut policy = ScoringPolicy::new(PolicyConfig::strict());
        let objects = vec![ObjectDetection::new("phone", 0.9); 4];
        let v = policy.evaluate(&[], &objects, Instant::now());
        assert!(v.terminated);
        assert_eq!(policy.summary().score, 9);
    }

    #[test]
    fn test_score_never_decreases() {
        let mut policy = ScoringPolicy::new(lenient());
        let now = Instant::now();
        let frames: Vec<(Vec<FaceLandmarks>, Vec<ObjectDetection>)> = vec![
            (vec![face_at(0.0)], vec![]),
            (vec![], vec![ObjectDetection::new("book", 0.7)]),
            (vec![face_at(45.0)], vec![]),
            (vec![face_at(0.0), face_at(3.0), face_at(5.0)], vec![]),
            (vec![face_at(0.0)], vec![ObjectDetection::new("cup", 0.9)]),
        ];
        let mut prev = 0;
        for (faces, objects) in &frames {
            policy.evaluate(faces, objects, now);
            assert!(policy.state().cheating_score >= prev);
            prev = policy.state().cheating_score;
        }
        assert_eq!(prev, 6);
    }

    #[test]
    fn test_cooldown_gates_face_alerts_only() {
        let mut policy = ScoringPolicy::new(PolicyConfig {
            threshold: 1000,
            alert_cooldown_ms: 2000,
            ..PolicyConfig::default()
        });
        let t0 = Instant::now();
        assert_eq!(kinds(&policy.evaluate(&[], &[], t0)), ["face_not_detected"]);
        // Within the window: no-face and looking-away are suppressed.
        assert!(policy
            .evaluate(&[], &[], t0 + Duration::from_millis(100))
            .signals
            .is_empty());
        assert!(policy
            .evaluate(&[face_at(60.0)], &[], t0 + Duration::from_millis(200))
            .signals
            .is_empty());
        // Objects are never cooled down.
        let v = policy.evaluate(
            &[face_at(0.0)],
            &[ObjectDetection::new("phone", 0.9)],
            t0 + Duration::from_millis(300),
        );
        assert_eq!(kinds(&v), ["object_detected"]);
        // Window over.
        let v = policy.evaluate(&[face_at(60.0)], &[], t0 + Duration::from_secs(3));
        assert_eq!(kinds(&v), ["looking_away"]);
        assert_eq!(policy.state().warnings.no_face, 1);
        assert_eq!(policy.state().warnings.looking_away, 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = PolicyConfig {
            threshold: 0,
            ..PolicyConfig::default()
        };
        assert_eq!(zero.validate(), Err(PolicyConfigError::ZeroThreshold));

        let conf = PolicyConfig {
            object_min_confidence: 1.5,
            ..PolicyConfig::default()
        };
        assert!(matches!(
            conf.validate(),
            Err(PolicyConfigError::ConfidenceOutOfRange(_))
        ));

        let yaw = PolicyConfig {
            yaw_limit_deg: f32::NAN,
            ..PolicyConfig::default()
        };
        assert!(matches!(
            yaw.validate(),
            Err(PolicyConfigError::InvalidYawLimit(_))
        ));

        assert!(PolicyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_toml_fields() {
        let cfg: PolicyConfig = serde_json::from_str(r#"{"threshold": 7}"#).unwrap();
        assert_eq!(cfg.threshold, 7);
        assert_eq!(cfg.object_points, 2);
        assert!(cfg.is_forbidden("cell phone"));
    }
}
