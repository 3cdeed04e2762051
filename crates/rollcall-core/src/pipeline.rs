//! Recognition pipeline: locate → liveness → embed → match → attendance.
//!
//! Recognition never fails towards the caller. Decode, model and store errors
//! all degrade to the same "Unknown, no attendance" result. Enrollment is the
//! opposite and surfaces every error.

use crate::attendance::{decide, AttendanceOutcome, AttendanceWindow, Clock, Decision, LocalClock};
use crate::detector::FaceLocator;
use crate::enrollment::{EnrollError, EnrollOutcome, EnrollRequest, EnrollmentAggregator, RawFaceStorage};
use crate::liveness::{LivenessGate, LivenessVerdict, DEFAULT_LIVENESS_THRESHOLD};
use crate::matcher::{EuclideanMatcher, IdentityMatcher};
use crate::model::{crop_face, decode_rgb, ModelError};
use crate::recognizer::EmbeddingExtractor;
use crate::store::{AttendanceStore, InsertOutcome, StoreError};
use crate::types::{AttendanceRecord, PercentRect};
use serde::Serialize;
use thiserror::Error;

/// Label reported for a face that matched nobody.
pub const UNKNOWN_LABEL: &str = "Unknown";
/// Label reported when the liveness gate rejects the face.
pub const SPOOF_LABEL: &str = "FAKE FACE";
/// Attendance message accompanying a spoof rejection.
pub const SPOOF_WARNING: &str = "SPOOF WARNING";

/// Internal failure of one recognition attempt; never leaves [`AttendancePipeline::recognize`].
#[derive(Error, Debug)]
enum RecognizeError {
    #[error("image decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// The three opaque scoring functions. Weights are read-only after load.
pub struct FaceModels {
    pub locator: Box<dyn FaceLocator + Send>,
    pub liveness: Box<dyn LivenessGate + Send>,
    pub extractor: Box<dyn EmbeddingExtractor + Send>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Verdict {
    Match { id: String, full_name: String },
    Unknown,
    Spoof { score: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub verdict: Verdict,
    /// `1 - distance` for a match, 0 otherwise.
    pub confidence: f32,
    pub attendance: Option<AttendanceOutcome>,
    pub bbox: Option<PercentRect>,
}

impl Recognition {
    /// Unknown without a face box; the shape every failure collapses to.
    pub fn unknown() -> Self {
        Self {
            verdict: Verdict::Unknown,
            confidence: 0.0,
            attendance: None,
            bbox: None,
        }
    }

    pub fn label(&self) -> &str {
        match &self.verdict {
            Verdict::Match { full_name, .. } => full_name,
            Verdict::Unknown => UNKNOWN_LABEL,
            Verdict::Spoof { .. } => SPOOF_LABEL,
        }
    }

    pub fn attendance_message(&self) -> &'static str {
        match (&self.verdict, self.attendance) {
            (Verdict::Spoof { .. }, _) => SPOOF_WARNING,
            (_, Some(outcome)) => outcome.message(),
            (_, None) => "",
        }
    }

    pub fn reply(&self) -> RecognitionReply {
        RecognitionReply {
            identity: self.label().to_string(),
            identity_id: match &self.verdict {
                Verdict::Match { id, .. } => Some(id.clone()),
                _ => None,
            },
            confidence: self.confidence,
            attendance_message: self.attendance_message().to_string(),
            bbox: self.bbox,
        }
    }
}

/// Caller-facing shape of a recognition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReply {
    pub identity: String,
    pub identity_id: Option<String>,
    pub confidence: f32,
    pub attendance_message: String,
    pub bbox: Option<PercentRect>,
}

/// Decision thresholds for the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub liveness_threshold: f32,
    pub matcher: EuclideanMatcher,
    pub window: AttendanceWindow,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            matcher: EuclideanMatcher::default(),
            window: AttendanceWindow::default(),
        }
    }
}

pub struct AttendancePipeline {
    models: FaceModels,
    settings: PipelineSettings,
    clock: Box<dyn Clock>,
}

impl AttendancePipeline {
    pub fn new(models: FaceModels, settings: PipelineSettings) -> Self {
        Self::with_clock(models, settings, Box::new(LocalClock))
    }

    pub fn with_clock(models: FaceModels, settings: PipelineSettings, clock: Box<dyn Clock>) -> Self {
        Self {
            models,
            settings,
            clock,
        }
    }

    /// Recognize a camera frame and apply the attendance policy.
    pub fn recognize(&mut self, store: &dyn AttendanceStore, image: &[u8]) -> Recognition {
        match self.try_recognize(store, image) {
            Ok(recognition) => recognition,
            Err(err) => {
                tracing::warn!(error = %err, "recognition failed; reporting unknown");
                Recognition::unknown()
            }
        }
    }

    pub fn enroll(
        &mut self,
        store: &dyn AttendanceStore,
        storage: &RawFaceStorage,
        request: &EnrollRequest,
    ) -> Result<EnrollOutcome, EnrollError> {
        self.enroll_unless(store, storage, request, &|| false)
    }

    /// Enrollment that skips the store write once `abandoned()` holds.
    pub fn enroll_unless(
        &mut self,
        store: &dyn AttendanceStore,
        storage: &RawFaceStorage,
        request: &EnrollRequest,
        abandoned: &dyn Fn() -> bool,
    ) -> Result<EnrollOutcome, EnrollError> {
        EnrollmentAggregator::new(self.models.locator.as_mut(), self.models.extractor.as_mut())
            .enroll_unless(store, storage, request, abandoned)
    }

    fn try_recognize(
        &mut self,
        store: &dyn AttendanceStore,
        image: &[u8],
    ) -> Result<Recognition, RecognizeError> {
        let frame = decode_rgb(image)?;

        let Some(face) = self.models.locator.locate(&frame)? else {
            tracing::debug!("no face in frame");
            return Ok(Recognition::unknown());
        };
        let bbox = Some(face.to_percent(frame.width(), frame.height()));

        let Some(crop) = crop_face(&frame, &face) else {
            tracing::debug!(?face, "face box lies outside the frame");
            return Ok(Recognition::unknown());
        };

        let score = self.models.liveness.score(&crop)?;
        if LivenessVerdict::from_score(score, self.settings.liveness_threshold) == LivenessVerdict::Spoof {
            tracing::warn!(score, "spoof detected");
            return Ok(Recognition {
                verdict: Verdict::Spoof { score },
                confidence: 0.0,
                attendance: None,
                bbox,
            });
        }

        let probe = self.models.extractor.embed(&crop)?;
        let gallery = store.list_enrolled_embeddings()?;
        let matched = self.settings.matcher.find(&probe, &gallery);

        let Some((id, full_name)) = matched.identity.clone() else {
            return Ok(Recognition {
                verdict: Verdict::Unknown,
                confidence: 0.0,
                attendance: None,
                bbox,
            });
        };

        let confidence = matched.confidence();
        let attendance = self.check_in(store, &id, confidence)?;
        tracing::info!(id = %id, confidence, ?attendance, "identity recognized");

        Ok(Recognition {
            verdict: Verdict::Match { id, full_name },
            confidence,
            attendance: Some(attendance),
            bbox,
        })
    }

    fn check_in(
        &self,
        store: &dyn AttendanceStore,
        identity_id: &str,
        confidence: f32,
    ) -> Result<AttendanceOutcome, StoreError> {
        let now = self.clock.now();
        let existing = store.find_attendance(identity_id, now.date())?;

        match decide(existing, &self.settings.window, now.time()) {
            Decision::Existing(status) => Ok(AttendanceOutcome::AlreadyRecorded(status)),
            Decision::Closed => Ok(AttendanceOutcome::WindowClosed),
            Decision::Record(status) => {
                let record = AttendanceRecord {
                    identity_id: identity_id.to_string(),
                    check_in_time: now,
                    confidence,
                    status,
                };
                // A concurrent recognition may have committed first.
                match store.insert_attendance(&record)? {
                    InsertOutcome::Inserted => Ok(AttendanceOutcome::Recorded(status)),
                    InsertOutcome::AlreadyRecorded(stored) => Ok(AttendanceOutcome::AlreadyRecorded(stored)),
                }
            }
        }
    }
}
