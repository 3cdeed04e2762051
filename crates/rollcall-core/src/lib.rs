//! rollcall-core — Face recognition attendance engine.
//!
//! Locates a face, rejects spoofs, extracts a FaceNet embedding, matches it
//! against enrolled identities and records one check-in per person per day.
//! Models run via ONNX Runtime; persistence is behind [`AttendanceStore`].

pub mod attendance;
pub mod detector;
pub mod enrollment;
pub mod liveness;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{AttendanceOutcome, AttendanceWindow, Clock, LocalClock};
pub use detector::{FaceLocator, ScrfdDetector};
pub use enrollment::{EnrollError, EnrollOutcome, EnrollRequest, RawFaceStorage};
pub use liveness::{LivenessGate, OnnxLivenessClassifier};
pub use matcher::{EuclideanMatcher, IdentityMatcher, MatchResult};
pub use model::ModelError;
pub use pipeline::{AttendancePipeline, FaceModels, PipelineSettings, Recognition, RecognitionReply, Verdict};
pub use recognizer::{EmbeddingExtractor, FaceNetEncoder};
pub use store::{AttendanceStore, InsertOutcome, StoreError};
pub use types::{
    AttendanceLogEntry, AttendanceRecord, AttendanceStatus, BoundingBox, Embedding, EnrolledFace,
    Identity, IdentitySummary, PercentRect,
};
